//! Budget admission and usage reconciliation.
//!
//! The hot path is a Redis read with a one-second hard deadline that
//! fails open; durable truth lives in SQL and is written only by the
//! batch reconciliation worker draining the usage queue.

pub mod cache;
pub mod estimate;
pub mod queue;
pub mod worker;

pub use cache::{AdmissionDecision, BudgetCache, CachedBudget};
pub use estimate::estimate_cost;
pub use queue::{QueuedUsage, UsageQueue};
pub use worker::ReconciliationWorker;
