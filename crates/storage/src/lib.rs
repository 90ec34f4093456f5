//! PostgreSQL persistence for the pllm gateway.
//!
//! One pool-backed [`PgStore`] serving the auth layer (keys, users,
//! teams), the budget pipeline (budgets, usage logs), and the metrics
//! rollup (per-interval aggregate tables). Queries are explicit sqlx
//! with `FromRow` mappings; schema migrations are managed out of band.

pub mod entities;
pub mod store;

pub use entities::*;
pub use store::{MetricsTable, PgStore, StorageError};
