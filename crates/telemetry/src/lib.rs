//! Pricing, per-request events, and metrics aggregation.
//!
//! The pricing catalog answers `model → per-token costs` with layered
//! default/config/db overrides; the event emitter appends one record per
//! completed request to a capped Redis stream; the rollup worker folds
//! those into hourly/daily aggregate rows; the Prometheus registry
//! serves `GET /metrics`.

pub mod events;
pub mod metrics;
pub mod pricing;
pub mod rollup;

pub use events::EventEmitter;
pub use metrics::GatewayMetrics;
pub use pricing::{
    CostBreakdown, PricingCatalog, PricingEntry, PricingMirror, PricingOverride, PricingSource,
};
pub use rollup::RollupWorker;
