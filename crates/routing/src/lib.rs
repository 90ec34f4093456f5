//! Model registry, router, and circuit breakers for the pllm gateway.
//!
//! The registry owns instances by stable ID (handlers pass IDs and Arcs,
//! never raw pointers); the router picks an instance for a logical model
//! according to the configured strategy, health, rate-limit windows,
//! breaker state, and fallback chains.

pub mod breaker;
pub mod registry;
pub mod router;

pub use breaker::{BreakerState, CircuitBreaker};
pub use registry::{InstanceSnapshot, ModelRegistry, RegisteredInstance};
pub use router::{Router, RouterSettings, Selection, Strategy};
