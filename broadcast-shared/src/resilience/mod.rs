//! # Resilience
//!
//! Circuit breaker + bulkhead primitives guarding the `UserService` call in
//! the Targeting Service.

mod behavior;
mod breaker;
mod bulkhead;
mod metrics;

pub use behavior::CircuitBreakerBehavior;
pub use breaker::{CircuitBreaker, CircuitBreakerRuntimeConfig, CircuitState};
pub use bulkhead::{Bulkhead, BulkheadPermit};
pub use metrics::{CircuitBreakerMetrics, MetricsCollector, PrometheusMetricsExporter};
