//! Circuit breakers for calls to unreliable collaborators.
//!
//! A [`CircuitBreaker`] counts consecutive failures of a guarded region,
//! short-circuits callers once a threshold is crossed, probes recovery after
//! a timed open period, and exposes live metrics. Instances are usually
//! shared process-wide through the [`registry`].

pub mod breaker;
pub mod registry;

pub use breaker::{
    CallError, CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError,
    CircuitBreakerFromThread, CircuitBreakerMetrics, CircuitState, LastError,
};
