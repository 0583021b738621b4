//! Process-wide circuit-breaker instances, keyed by name.

use std::sync::{Arc, LazyLock};

use dashmap::DashMap;

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig};

static REGISTRY: LazyLock<DashMap<String, Arc<CircuitBreaker>>> = LazyLock::new(DashMap::new);

/// Fetch the circuit breaker for `name`, creating it on first use.
///
/// A subsequent call with the same name returns the existing instance and
/// ignores `config`.
pub fn get_or_create(name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
    let entry = REGISTRY
        .entry(name.to_owned())
        .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)));
    Arc::clone(entry.value())
}

/// Look up an existing circuit breaker by name.
pub fn get(name: &str) -> Option<Arc<CircuitBreaker>> {
    REGISTRY.get(name).map(|entry| Arc::clone(entry.value()))
}

/// All registered circuit breakers, in name order.
pub fn all() -> Vec<Arc<CircuitBreaker>> {
    let mut breakers: Vec<Arc<CircuitBreaker>> = REGISTRY
        .iter()
        .map(|entry| Arc::clone(entry.value()))
        .collect();
    breakers.sort_by(|a, b| a.name().cmp(b.name()));
    breakers
}

/// Drop every registered circuit breaker.
///
/// Intended for test isolation; existing `Arc` handles keep working but are
/// no longer shared with new lookups.
pub fn clear() {
    REGISTRY.clear();
}
