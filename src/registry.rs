//! Engine-owned registries for per-key resilience state.
//!
//! Breakers are keyed per (instance, operation) so one bad endpoint on one
//! instance trips without sidelining the rest; bulkheads are keyed per
//! instance so each target gets its own capacity. State is created lazily on
//! first reference and lives for the life of the registry. Registries are
//! plain engine fields, never process-wide singletons, so tests and multiple
//! engines stay isolated.

use crate::breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState};
use crate::bulkhead::BulkheadPolicy;
use crate::clock::{Clock, MonotonicClock};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Lazily populated table of circuit breakers keyed by (instance, operation).
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<(String, String), CircuitBreakerPolicy>>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Clock handed to every breaker created from here on (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Fetch the breaker for this (instance, operation), creating it on first
    /// reference. Creation is double-checked under the write lock so
    /// concurrent first callers share one breaker.
    pub fn breaker(&self, instance_id: &str, operation: &str) -> CircuitBreakerPolicy {
        let key = (instance_id.to_string(), operation.to_string());
        {
            let guard = self.breakers.read().expect("breaker registry poisoned");
            if let Some(existing) = guard.get(&key) {
                return existing.clone();
            }
        }
        let mut guard = self.breakers.write().expect("breaker registry poisoned");
        guard
            .entry(key)
            .or_insert_with(|| {
                CircuitBreakerPolicy::new(self.config.clone()).with_clock(self.clock.clone())
            })
            .clone()
    }

    /// Breaker states sorted by key, for observability.
    pub fn snapshot(&self) -> Vec<((String, String), CircuitState)> {
        let guard = self.breakers.read().expect("breaker registry poisoned");
        let mut entries: Vec<_> =
            guard.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

/// Lazily populated table of bulkheads keyed by instance id.
pub struct BulkheadRegistry {
    bulkheads: RwLock<HashMap<String, BulkheadPolicy>>,
    max_concurrent: usize,
}

impl BulkheadRegistry {
    pub fn new(max_concurrent: usize) -> Self {
        Self { bulkheads: RwLock::new(HashMap::new()), max_concurrent }
    }

    /// Fetch the bulkhead for this instance, creating it on first reference.
    pub fn bulkhead(&self, instance_id: &str) -> BulkheadPolicy {
        {
            let guard = self.bulkheads.read().expect("bulkhead registry poisoned");
            if let Some(existing) = guard.get(instance_id) {
                return existing.clone();
            }
        }
        let mut guard = self.bulkheads.write().expect("bulkhead registry poisoned");
        guard
            .entry(instance_id.to_string())
            .or_insert_with(|| BulkheadPolicy::new(self.max_concurrent))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn breakers_are_shared_per_instance_operation_pair() {
        let registry = BreakerRegistry::new(CircuitBreakerConfig::default());

        let a1 = registry.breaker("inst-a", "get_user");
        let a2 = registry.breaker("inst-a", "get_user");
        let b = registry.breaker("inst-a", "list_users");
        let c = registry.breaker("inst-b", "get_user");

        assert_eq!(a1.state(), a2.state());
        assert_eq!(registry.snapshot().len(), 3);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(c.state(), CircuitState::Closed);
    }

    #[test]
    fn bulkheads_are_shared_per_instance() {
        let registry = BulkheadRegistry::new(4);
        let a1 = registry.bulkhead("inst-a");
        let a2 = registry.bulkhead("inst-a");
        let b = registry.bulkhead("inst-b");
        assert_eq!(a1.max_concurrent(), 4);
        assert_eq!(a2.max_concurrent(), 4);
        assert_eq!(b.max_concurrent(), 4);
    }

    #[tokio::test]
    async fn concurrent_bulkhead_lookups_share_one_limiter() {
        let registry = Arc::new(BulkheadRegistry::new(1));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let bulkhead = registry.bulkhead("inst-a");
                let _ = bulkhead
                    .execute(|| async {
                        let current = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(current, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // If lookups raced into separate limiters, the peak would exceed 1.
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
