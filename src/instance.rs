//! Service instances and the discovery seam.
//!
//! Discovery itself is an external collaborator; this module only defines the
//! trait the engine consumes, a static in-memory source for tests and fixed
//! topologies, and a TTL-boxed caching wrapper so hot call paths do not hit
//! the registry on every selection.

use crate::clock::Clock;
use crate::expiry::ExpiringMap;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Metadata key carrying an instance's deployment zone.
pub const ZONE_METADATA_KEY: &str = "zone";

/// One live instance of a logical service, as reported by discovery.
///
/// Immutable snapshot value; discovery refreshes produce new instances rather
/// than mutating old ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    /// Logical service this instance belongs to.
    pub service_id: String,
    /// Stable unique identifier, the sort key for deterministic selection.
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    pub fn new(
        service_id: impl Into<String>,
        instance_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            instance_id: instance_id.into(),
            host: host.into(),
            port,
            metadata: HashMap::new(),
        }
    }

    /// Attach a metadata entry (zone tags, version labels, ...).
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Deployment zone tag, if the instance carries one.
    pub fn zone(&self) -> Option<&str> {
        self.metadata.get(ZONE_METADATA_KEY).map(String::as_str)
    }

    /// `host:port` address string.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Source of candidate instances for a logical service name.
///
/// Implementations must return an empty list (never an error) when the
/// service is unknown or has no live instances.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    async fn instances(&self, service_name: &str) -> Vec<ServiceInstance>;
}

/// Fixed in-memory discovery source.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    services: HashMap<String, Vec<ServiceInstance>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(
        mut self,
        service_name: impl Into<String>,
        instances: Vec<ServiceInstance>,
    ) -> Self {
        self.services.insert(service_name.into(), instances);
        self
    }
}

#[async_trait]
impl DiscoverySource for StaticDiscovery {
    async fn instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.services.get(service_name).cloned().unwrap_or_default()
    }
}

/// Time-boxes repeated lookups against an underlying discovery source.
///
/// A cached list is served until its TTL lapses; the next lookup after that
/// refreshes from the delegate. Empty lists are cached too, so a missing
/// service does not hammer the registry.
pub struct CachingDiscovery<D> {
    delegate: D,
    cache: ExpiringMap<String, Arc<Vec<ServiceInstance>>>,
}

impl<D: DiscoverySource> CachingDiscovery<D> {
    pub fn new(delegate: D, ttl: Duration) -> Self {
        Self { delegate, cache: ExpiringMap::new(ttl) }
    }

    /// Override the cache clock (deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.cache = self.cache.with_clock(clock);
        self
    }
}

#[async_trait]
impl<D: DiscoverySource> DiscoverySource for CachingDiscovery<D> {
    async fn instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        if let Some(cached) = self.cache.get(&service_name.to_string()) {
            return cached.as_ref().clone();
        }
        let fresh = Arc::new(self.delegate.instances(service_name).await);
        self.cache.insert(service_name.to_string(), fresh.clone());
        fresh.as_ref().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn inst(id: &str) -> ServiceInstance {
        ServiceInstance::new("svc", id, "10.0.0.1", 8080)
    }

    #[tokio::test]
    async fn static_discovery_returns_empty_for_unknown_service() {
        let discovery = StaticDiscovery::new().with_service("svc", vec![inst("a")]);
        assert_eq!(discovery.instances("svc").await.len(), 1);
        assert!(discovery.instances("missing").await.is_empty());
    }

    #[test]
    fn zone_reads_reserved_metadata_key() {
        let tagged = inst("a").with_metadata(ZONE_METADATA_KEY, "zone1");
        assert_eq!(tagged.zone(), Some("zone1"));
        assert_eq!(inst("b").zone(), None);
    }

    struct CountingDiscovery {
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl DiscoverySource for CountingDiscovery {
        async fn instances(&self, _service_name: &str) -> Vec<ServiceInstance> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            vec![inst("a")]
        }
    }

    #[tokio::test]
    async fn caching_discovery_serves_from_cache_within_ttl() {
        let caching = CachingDiscovery::new(
            CountingDiscovery { lookups: AtomicUsize::new(0) },
            Duration::from_secs(30),
        );

        for _ in 0..5 {
            assert_eq!(caching.instances("svc").await.len(), 1);
        }
        assert_eq!(caching.delegate.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn caching_discovery_refreshes_after_ttl() {
        use crate::clock::test_support::ManualClock;

        let clock = ManualClock::new();
        let caching = CachingDiscovery::new(
            CountingDiscovery { lookups: AtomicUsize::new(0) },
            Duration::from_secs(30),
        )
        .with_clock(Arc::new(clock.clone()));

        let _ = caching.instances("svc").await;
        clock.advance(31_000);
        let _ = caching.instances("svc").await;
        assert_eq!(caching.delegate.lookups.load(Ordering::SeqCst), 2);
    }
}
