//! The routing engine: one `call` runs the full attempt pipeline.
//!
//! Per logical request: resolve the retry policy, then for each attempt pick
//! a fresh instance (discovery, zone filter, correlated rotation) and execute
//! against it through the per-instance bulkhead and the per
//! (instance, operation) circuit breaker. Selection is re-run on every
//! attempt so a retry can land on a different instance and so topology
//! changes between attempts are observed.
//!
//! Terminal outcomes keep their shape: a non-success response is returned to
//! the caller as a response, a circuit-open rejection surfaces as a synthetic
//! [`CIRCUIT_BREAKER_ON`](crate::transport::CIRCUIT_BREAKER_ON) response, and
//! transport or capacity failures surface as [`RouteError`].

use crate::breaker::CircuitBreakerConfig;
use crate::clock::Clock;
use crate::error::{AttemptFailure, RouteError};
use crate::instance::{DiscoverySource, ServiceInstance};
use crate::policy::PolicyResolver;
use crate::registry::{BreakerRegistry, BulkheadRegistry};
use crate::selector::{CorrelationId, PositionSelector, DEFAULT_POSITION_TTL};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::transport::{Request, Response, Transport};
use crate::zone::ZoneFilter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default per-instance concurrent call limit.
pub const DEFAULT_MAX_CONCURRENT: usize = 25;

/// Client-side router executing requests against discovered instances.
pub struct Engine<D, T> {
    discovery: D,
    transport: T,
    zone_filter: ZoneFilter,
    selector: PositionSelector,
    resolver: PolicyResolver,
    breakers: BreakerRegistry,
    bulkheads: BulkheadRegistry,
    sleeper: Arc<dyn Sleeper>,
}

/// Builder for [`Engine`]; only discovery and transport are mandatory.
pub struct EngineBuilder<D, T> {
    discovery: D,
    transport: T,
    zone_filter: ZoneFilter,
    resolver: PolicyResolver,
    breaker_config: CircuitBreakerConfig,
    max_concurrent: usize,
    position_ttl: Duration,
    sleeper: Arc<dyn Sleeper>,
    clock: Option<Arc<dyn Clock>>,
}

impl<D: DiscoverySource, T: Transport> EngineBuilder<D, T> {
    pub fn new(discovery: D, transport: T) -> Self {
        Self {
            discovery,
            transport,
            zone_filter: ZoneFilter::passthrough(),
            resolver: PolicyResolver::default(),
            breaker_config: CircuitBreakerConfig::default(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            position_ttl: DEFAULT_POSITION_TTL,
            sleeper: Arc::new(TokioSleeper),
            clock: None,
        }
    }

    /// Restrict selection to instances in the caller's zone.
    pub fn zone(mut self, caller_zone: impl Into<String>) -> Self {
        self.zone_filter = ZoneFilter::new(caller_zone);
        self
    }

    pub fn resolver(mut self, resolver: PolicyResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// Per-instance concurrent call limit.
    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Inactivity window for correlation rotation counters.
    pub fn position_ttl(mut self, ttl: Duration) -> Self {
        self.position_ttl = ttl;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Clock driving breaker open timers and counter expiry (tests).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Engine<D, T> {
        let mut selector = PositionSelector::new(self.position_ttl);
        let mut breakers = BreakerRegistry::new(self.breaker_config);
        if let Some(clock) = self.clock {
            selector = selector.with_clock(clock.clone());
            breakers = breakers.with_clock(clock);
        }
        Engine {
            discovery: self.discovery,
            transport: self.transport,
            zone_filter: self.zone_filter,
            selector,
            resolver: self.resolver,
            breakers,
            bulkheads: BulkheadRegistry::new(self.max_concurrent),
            sleeper: self.sleeper,
        }
    }
}

impl<D: DiscoverySource, T: Transport> Engine<D, T> {
    pub fn builder(discovery: D, transport: T) -> EngineBuilder<D, T> {
        EngineBuilder::new(discovery, transport)
    }

    /// Pick one instance for this correlation id: discovery, zone filter,
    /// correlated rotation. Runs once per attempt, never once per request.
    pub async fn choose(
        &self,
        service: &str,
        correlation: CorrelationId,
    ) -> Result<ServiceInstance, RouteError> {
        let candidates = self.discovery.instances(service).await;
        let eligible = self.zone_filter.filter(candidates);
        self.selector
            .choose(eligible, correlation)
            .ok_or_else(|| RouteError::NoInstanceAvailable { service: service.to_string() })
    }

    /// Execute one logical request against the service, retrying per the
    /// resolved policy. See the module docs for how terminal outcomes map.
    pub async fn call(&self, service: &str, request: &Request) -> Result<Response, RouteError> {
        let correlation = request.correlation.unwrap_or_else(CorrelationId::generate);
        let policy = self.resolver.resolve(service, request);
        let max_attempts = policy.max_attempts();

        let mut attempt = 1;
        loop {
            if attempt > 1 {
                self.sleeper.sleep(policy.delay_before(attempt)).await;
            }

            let instance = self.choose(service, correlation).await?;
            debug!(
                service,
                %correlation,
                attempt,
                instance = %instance.instance_id,
                operation = %request.operation,
                "dispatching attempt"
            );

            let failure = match self.attempt(&instance, request).await {
                Ok(response) => return Ok(response),
                Err(failure) => failure,
            };

            let eligible = policy.should_retry(&failure);
            if eligible && attempt < max_attempts {
                warn!(
                    service,
                    %correlation,
                    attempt,
                    instance = %instance.instance_id,
                    %failure,
                    "attempt failed, retrying"
                );
                attempt += 1;
                continue;
            }

            warn!(
                service,
                %correlation,
                attempt,
                instance = %instance.instance_id,
                %failure,
                "attempt failed, not retrying"
            );
            // Exhaustion wraps the last cause; ineligible failures surface
            // directly.
            return finish(failure, attempt, eligible && max_attempts > 1);
        }
    }

    /// One physical attempt: bulkhead slot, then breaker admission, then the
    /// transport. A non-success response is recorded against the breaker as a
    /// failure before the retry predicate sees it.
    async fn attempt(
        &self,
        instance: &ServiceInstance,
        request: &Request,
    ) -> Result<Response, AttemptFailure> {
        let bulkhead = self.bulkheads.bulkhead(&instance.instance_id);
        let breaker = self.breakers.breaker(&instance.instance_id, &request.operation);

        bulkhead
            .execute(|| async {
                breaker
                    .execute(|| async {
                        let response = self
                            .transport
                            .invoke(instance, request)
                            .await
                            .map_err(AttemptFailure::Transport)?;
                        if response.is_success() {
                            Ok(response)
                        } else {
                            Err(AttemptFailure::Status(response))
                        }
                    })
                    .await
            })
            .await
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Breaker states for every (instance, operation) seen so far.
    pub fn breaker_snapshot(&self) -> Vec<((String, String), crate::breaker::CircuitState)> {
        self.breakers.snapshot()
    }

    /// Drop rotation counters idle past their TTL.
    pub fn evict_idle_counters(&self) {
        self.selector.evict_idle();
    }
}

fn finish(
    failure: AttemptFailure,
    attempts: usize,
    exhausted: bool,
) -> Result<Response, RouteError> {
    let terminal = match failure {
        // Responses stay data; the caller's decoding layer takes over.
        AttemptFailure::Status(response) => return Ok(response),
        // The rejection never left the process; synthesize the out-of-band
        // status so callers observe a response, not an exception path.
        AttemptFailure::CircuitOpen { .. } => {
            return Ok(Response::circuit_open("circuit breaker open"))
        }
        AttemptFailure::Transport(err) => RouteError::Transport(err),
        AttemptFailure::BulkheadFull { in_flight, max } => {
            RouteError::BulkheadFull { in_flight, max }
        }
    };
    if exhausted {
        Err(RouteError::RetryExhausted { attempts, last: Box::new(terminal) })
    } else {
        Err(terminal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{StaticDiscovery, ZONE_METADATA_KEY};
    use crate::policy::RetryPolicy;
    use crate::sleeper::TrackingSleeper;
    use crate::transport::{TransportError, CIRCUIT_BREAKER_ON};
    use async_trait::async_trait;
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;

    /// Transport that replays a fixed script of outcomes and records which
    /// instance served each invocation.
    struct ScriptedTransport {
        outcomes: Mutex<VecDeque<Result<Response, TransportError>>>,
        hits: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(outcomes: Vec<Result<Response, TransportError>>) -> Self {
            Self { outcomes: Mutex::new(outcomes.into()), hits: Mutex::new(Vec::new()) }
        }

        fn always_ok() -> Self {
            Self::new(Vec::new())
        }

        fn hits(&self) -> Vec<String> {
            self.hits.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn invoke(
            &self,
            instance: &ServiceInstance,
            _request: &Request,
        ) -> Result<Response, TransportError> {
            self.hits.lock().unwrap().push(instance.instance_id.clone());
            self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(Response::new(200, "ok")))
        }
    }

    fn instances(ids: &[&str]) -> Vec<ServiceInstance> {
        ids.iter().map(|id| ServiceInstance::new("svc", *id, "10.0.0.1", 8080)).collect()
    }

    fn discovery(ids: &[&str]) -> StaticDiscovery {
        StaticDiscovery::new().with_service("svc", instances(ids))
    }

    fn refused() -> Result<Response, TransportError> {
        Err(TransportError::ConnectRefused { address: "10.0.0.1:8080".into() })
    }

    #[tokio::test]
    async fn successful_call_returns_response() {
        let engine =
            Engine::builder(discovery(&["a", "b"]), ScriptedTransport::always_ok()).build();
        let response = engine.call("svc", &Request::get("read", "/x")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(engine.transport.hits().len(), 1);
    }

    #[tokio::test]
    async fn unknown_service_fails_fast_without_transport() {
        let engine =
            Engine::builder(StaticDiscovery::new(), ScriptedTransport::always_ok()).build();
        let err = engine.call("svc", &Request::get("read", "/x")).await.unwrap_err();
        assert!(err.is_no_instance());
        assert!(engine.transport.hits().is_empty());
    }

    #[tokio::test]
    async fn retries_land_on_distinct_instances() {
        let transport = ScriptedTransport::new(vec![refused(), refused(), refused()]);
        let sleeper = TrackingSleeper::new();
        let engine = Engine::builder(discovery(&["a", "b", "c"]), transport)
            .sleeper(Arc::new(sleeper.clone()))
            .build();

        let err = engine.call("svc", &Request::get("read", "/x")).await.unwrap_err();
        assert!(err.is_retry_exhausted());
        assert!(matches!(err.last_cause(), RouteError::Transport(_)));

        let hits = engine.transport.hits();
        assert_eq!(hits.len(), 3);
        let distinct: HashSet<_> = hits.iter().collect();
        assert_eq!(distinct.len(), 3, "each retry must strike a different instance");
        assert_eq!(sleeper.calls().len(), 2, "waits only between attempts");
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_connect_failure() {
        let transport = ScriptedTransport::new(vec![refused()]);
        let engine = Engine::builder(discovery(&["a", "b"]), transport)
            .sleeper(Arc::new(TrackingSleeper::new()))
            .build();

        let response = engine.call("svc", &Request::get("read", "/x")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(engine.transport.hits().len(), 2);
    }

    #[tokio::test]
    async fn non_retryable_status_is_returned_as_data() {
        let transport = ScriptedTransport::new(vec![Ok(Response::new(404, "not found"))]);
        let engine = Engine::builder(discovery(&["a"]), transport).build();

        let response = engine.call("svc", &Request::get("read", "/x")).await.unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(engine.transport.hits().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_5xx_retries_surface_the_last_response() {
        let transport = ScriptedTransport::new(vec![
            Ok(Response::new(503, "unavailable")),
            Ok(Response::new(503, "unavailable")),
            Ok(Response::new(502, "bad gateway")),
        ]);
        let engine = Engine::builder(discovery(&["a", "b"]), transport)
            .sleeper(Arc::new(TrackingSleeper::new()))
            .build();

        let response = engine.call("svc", &Request::get("read", "/x")).await.unwrap();
        assert_eq!(response.status, 502, "last response wins, as data");
        assert_eq!(engine.transport.hits().len(), 3);
    }

    #[tokio::test]
    async fn unsafe_method_is_not_retried_after_read_timeout() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::ReadTimeout {
            address: "10.0.0.1:8080".into(),
        })]);
        let engine = Engine::builder(discovery(&["a", "b"]), transport).build();

        let err = engine.call("svc", &Request::post("create", "/x")).await.unwrap_err();
        assert!(matches!(err, RouteError::Transport(TransportError::ReadTimeout { .. })));
        assert_eq!(engine.transport.hits().len(), 1, "may already have executed");
    }

    #[tokio::test]
    async fn unsafe_method_is_retried_after_connect_failure() {
        // Connection refused proves nothing was transmitted.
        let transport = ScriptedTransport::new(vec![refused()]);
        let engine = Engine::builder(discovery(&["a", "b"]), transport)
            .sleeper(Arc::new(TrackingSleeper::new()))
            .build();

        let response = engine.call("svc", &Request::post("create", "/x")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(engine.transport.hits().len(), 2);
    }

    #[tokio::test]
    async fn retry_override_restores_read_timeout_retry_for_unsafe_method() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::ReadTimeout {
            address: "10.0.0.1:8080".into(),
        })]);
        let engine = Engine::builder(discovery(&["a", "b"]), transport)
            .sleeper(Arc::new(TrackingSleeper::new()))
            .build();

        let request = Request::post("create", "/x").with_retry_override();
        let response = engine.call("svc", &request).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(engine.transport.hits().len(), 2);
    }

    #[tokio::test]
    async fn open_breaker_surfaces_synthetic_status() {
        let breaker_config = CircuitBreakerConfig::new(
            2,
            2,
            0.5,
            Duration::from_secs(60),
            1,
        )
        .unwrap();
        let transport = ScriptedTransport::new(vec![refused(), refused()]);
        let engine = Engine::builder(discovery(&["a"]), transport)
            .breaker_config(breaker_config)
            .resolver(PolicyResolver::new(RetryPolicy::new(1).unwrap()))
            .build();

        // Two failures trip the single instance's breaker for this operation.
        for _ in 0..2 {
            let _ = engine.call("svc", &Request::get("read", "/x")).await;
        }
        let invoked_before = engine.transport.hits().len();

        let response = engine.call("svc", &Request::get("read", "/x")).await.unwrap();
        assert_eq!(response.status, CIRCUIT_BREAKER_ON);
        assert_eq!(
            engine.transport.hits().len(),
            invoked_before,
            "open circuit must not reach the transport"
        );
    }

    #[tokio::test]
    async fn breakers_are_isolated_per_operation() {
        let breaker_config =
            CircuitBreakerConfig::new(2, 2, 0.5, Duration::from_secs(60), 1).unwrap();
        let transport = ScriptedTransport::new(vec![refused(), refused()]);
        let engine = Engine::builder(discovery(&["a"]), transport)
            .breaker_config(breaker_config)
            .resolver(PolicyResolver::new(RetryPolicy::new(1).unwrap()))
            .build();

        for _ in 0..2 {
            let _ = engine.call("svc", &Request::get("read", "/x")).await;
        }
        // A different operation on the same instance still goes through.
        let response = engine.call("svc", &Request::get("list", "/xs")).await.unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn zero_capacity_bulkhead_rejects_without_retry() {
        let engine = Engine::builder(discovery(&["a"]), ScriptedTransport::always_ok())
            .max_concurrent(0)
            .build();

        let err = engine.call("svc", &Request::get("read", "/x")).await.unwrap_err();
        assert!(err.is_bulkhead());
        assert!(engine.transport.hits().is_empty());
    }

    #[tokio::test]
    async fn zone_filter_excludes_other_zones() {
        let discovery = StaticDiscovery::new().with_service(
            "svc",
            vec![
                ServiceInstance::new("svc", "local", "10.0.0.1", 8080)
                    .with_metadata(ZONE_METADATA_KEY, "zone1"),
                ServiceInstance::new("svc", "remote", "10.0.1.1", 8080)
                    .with_metadata(ZONE_METADATA_KEY, "zone2"),
            ],
        );
        let engine = Engine::builder(discovery, ScriptedTransport::always_ok())
            .zone("zone1")
            .sleeper(Arc::new(TrackingSleeper::new()))
            .build();

        for _ in 0..4 {
            let _ = engine.call("svc", &Request::get("read", "/x")).await.unwrap();
        }
        assert!(engine.transport.hits().iter().all(|id| id == "local"));
    }

    #[tokio::test]
    async fn no_zone_match_fails_fast_never_crosses_zones() {
        let discovery = StaticDiscovery::new().with_service(
            "svc",
            vec![ServiceInstance::new("svc", "remote", "10.0.1.1", 8080)
                .with_metadata(ZONE_METADATA_KEY, "zone2")],
        );
        let engine = Engine::builder(discovery, ScriptedTransport::always_ok())
            .zone("zone1")
            .build();

        let err = engine.call("svc", &Request::get("read", "/x")).await.unwrap_err();
        assert!(err.is_no_instance());
        assert!(engine.transport.hits().is_empty());
    }

    #[tokio::test]
    async fn explicit_correlation_continues_rotation_across_calls() {
        let engine = Engine::builder(discovery(&["a", "b"]), ScriptedTransport::always_ok())
            .build();
        let correlation = CorrelationId(7);

        for _ in 0..4 {
            let request = Request::get("read", "/x").with_correlation(correlation);
            let _ = engine.call("svc", &request).await.unwrap();
        }
        let hits = engine.transport.hits();
        assert_ne!(hits[0], hits[1]);
        assert_ne!(hits[1], hits[2]);
        assert_ne!(hits[2], hits[3]);
    }

    #[tokio::test]
    async fn backoff_delays_grow_between_attempts() {
        let transport = ScriptedTransport::new(vec![refused(), refused(), refused()]);
        let sleeper = TrackingSleeper::new();
        let resolver = PolicyResolver::new(
            RetryPolicy::new(3)
                .unwrap()
                .with_backoff(crate::backoff::Backoff::exponential(Duration::from_millis(100)))
                .with_jitter(crate::jitter::Jitter::None),
        );
        let engine = Engine::builder(discovery(&["a", "b", "c"]), transport)
            .resolver(resolver)
            .sleeper(Arc::new(sleeper.clone()))
            .build();

        let _ = engine.call("svc", &Request::get("read", "/x")).await;
        assert_eq!(
            sleeper.calls(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }
}
