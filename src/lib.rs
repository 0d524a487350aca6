#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Waypoint
//!
//! Client-side request routing with built-in resilience: zone-aware,
//! correlation-keyed round-robin instance selection wrapped in bulkheads,
//! circuit breakers, and idempotency-aware retries.
//!
//! ## Features
//!
//! - **Correlated round robin**: all retries of one logical request rotate
//!   through distinct instances, keyed by trace correlation id
//! - **Zone affinity**: callers only ever reach instances in their own zone
//! - **Circuit breakers** per (instance, operation) with sliding-window
//!   failure rates and half-open recovery
//! - **Bulkheads** per instance for concurrency isolation
//! - **Idempotency-aware retries**: unsafe methods are only retried for
//!   failures that provably happened before transmission
//!
//! ## Quick Start
//!
//! ```rust
//! use waypoint::{Engine, Request, ServiceInstance, StaticDiscovery};
//!
//! # use waypoint::{Response, Transport, TransportError};
//! # struct NoopTransport;
//! # #[async_trait::async_trait]
//! # impl Transport for NoopTransport {
//! #     async fn invoke(
//! #         &self,
//! #         _instance: &ServiceInstance,
//! #         _request: &Request,
//! #     ) -> Result<Response, TransportError> {
//! #         Ok(Response::new(200, "ok"))
//! #     }
//! # }
//! #[tokio::main]
//! async fn main() {
//!     let discovery = StaticDiscovery::new().with_service(
//!         "users",
//!         vec![ServiceInstance::new("users", "users-1", "10.0.0.1", 8080)],
//!     );
//!     let engine = Engine::builder(discovery, NoopTransport).build();
//!
//!     let response = engine.call("users", &Request::get("get_user", "/users/42")).await;
//!     assert!(response.is_ok());
//! }
//! ```

pub mod backoff;
pub mod breaker;
pub mod bulkhead;
pub mod clock;
pub mod engine;
pub mod error;
pub mod expiry;
pub mod instance;
pub mod jitter;
pub mod policy;
pub mod registry;
pub mod selector;
pub mod sleeper;
pub mod transport;
pub mod zone;

// Re-exports
pub use backoff::Backoff;
pub use breaker::{CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerPolicy, CircuitState};
pub use bulkhead::BulkheadPolicy;
pub use clock::{Clock, MonotonicClock};
pub use engine::{Engine, EngineBuilder, DEFAULT_MAX_CONCURRENT};
pub use error::{AttemptFailure, FailureKind, RouteError};
pub use expiry::ExpiringMap;
pub use instance::{
    CachingDiscovery, DiscoverySource, ServiceInstance, StaticDiscovery, ZONE_METADATA_KEY,
};
pub use jitter::Jitter;
pub use policy::{PolicyError, PolicyResolver, RetryPolicy};
pub use registry::{BreakerRegistry, BulkheadRegistry};
pub use selector::{CorrelationId, PositionSelector, DEFAULT_POSITION_TTL};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use transport::{Method, Request, Response, Transport, TransportError, CIRCUIT_BREAKER_ON};
pub use zone::ZoneFilter;
