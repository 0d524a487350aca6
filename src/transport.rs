//! Transport seam: the engine never performs byte-level I/O itself.
//!
//! Implementations perform one physical invocation against one instance and
//! normalize their failures into [`TransportError`] so the retry predicate
//! only ever inspects normalized kinds.

use crate::error::FailureKind;
use crate::instance::ServiceInstance;
use crate::selector::CorrelationId;
use async_trait::async_trait;

/// Synthetic out-of-band status signalling a circuit-open rejection.
///
/// Reserved outside the application status range in use so existing response
/// decoding observes a normal response instead of an exception path.
pub const CIRCUIT_BREAKER_ON: u16 = 581;

/// Request method, the static idempotency signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
}

impl Method {
    /// Safe (read-only) methods are retried after ambiguous outcomes.
    pub fn is_safe(&self) -> bool {
        matches!(self, Method::Get | Method::Head)
    }
}

/// One logical outbound request.
#[derive(Debug, Clone)]
pub struct Request {
    /// Stable operation identifier; circuit breakers are keyed per
    /// (instance, operation).
    pub operation: String,
    pub method: Method,
    pub path: String,
    pub body: Vec<u8>,
    /// Trace id shared by all attempts of this logical request. Synthesized
    /// by the engine when absent, at the cost of per-call (rather than
    /// per-request) rotation.
    pub correlation: Option<CorrelationId>,
    /// Explicit per-operation override marking an unsafe method retryable.
    pub retry_override: bool,
}

impl Request {
    pub fn new(method: Method, operation: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            method,
            path: path.into(),
            body: Vec::new(),
            correlation: None,
            retry_override: false,
        }
    }

    pub fn get(operation: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::Get, operation, path)
    }

    pub fn post(operation: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::Post, operation, path)
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn with_correlation(mut self, correlation: CorrelationId) -> Self {
        self.correlation = Some(correlation);
        self
    }

    /// Mark this operation explicitly retryable despite an unsafe method.
    pub fn with_retry_override(mut self) -> Self {
        self.retry_override = true;
        self
    }

    /// Idempotent unless the method is unsafe and no override applies.
    pub fn is_idempotent(&self) -> bool {
        self.method.is_safe()
    }
}

/// Response from one physical invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self { status, reason: reason.into(), body: Vec::new() }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// 2xx statuses count as success for breaker bookkeeping.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Synthetic response surfaced in place of a circuit-open rejection.
    pub fn circuit_open(reason: impl Into<String>) -> Self {
        Self::new(CIRCUIT_BREAKER_ON, reason)
    }
}

/// Normalized transport-level failure.
///
/// Connect-phase failures happen strictly before transmission and are safe to
/// retry for any method; read timeouts may follow partial transmission and
/// are only safe for idempotent requests.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection refused by {address}")]
    ConnectRefused { address: String },
    #[error("connect to {address} timed out")]
    ConnectTimeout { address: String },
    #[error("read from {address} timed out")]
    ReadTimeout { address: String },
    #[error("transport failure: {message}")]
    Other { message: String },
}

impl TransportError {
    /// Normalized kind inspected by retry policies.
    pub fn kind(&self) -> FailureKind {
        match self {
            TransportError::ConnectRefused { .. } => FailureKind::ConnectRefused,
            TransportError::ConnectTimeout { .. } => FailureKind::ConnectTimeout,
            TransportError::ReadTimeout { .. } => FailureKind::ReadTimeout,
            TransportError::Other { .. } => FailureKind::OtherTransport,
        }
    }
}

/// Performs the physical call. The sole suspension point in the engine.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn invoke(
        &self,
        instance: &ServiceInstance,
        request: &Request,
    ) -> Result<Response, TransportError>;
}
