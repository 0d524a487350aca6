//! Failure taxonomy for routing and execution.
//!
//! Transport failures are normalized before any retry decision, so policies
//! match on [`FailureKind`] plus status sets and never on implementation
//! exception types.

use crate::transport::{Response, TransportError};
use std::fmt;
use std::time::Duration;

/// Normalized failure kind, the unit retry policies reason about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Connection refused; the request was never transmitted.
    ConnectRefused,
    /// Connect phase timed out; the request was never transmitted.
    ConnectTimeout,
    /// Read timed out; the request may have been partially or fully processed.
    ReadTimeout,
    /// Rejected locally by an open circuit breaker; pre-transmission.
    CircuitOpen,
    /// Rejected locally by a full bulkhead; pre-transmission.
    BulkheadFull,
    /// Any other transport failure.
    OtherTransport,
}

impl FailureKind {
    /// Every failure kind, in declaration order.
    pub const ALL: [FailureKind; 6] = [
        FailureKind::ConnectRefused,
        FailureKind::ConnectTimeout,
        FailureKind::ReadTimeout,
        FailureKind::CircuitOpen,
        FailureKind::BulkheadFull,
        FailureKind::OtherTransport,
    ];

    /// Kinds that occur strictly before the request leaves the process.
    pub fn is_pre_transmission(&self) -> bool {
        matches!(
            self,
            FailureKind::ConnectRefused
                | FailureKind::ConnectTimeout
                | FailureKind::CircuitOpen
                | FailureKind::BulkheadFull
        )
    }
}

/// Outcome of one failed attempt, inspected by the retry predicate.
#[derive(Debug, Clone)]
pub enum AttemptFailure {
    /// The transport failed outright.
    Transport(TransportError),
    /// The transport produced a response the policy counts as a failure.
    Status(Response),
    /// The breaker rejected the call without invoking the transport.
    CircuitOpen { open_for: Duration },
    /// The per-instance bulkhead was at capacity.
    BulkheadFull { in_flight: usize, max: usize },
}

impl AttemptFailure {
    /// Normalized kind, `None` for status failures (matched by status set).
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            AttemptFailure::Transport(e) => Some(e.kind()),
            AttemptFailure::Status(_) => None,
            AttemptFailure::CircuitOpen { .. } => Some(FailureKind::CircuitOpen),
            AttemptFailure::BulkheadFull { .. } => Some(FailureKind::BulkheadFull),
        }
    }

    /// Status code for status failures.
    pub fn status(&self) -> Option<u16> {
        match self {
            AttemptFailure::Status(resp) => Some(resp.status),
            _ => None,
        }
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::Transport(e) => write!(f, "{}", e),
            AttemptFailure::Status(resp) => {
                write!(f, "non-success status {} ({})", resp.status, resp.reason)
            }
            AttemptFailure::CircuitOpen { open_for } => {
                write!(f, "circuit breaker open (for {:?})", open_for)
            }
            AttemptFailure::BulkheadFull { in_flight, max } => {
                write!(f, "bulkhead full ({} in-flight, max {})", in_flight, max)
            }
        }
    }
}

/// Terminal routing/execution failure surfaced to the caller.
///
/// Non-success responses are deliberately absent: when they are not retried
/// (or retries are exhausted) they are returned to the caller as data, so the
/// caller's decoding layer decides further handling.
#[derive(Debug, Clone)]
pub enum RouteError {
    /// Zero eligible instances after discovery and zone filtering. A normal
    /// outcome, distinct from "service unknown"; the caller may fail fast.
    NoInstanceAvailable { service: String },
    /// Resource exhaustion on the selected instance; not retried by default
    /// so the exhaustion is not amplified.
    BulkheadFull { in_flight: usize, max: usize },
    /// Transport failure that was not retry-eligible.
    Transport(TransportError),
    /// All attempts consumed; carries the last underlying cause.
    RetryExhausted { attempts: usize, last: Box<RouteError> },
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::NoInstanceAvailable { service } => {
                write!(f, "no instances available for service '{}'", service)
            }
            RouteError::BulkheadFull { in_flight, max } => {
                write!(f, "bulkhead rejected request ({} in-flight, max {})", in_flight, max)
            }
            RouteError::Transport(e) => write!(f, "{}", e),
            RouteError::RetryExhausted { attempts, last } => {
                write!(f, "retry exhausted after {} attempts; last failure: {}", attempts, last)
            }
        }
    }
}

impl std::error::Error for RouteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RouteError::Transport(e) => Some(e),
            RouteError::RetryExhausted { last, .. } => Some(last.as_ref()),
            _ => None,
        }
    }
}

impl RouteError {
    pub fn is_no_instance(&self) -> bool {
        matches!(self, Self::NoInstanceAvailable { .. })
    }

    pub fn is_bulkhead(&self) -> bool {
        matches!(self, Self::BulkheadFull { .. })
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    /// The innermost failure, unwrapping retry exhaustion.
    pub fn last_cause(&self) -> &RouteError {
        match self {
            Self::RetryExhausted { last, .. } => last.last_cause(),
            other => other,
        }
    }
}
