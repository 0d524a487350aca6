//! Retry policies and their per-request resolution.
//!
//! A [`RetryPolicy`] names how many attempts a logical request gets, how the
//! engine waits between them, and which failures are worth another try.
//! Eligibility is decided per request: unsafe methods are narrowed to
//! failures that provably happened before transmission, so a request that may
//! already have executed on the server is never silently re-sent.

use crate::backoff::Backoff;
use crate::error::{AttemptFailure, FailureKind};
use crate::jitter::Jitter;
use crate::transport::Request;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Policy configuration rejected before any request runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("max_attempts must be at least 1, got {0}")]
    ZeroAttempts(usize),
}

/// Retry budget and eligibility for one logical request.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    retryable_kinds: HashSet<FailureKind>,
    retryable_statuses: HashSet<u16>,
    idempotent: bool,
}

impl Default for RetryPolicy {
    /// Three attempts, exponential backoff from 100ms with full jitter.
    /// Connect failures, read timeouts, and breaker rejections are eligible,
    /// as is any 5xx response.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_millis(100)),
            jitter: Jitter::Full,
            retryable_kinds: HashSet::from([
                FailureKind::ConnectRefused,
                FailureKind::ConnectTimeout,
                FailureKind::ReadTimeout,
                FailureKind::CircuitOpen,
            ]),
            retryable_statuses: (500..=599).collect(),
            idempotent: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize) -> Result<Self, PolicyError> {
        if max_attempts == 0 {
            return Err(PolicyError::ZeroAttempts(max_attempts));
        }
        Ok(Self { max_attempts, ..Self::default() })
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retryable_kinds(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.retryable_kinds = kinds.into_iter().collect();
        self
    }

    pub fn with_retryable_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_statuses = statuses.into_iter().collect();
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Whether the request this policy was resolved for may be replayed
    /// after ambiguous outcomes.
    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    /// Jittered delay before attempt `attempt` (1-based; attempt 1 never
    /// waits).
    pub fn delay_before(&self, attempt: usize) -> Duration {
        self.jitter.apply(self.backoff.delay(attempt.saturating_sub(1)))
    }

    /// Whether this failure is worth another attempt under this policy.
    pub fn should_retry(&self, failure: &AttemptFailure) -> bool {
        match failure.kind() {
            Some(kind) => self.retryable_kinds.contains(&kind),
            None => failure
                .status()
                .map(|status| self.retryable_statuses.contains(&status))
                .unwrap_or(false),
        }
    }

    /// Narrow eligibility to failures that happened strictly before the
    /// request was transmitted. Status sets are cleared outright: a response
    /// proves the server saw the request.
    fn narrowed_to(&self, pre_transmission: &HashSet<FailureKind>) -> Self {
        Self {
            retryable_kinds: self.retryable_kinds.intersection(pre_transmission).copied().collect(),
            retryable_statuses: HashSet::new(),
            idempotent: false,
            ..self.clone()
        }
    }
}

/// Resolves the effective policy for each request.
///
/// Services fall back to the default policy unless one was registered for
/// them. Requests with unsafe methods get the narrowed form of their base
/// policy, unless the request carries an explicit retry override.
pub struct PolicyResolver {
    default_policy: RetryPolicy,
    per_service: HashMap<String, RetryPolicy>,
    pre_transmission_kinds: HashSet<FailureKind>,
}

impl Default for PolicyResolver {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl PolicyResolver {
    pub fn new(default_policy: RetryPolicy) -> Self {
        Self {
            default_policy,
            per_service: HashMap::new(),
            // Bulkhead rejections survive narrowing only when the base
            // policy opted into retrying them; the default base never does.
            pre_transmission_kinds: FailureKind::ALL
                .iter()
                .copied()
                .filter(FailureKind::is_pre_transmission)
                .collect(),
        }
    }

    pub fn with_service_policy(mut self, service: impl Into<String>, policy: RetryPolicy) -> Self {
        self.per_service.insert(service.into(), policy);
        self
    }

    /// Replace the set of failure kinds considered pre-transmission when
    /// narrowing policies for unsafe methods.
    pub fn with_pre_transmission_kinds(
        mut self,
        kinds: impl IntoIterator<Item = FailureKind>,
    ) -> Self {
        self.pre_transmission_kinds = kinds.into_iter().collect();
        self
    }

    /// Effective policy for this request against this service.
    pub fn resolve(&self, service: &str, request: &Request) -> RetryPolicy {
        let base = self.per_service.get(service).unwrap_or(&self.default_policy);
        if request.is_idempotent() || request.retry_override {
            base.clone()
        } else {
            base.narrowed_to(&self.pre_transmission_kinds)
        }
    }
}
