//! Backoff schedules for the retry loop.
//!
//! Attempt semantics: attempt index `0` is the initial call (no delay);
//! retries start at `attempt = 1`. Computations that would overflow saturate
//! at [`MAX_BACKOFF`].

use std::fmt;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffError {
    /// `with_max`/`with_multiplier` only apply to exponential backoff.
    ConstantDoesNotSupportOption,
    /// The cap must be greater than zero.
    MaxMustBePositive,
    /// The cap must not be smaller than the initial delay.
    MaxLessThanInitial { initial: Duration, max: Duration },
    /// The growth factor must be finite and >= 1.0.
    InvalidMultiplier(f64),
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::ConstantDoesNotSupportOption => {
                write!(f, "with_max/with_multiplier are only valid for exponential backoff")
            }
            BackoffError::MaxMustBePositive => write!(f, "max must be greater than zero"),
            BackoffError::MaxLessThanInitial { initial, max } => {
                write!(f, "max ({:?}) must be >= initial ({:?})", max, initial)
            }
            BackoffError::InvalidMultiplier(m) => {
                write!(f, "multiplier must be finite and >= 1.0 (got {})", m)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

#[derive(Debug, Clone, PartialEq)]
enum BackoffKind {
    Constant { delay: Duration },
    Exponential { initial: Duration, multiplier: f64, max: Option<Duration> },
}

/// Delay schedule between retry attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    kind: BackoffKind,
}

impl Backoff {
    /// Same delay before every retry.
    pub fn constant(delay: Duration) -> Self {
        Self { kind: BackoffKind::Constant { delay } }
    }

    /// Exponential backoff: `initial * multiplier^(attempt - 1)`.
    /// The multiplier defaults to 2.0.
    pub fn exponential(initial: Duration) -> Self {
        Self { kind: BackoffKind::Exponential { initial, multiplier: 2.0, max: None } }
    }

    /// Override the exponential growth factor. Must be finite and >= 1.0.
    pub fn with_multiplier(mut self, multiplier: f64) -> Result<Self, BackoffError> {
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(BackoffError::InvalidMultiplier(multiplier));
        }
        match &mut self.kind {
            BackoffKind::Exponential { multiplier: existing, .. } => {
                *existing = multiplier;
                Ok(self)
            }
            BackoffKind::Constant { .. } => Err(BackoffError::ConstantDoesNotSupportOption),
        }
    }

    /// Cap the exponential delay. Must be positive and >= the initial delay.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        match &mut self.kind {
            BackoffKind::Exponential { initial, max: existing, .. } => {
                if max < *initial {
                    return Err(BackoffError::MaxLessThanInitial { initial: *initial, max });
                }
                *existing = Some(max);
                Ok(self)
            }
            BackoffKind::Constant { .. } => Err(BackoffError::ConstantDoesNotSupportOption),
        }
    }

    /// Delay before the given attempt (0-based; 0 = initial call, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match &self.kind {
            BackoffKind::Constant { delay } => *delay,
            BackoffKind::Exponential { initial, multiplier, max } => {
                let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as i32;
                let factor = multiplier.powi(exponent);
                let nanos = (initial.as_nanos() as f64) * factor;
                let raw = if nanos.is_finite() && nanos < MAX_BACKOFF.as_nanos() as f64 {
                    Duration::from_nanos(nanos as u64)
                } else {
                    MAX_BACKOFF
                };
                let capped = max.map(|m| raw.min(m)).unwrap_or(raw);
                capped.min(MAX_BACKOFF)
            }
        }
    }
}
