//! Jitter on retry delays, preventing synchronized retry storms.
//!
//! - `None`: deterministic delays for tests or tightly controlled flows.
//! - `Full`: uniform in `[0, delay]`, good default to spread load.
//! - `Equal`: uniform in `[delay/2, delay]`, keeps a floor under the delay.

use rand::{rng, Rng};
use std::time::Duration;

/// Jitter strategy applied to a computed backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    /// Use the exact backoff delay.
    None,
    /// Random in `[0, delay]`.
    Full,
    /// Random in `[delay/2, delay]`.
    Equal,
}

impl Jitter {
    /// Apply jitter using the thread-local RNG.
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Apply jitter with a caller-provided RNG (deterministic tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis: u64 = delay.as_millis().try_into().unwrap_or(u64::MAX);
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
            Jitter::Equal => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(millis / 2..=millis))
            }
        }
    }
}
