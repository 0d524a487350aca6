//! Clock abstraction used by the circuit breaker and the expiring maps.

use std::time::Instant;

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds elapsed since an arbitrary process-local epoch.
    fn now_millis(&self) -> u64;
}

/// Monotonic clock backed by `Instant::now()`.
///
/// The epoch is the moment the clock was constructed, so values reset on
/// process restart. Breaker open timers and TTL bookkeeping only ever compare
/// differences, which makes that safe.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Clock;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Manually advanced clock shared across handles.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct ManualClock {
        now: Arc<AtomicU64>,
    }

    impl ManualClock {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn advance(&self, millis: u64) {
            self.now.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }
}
