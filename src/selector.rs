//! Correlated round robin: retry-safe instance rotation.
//!
//! Each logical request (all of its retries) shares one correlation id, and
//! each id owns an atomic position counter. Consecutive selections under the
//! same id advance the counter, so a retry lands on a different instance
//! whenever the candidate set holds at least two. Candidates are sorted by
//! instance id immediately before indexing, because discovery order is not
//! stable between calls and unsorted indexing breaks that guarantee.
//!
//! The counter is keyed on the explicit correlation id and never on thread
//! identity; retries may hop threads, tasks, or reactor stages freely.

use crate::clock::Clock;
use crate::expiry::ExpiringMap;
use crate::instance::ServiceInstance;
use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Identifies one logical request across all of its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(pub u64);

impl CorrelationId {
    /// Synthesize an id when no trace context exists. Rotation then degrades
    /// to single-call granularity, but selection never fails for lack of a
    /// trace.
    pub fn generate() -> Self {
        Self(rand::rng().random())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Counters idle longer than this are evicted; must stay strictly longer
/// than the longest expected request-plus-retries duration.
pub const DEFAULT_POSITION_TTL: Duration = Duration::from_secs(60);

/// Upper bound (exclusive) for freshly seeded counters.
const SEED_RANGE: u64 = 1000;

/// Round-robin selector keyed by correlation id.
pub struct PositionSelector {
    positions: ExpiringMap<CorrelationId, Arc<AtomicU64>>,
}

impl Default for PositionSelector {
    fn default() -> Self {
        Self::new(DEFAULT_POSITION_TTL)
    }
}

impl PositionSelector {
    /// Selector whose counters expire after the given inactivity window.
    pub fn new(position_ttl: Duration) -> Self {
        Self { positions: ExpiringMap::sliding(position_ttl) }
    }

    /// Override the expiry clock (deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.positions = self.positions.with_clock(clock);
        self
    }

    /// Pick one instance for this correlation id, or `None` when the
    /// candidate list is empty, a normal outcome the caller must handle.
    pub fn choose(
        &self,
        mut instances: Vec<ServiceInstance>,
        correlation: CorrelationId,
    ) -> Option<ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        // Random seed per key so fresh ids do not all start at instance 0.
        let counter = self
            .positions
            .get_or_insert_with(correlation, || {
                Arc::new(AtomicU64::new(rand::rng().random_range(0..SEED_RANGE)))
            });
        let seed = counter.fetch_add(1, Ordering::AcqRel);
        let position = (seed % instances.len() as u64) as usize;

        debug!(
            %correlation,
            position,
            seed,
            instances = instances.len(),
            "selected instance"
        );
        Some(instances.swap_remove(position))
    }

    /// Drop counters whose inactivity window has lapsed.
    pub fn evict_idle(&self) {
        self.positions.sweep();
    }

    #[cfg(test)]
    pub(crate) fn tracked_correlations(&self) -> usize {
        self.positions.len()
    }
}
