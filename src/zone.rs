//! Zone affinity: callers only ever talk to instances in their own zone.

use crate::instance::ServiceInstance;
use tracing::warn;

/// Restricts a candidate list to the caller's deployment zone.
#[derive(Debug, Clone, Default)]
pub struct ZoneFilter {
    caller_zone: Option<String>,
}

impl ZoneFilter {
    /// Filter for the given caller zone.
    pub fn new(caller_zone: impl Into<String>) -> Self {
        Self { caller_zone: Some(caller_zone.into()) }
    }

    /// No zone configured; candidate lists pass through unchanged.
    pub fn passthrough() -> Self {
        Self { caller_zone: None }
    }

    pub fn caller_zone(&self) -> Option<&str> {
        self.caller_zone.as_deref()
    }

    /// Keep instances whose zone tag case-insensitively equals the caller's.
    ///
    /// An empty result is returned as-is: no eligible instances is a distinct
    /// outcome, and substituting another zone is never acceptable.
    pub fn filter(&self, instances: Vec<ServiceInstance>) -> Vec<ServiceInstance> {
        let Some(zone) = self.caller_zone.as_deref() else {
            return instances;
        };
        let total = instances.len();
        let filtered: Vec<ServiceInstance> = instances
            .into_iter()
            .filter(|instance| {
                instance.zone().map(|tag| tag.eq_ignore_ascii_case(zone)).unwrap_or(false)
            })
            .collect();
        if filtered.is_empty() && total > 0 {
            warn!(zone, candidates = total, "no instances in caller zone");
        }
        filtered
    }
}
