//! Abstraction over waiting between retry attempts.
//!
//! Production code sleeps on the tokio timer; tests swap in `InstantSleeper`
//! or `TrackingSleeper` to stay deterministic and fast.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Abstraction for sleeping between retry attempts.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production sleeper backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test sleeper that returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

/// Test sleeper that records every requested delay without waiting.
#[derive(Debug, Clone)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self { calls: Arc::new(Mutex::new(Vec::new())) }
    }

    /// All delays requested so far, in order.
    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().expect("tracking sleeper poisoned").clone()
    }
}

impl Default for TrackingSleeper {
    fn default() -> Self {
        Self::new()
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.calls.lock().expect("tracking sleeper poisoned").push(duration);
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn instant_sleeper_returns_immediately() {
        let start = std::time::Instant::now();
        InstantSleeper.sleep(Duration::from_secs(10)).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn tracking_sleeper_records_requested_delays() {
        let sleeper = TrackingSleeper::new();
        sleeper.sleep(Duration::from_millis(100)).await;
        sleeper.sleep(Duration::from_millis(250)).await;

        let calls = sleeper.calls();
        assert_eq!(calls, vec![Duration::from_millis(100), Duration::from_millis(250)]);
    }
}
