//! Per-instance concurrency limiting.
//!
//! One bulkhead per target instance isolates capacity: a stalled dependency
//! saturates its own limiter, never the shared caller. At capacity the call
//! is rejected immediately; queueing or retrying resource exhaustion would
//! only amplify it.

use crate::error::AttemptFailure;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Bounded concurrency limiter for one target instance.
#[derive(Debug, Clone)]
pub struct BulkheadPolicy {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl BulkheadPolicy {
    pub fn new(max_concurrent: usize) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(max_concurrent)), max_concurrent }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Run the operation inside a slot, rejecting immediately at capacity.
    /// The slot is released on every exit path, including panics, because the
    /// permit guard drops with the stack frame.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, AttemptFailure>
    where
        T: Send,
        Fut: Future<Output = Result<T, AttemptFailure>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let permit = self.semaphore.try_acquire().map_err(|_| AttemptFailure::BulkheadFull {
            in_flight: self.max_concurrent - self.semaphore.available_permits(),
            max: self.max_concurrent,
        })?;

        let result = operation().await;
        drop(permit);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Response;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn sequential_operations_all_run() {
        let bulkhead = BulkheadPolicy::new(2);
        for _ in 0..5 {
            let result = bulkhead.execute(|| async { Ok(Response::new(200, "ok")) }).await;
            assert!(result.is_ok());
        }
    }

    #[tokio::test]
    async fn rejects_immediately_at_capacity() {
        let bulkhead = BulkheadPolicy::new(1);
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let holder = {
            let bulkhead = bulkhead.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                bulkhead
                    .execute(|| async move {
                        barrier.wait().await;
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(Response::new(200, "ok"))
                    })
                    .await
            })
        };

        barrier.wait().await;
        let rejected = bulkhead.execute(|| async { Ok(Response::new(200, "ok")) }).await;
        match rejected {
            Err(AttemptFailure::BulkheadFull { in_flight, max }) => {
                assert_eq!((in_flight, max), (1, 1));
            }
            other => panic!("expected bulkhead rejection, got {:?}", other),
        }

        assert!(holder.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn slot_released_after_failure() {
        let bulkhead = BulkheadPolicy::new(1);
        let _ = bulkhead
            .execute(|| async {
                Err::<Response, _>(AttemptFailure::Transport(
                    crate::transport::TransportError::Other { message: "boom".into() },
                ))
            })
            .await;

        // Capacity must be back regardless of outcome.
        let result = bulkhead.execute(|| async { Ok(Response::new(200, "ok")) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_limit() {
        let bulkhead = BulkheadPolicy::new(3);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let bulkhead = bulkhead.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                bulkhead
                    .execute(|| async move {
                        let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(current, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(Response::new(200, "ok"))
                    })
                    .await
            }));
        }
        let outcomes = futures::future::join_all(handles).await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
        let accepted = outcomes.iter().filter(|r| r.as_ref().unwrap().is_ok()).count();
        let rejected = outcomes
            .iter()
            .filter(|r| {
                matches!(r.as_ref().unwrap(), Err(AttemptFailure::BulkheadFull { .. }))
            })
            .count();
        assert_eq!(accepted + rejected, 10);
    }
}
