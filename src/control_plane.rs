//! Fleet control-plane collaborators.
//!
//! The agent never talks to the service directly; an embedding binary supplies
//! implementations of these traits. Every call the agent makes through them is bounded by
//! [`with_deadline`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::credentials::TemporaryCredential;
use crate::error::ControlPlaneError;
use crate::ids::{QueueId, WorkerId};

/// Mints new worker identities ("create worker").
#[async_trait]
pub trait WorkerRegistrar: Send + Sync {
    async fn register_worker(&self) -> Result<WorkerId, ControlPlaneError>;
}

/// Issues the worker's own temporary role credentials.
#[async_trait]
pub trait FleetRoleProvider: Send + Sync {
    async fn assume_fleet_role(
        &self,
        worker_id: &WorkerId,
    ) -> Result<TemporaryCredential, ControlPlaneError>;
}

/// Issues queue-scoped temporary role credentials.
#[async_trait]
pub trait QueueRoleProvider: Send + Sync {
    async fn assume_queue_role(
        &self,
        queue_id: &QueueId,
    ) -> Result<TemporaryCredential, ControlPlaneError>;
}

/// Retires a worker identity ("delete worker") when the agent shuts down for good.
#[async_trait]
pub trait WorkerDeregistrar: Send + Sync {
    async fn delete_worker(&self, worker_id: &WorkerId) -> Result<(), ControlPlaneError>;
}

/// Bounded exponential backoff for retryable control-plane failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total calls made, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wait before the call following failed attempt number `attempt` (1-based).
    ///
    /// A service-requested delay is honoured even when it exceeds `max_delay`.
    pub fn delay(&self, attempt: u32, requested: Option<Duration>) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let backoff = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        requested.map_or(backoff, |r| r.max(backoff))
    }
}

/// Delete the worker, retrying throttling and internal service errors.
///
/// Every attempt is bounded by `timeout`. Non-retryable errors are returned at once.
pub async fn delete_worker(
    deregistrar: &dyn WorkerDeregistrar,
    worker_id: &WorkerId,
    timeout: Duration,
    retry: RetryPolicy,
) -> Result<(), ControlPlaneError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match with_deadline("DeleteWorker", timeout, deregistrar.delete_worker(worker_id)).await {
            Ok(()) => {
                tracing::info!(worker_id = %worker_id, "Worker deleted");
                return Ok(());
            }
            Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                let delay = retry.delay(attempt, e.retry_after());
                tracing::warn!(
                    worker_id = %worker_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "DeleteWorker failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Run a control-plane call, failing with `DeadlineExceeded` past `timeout`.
pub async fn with_deadline<T, F>(
    operation: &'static str,
    timeout: Duration,
    call: F,
) -> Result<T, ControlPlaneError>
where
    F: Future<Output = Result<T, ControlPlaneError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ControlPlaneError::DeadlineExceeded { operation, timeout }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Replays scripted outcomes, then succeeds.
    struct ScriptedDeregistrar {
        outcomes: Mutex<Vec<ControlPlaneError>>,
        calls: AtomicU32,
    }

    impl ScriptedDeregistrar {
        fn failing_with(outcomes: Vec<ControlPlaneError>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl WorkerDeregistrar for ScriptedDeregistrar {
        async fn delete_worker(&self, _worker_id: &WorkerId) -> Result<(), ControlPlaneError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                Ok(())
            } else {
                Err(outcomes.remove(0))
            }
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn throttled() -> ControlPlaneError {
        ControlPlaneError::Throttled {
            operation: "DeleteWorker",
            retry_after: None,
        }
    }

    fn worker() -> WorkerId {
        WorkerId::new("worker-1").unwrap()
    }

    #[tokio::test]
    async fn deadline_passes_through_fast_calls() {
        let value = with_deadline("Fast", Duration::from_secs(1), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn deadline_cuts_off_slow_calls() {
        let result: Result<(), _> = with_deadline("Slow", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(matches!(
            result,
            Err(ControlPlaneError::DeadlineExceeded { operation: "Slow", .. })
        ));
    }

    // ── Retry policy ───────────────────────────────────────────────

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        };
        assert_eq!(policy.delay(1, None), Duration::from_secs(1));
        assert_eq!(policy.delay(2, None), Duration::from_secs(2));
        assert_eq!(policy.delay(3, None), Duration::from_secs(4));
        assert_eq!(policy.delay(4, None), Duration::from_secs(5));
        assert_eq!(policy.delay(40, None), Duration::from_secs(5));
    }

    #[test]
    fn requested_delay_is_a_floor() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay(1, Some(Duration::from_secs(45))),
            Duration::from_secs(45)
        );
        assert_eq!(
            policy.delay(3, Some(Duration::from_millis(10))),
            Duration::from_secs(4)
        );
    }

    // ── DeleteWorker ───────────────────────────────────────────────

    #[tokio::test]
    async fn delete_worker_retries_throttling_and_service_faults() {
        let deregistrar = ScriptedDeregistrar::failing_with(vec![
            throttled(),
            ControlPlaneError::ServiceFault {
                operation: "DeleteWorker",
                retry_after: Some(Duration::from_millis(2)),
            },
        ]);

        delete_worker(&deregistrar, &worker(), Duration::from_secs(1), fast_retry(5))
            .await
            .unwrap();
        assert_eq!(deregistrar.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn delete_worker_does_not_retry_rejections() {
        let deregistrar = ScriptedDeregistrar::failing_with(vec![ControlPlaneError::RequestFailed {
            operation: "DeleteWorker",
            source: anyhow::anyhow!("AccessDeniedException"),
        }]);

        let err = delete_worker(&deregistrar, &worker(), Duration::from_secs(1), fast_retry(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::RequestFailed { .. }));
        assert_eq!(deregistrar.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delete_worker_gives_up_after_max_attempts() {
        let deregistrar =
            ScriptedDeregistrar::failing_with(vec![throttled(), throttled(), throttled(), throttled()]);

        let err = delete_worker(&deregistrar, &worker(), Duration::from_secs(1), fast_retry(3))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::Throttled { .. }));
        assert_eq!(deregistrar.calls.load(Ordering::SeqCst), 3);
    }
}
