//! Instance profile gate.
//!
//! Session processes on a cloud instance can read the instance profile's credentials from the
//! metadata service, bypassing queue-scoped roles. Unless explicitly allowed, startup waits for
//! the profile to be disassociated and gives up after a bounded wait.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::IdentityError;

/// Reports whether an instance profile is associated with the current host.
#[async_trait]
pub trait InstanceProfileProbe: Send + Sync {
    /// `Some(true)` while a profile is attached, `Some(false)` when none is, `None` when the
    /// answer could not be determined within `timeout`.
    async fn instance_profile_attached(&self, timeout: Duration) -> Option<bool>;
}

/// Poll until no instance profile is attached, for at most `wait`.
///
/// An undetermined answer counts as attached.
pub async fn await_profile_detached(
    probe: &dyn InstanceProfileProbe,
    probe_timeout: Duration,
    wait: Duration,
    interval: Duration,
) -> Result<(), IdentityError> {
    let started = Instant::now();
    loop {
        match probe.instance_profile_attached(probe_timeout).await {
            Some(false) => {
                tracing::debug!("No instance profile attached");
                return Ok(());
            }
            Some(true) => {
                tracing::info!("Instance profile is attached; waiting for it to be disassociated");
            }
            None => {
                tracing::info!("Could not determine instance profile state; checking again");
            }
        }

        let waited = started.elapsed();
        if waited >= wait {
            tracing::error!(waited_ms = waited.as_millis() as u64, "Instance profile still attached");
            return Err(IdentityError::InstanceProfileAttached { waited });
        }
        tokio::time::sleep(interval.min(wait - waited)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers from a script; the last answer repeats forever.
    struct ScriptedProfile {
        answers: Mutex<Vec<Option<bool>>>,
        checks: AtomicUsize,
    }

    impl ScriptedProfile {
        fn new(answers: &[Option<bool>]) -> Self {
            Self {
                answers: Mutex::new(answers.to_vec()),
                checks: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl InstanceProfileProbe for ScriptedProfile {
        async fn instance_profile_attached(&self, _timeout: Duration) -> Option<bool> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            let mut answers = self.answers.lock().unwrap();
            if answers.len() > 1 {
                answers.remove(0)
            } else {
                answers[0]
            }
        }
    }

    const PROBE_TIMEOUT: Duration = Duration::from_millis(100);
    const INTERVAL: Duration = Duration::from_millis(5);

    #[tokio::test]
    async fn detached_host_passes_immediately() {
        let probe = ScriptedProfile::new(&[Some(false)]);
        await_profile_detached(&probe, PROBE_TIMEOUT, Duration::from_secs(5), INTERVAL)
            .await
            .unwrap();
        assert_eq!(probe.checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn waits_until_profile_is_disassociated() {
        let probe = ScriptedProfile::new(&[Some(true), None, Some(true), Some(false)]);
        await_profile_detached(&probe, PROBE_TIMEOUT, Duration::from_secs(5), INTERVAL)
            .await
            .unwrap();
        assert_eq!(probe.checks.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn gives_up_when_profile_stays_attached() {
        let probe = ScriptedProfile::new(&[Some(true)]);
        let err = await_profile_detached(&probe, PROBE_TIMEOUT, Duration::from_millis(40), INTERVAL)
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::InstanceProfileAttached { .. }));
        assert!(probe.checks.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn undetermined_state_is_not_treated_as_detached() {
        let probe = ScriptedProfile::new(&[None]);
        let err = await_profile_detached(&probe, PROBE_TIMEOUT, Duration::from_millis(20), INTERVAL)
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::InstanceProfileAttached { .. }));
    }
}
