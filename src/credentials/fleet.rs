//! The worker's own role credentials.
//!
//! Persisted at `credentials/<worker_id>.json` so a restart inside the validity window does
//! not need a network round-trip.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::control_plane::{FleetRoleProvider, with_deadline};
use crate::credentials::cache::{Cached, CredentialCache, FallbackPolicy};
use crate::credentials::types::{Expiring, FleetCredential};
use crate::error::{CredentialError, FileStoreError};
use crate::fs;
use crate::ids::WorkerId;
use crate::layout::PersistenceLayout;

/// Obtains, persists and hands out fleet credentials for one worker.
pub struct FleetCredentialManager {
    worker_id: WorkerId,
    path: PathBuf,
    provider: Arc<dyn FleetRoleProvider>,
    cache: CredentialCache<FleetCredential>,
    refresh_margin: Duration,
    call_timeout: Duration,
}

impl FleetCredentialManager {
    /// Create a manager persisting to `credentials/<worker_id>.json` under `layout`.
    pub fn new(
        layout: &PersistenceLayout,
        worker_id: WorkerId,
        provider: Arc<dyn FleetRoleProvider>,
        refresh_margin: Duration,
        call_timeout: Duration,
        policy: FallbackPolicy,
    ) -> Self {
        Self {
            path: layout.fleet_credentials_file(&worker_id),
            cache: CredentialCache::new(format!("fleet:{worker_id}"), policy),
            worker_id,
            provider,
            refresh_margin,
            call_timeout,
        }
    }

    /// The worker these credentials belong to.
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Where the credential is persisted.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Startup: reuse an unexpired persisted credential, otherwise assume the fleet role.
    pub async fn initialize(&self) -> Result<FleetCredential, CredentialError> {
        if let Some(persisted) = self.load_persisted()? {
            if !persisted.is_expired(Utc::now()) {
                tracing::info!(
                    worker_id = %self.worker_id,
                    expiration = %persisted.expiration,
                    "Loaded persisted fleet credentials"
                );
                self.cache.seed(persisted.clone()).await;
                return Ok(persisted);
            }
            tracing::debug!(worker_id = %self.worker_id, "Persisted fleet credentials have expired");
        }
        self.credentials().await
    }

    /// Read the persisted credential. Missing is `None`; unparsable is an error.
    pub fn load_persisted(&self) -> Result<Option<FleetCredential>, CredentialError> {
        let Some(bytes) = fs::read_private(&self.path)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CredentialError::CorruptFile {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }

    /// Current credentials, refreshing ahead of expiry.
    pub async fn credentials(&self) -> Result<FleetCredential, CredentialError> {
        self.credentials_at(Utc::now()).await.map(Cached::into_inner)
    }

    /// Like [`credentials`](Self::credentials) at an explicit time, reporting the origin.
    pub async fn credentials_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Cached<FleetCredential>, CredentialError> {
        self.cache
            .get_or_refresh(now, self.refresh_margin, || self.refresh())
            .await
    }

    async fn refresh(&self) -> Result<FleetCredential, CredentialError> {
        let credential = with_deadline(
            "AssumeFleetRoleForWorker",
            self.call_timeout,
            self.provider.assume_fleet_role(&self.worker_id),
        )
        .await
        .map_err(|source| CredentialError::RefreshFailed {
            key: self.cache.key().to_string(),
            source,
        })?;
        self.persist(&credential)?;
        tracing::info!(
            worker_id = %self.worker_id,
            expiration = %credential.expiration,
            "Obtained fleet credentials"
        );
        Ok(credential)
    }

    fn persist(&self, credential: &FleetCredential) -> Result<(), CredentialError> {
        if let Some(dir) = self.path.parent() {
            fs::ensure_private_dir(dir)?;
        }
        fs::write_private_atomic(&self.path, &credential.to_json()?, fs::PRIVATE_FILE_MODE)?;
        Ok(())
    }
}

/// Delete the persisted credentials of a worker id this host no longer runs as.
pub fn discard_persisted(
    layout: &PersistenceLayout,
    worker_id: &WorkerId,
) -> Result<(), FileStoreError> {
    fs::remove_file(&layout.fleet_credentials_file(worker_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::credentials::cache::CredentialOrigin;
    use crate::credentials::types::TemporaryCredential;
    use crate::error::ControlPlaneError;

    struct CountingFleetRole {
        calls: AtomicUsize,
        lifetime: chrono::Duration,
        fail: bool,
    }

    impl CountingFleetRole {
        fn new(lifetime: chrono::Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                lifetime,
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                lifetime: chrono::Duration::zero(),
                fail: true,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FleetRoleProvider for CountingFleetRole {
        async fn assume_fleet_role(
            &self,
            worker_id: &WorkerId,
        ) -> Result<TemporaryCredential, ControlPlaneError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.fail {
                return Err(ControlPlaneError::RequestFailed {
                    operation: "AssumeFleetRoleForWorker",
                    source: anyhow::anyhow!("access denied"),
                });
            }
            Ok(TemporaryCredential::new(
                format!("AKIA{n}"),
                format!("secret-{worker_id}"),
                "token",
                Utc::now() + self.lifetime,
            ))
        }
    }

    fn manager(
        dir: &TempDir,
        provider: Arc<CountingFleetRole>,
        policy: FallbackPolicy,
    ) -> FleetCredentialManager {
        FleetCredentialManager::new(
            &PersistenceLayout::new(dir.path()),
            WorkerId::new("w-1").unwrap(),
            provider,
            Duration::from_secs(300),
            Duration::from_secs(5),
            policy,
        )
    }

    #[tokio::test]
    async fn first_start_assumes_role_and_persists() {
        let dir = TempDir::new().unwrap();
        let provider = CountingFleetRole::new(chrono::Duration::hours(1));
        let mgr = manager(&dir, provider.clone(), FallbackPolicy::Strict);

        let cred = mgr.initialize().await.unwrap();
        assert_eq!(provider.calls(), 1);
        let persisted = mgr.load_persisted().unwrap().unwrap();
        assert!(persisted.same_as(&cred));
        assert_eq!(mgr.path(), dir.path().join("credentials").join("w-1.json"));
    }

    #[tokio::test]
    async fn restart_reuses_unexpired_persisted_credentials() {
        let dir = TempDir::new().unwrap();
        let provider = CountingFleetRole::new(chrono::Duration::hours(1));
        manager(&dir, provider.clone(), FallbackPolicy::Strict)
            .initialize()
            .await
            .unwrap();

        let restarted = manager(&dir, provider.clone(), FallbackPolicy::Strict);
        restarted.initialize().await.unwrap();
        restarted.credentials().await.unwrap();
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn expired_persisted_credentials_are_replaced() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(
            &dir,
            CountingFleetRole::new(chrono::Duration::hours(1)),
            FallbackPolicy::Strict,
        );
        let expired = TemporaryCredential::new("OLD", "s", "t", Utc::now() - chrono::Duration::minutes(1));
        std::fs::create_dir_all(mgr.path().parent().unwrap()).unwrap();
        std::fs::write(mgr.path(), expired.to_json().unwrap()).unwrap();

        let cred = mgr.initialize().await.unwrap();
        assert_ne!(cred.access_key_id, "OLD");
    }

    #[tokio::test]
    async fn corrupt_credentials_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let provider = CountingFleetRole::new(chrono::Duration::hours(1));
        let mgr = manager(&dir, provider.clone(), FallbackPolicy::Strict);
        std::fs::create_dir_all(mgr.path().parent().unwrap()).unwrap();
        std::fs::write(mgr.path(), b"{\"Version\":").unwrap();

        assert!(matches!(
            mgr.initialize().await,
            Err(CredentialError::CorruptFile { .. })
        ));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn refresh_failure_falls_back_to_unexpired_credential() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, CountingFleetRole::failing(), FallbackPolicy::UseUntilExpiry);
        // Inside the refresh margin but not yet expired.
        let near_expiry =
            TemporaryCredential::new("NEAR", "s", "t", Utc::now() + chrono::Duration::minutes(2));
        std::fs::create_dir_all(mgr.path().parent().unwrap()).unwrap();
        std::fs::write(mgr.path(), near_expiry.to_json().unwrap()).unwrap();
        mgr.initialize().await.unwrap();

        let got = mgr.credentials_at(Utc::now()).await.unwrap();
        assert_eq!(got.origin, CredentialOrigin::StaleFallback);
        assert_eq!(got.credential.access_key_id, "NEAR");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requesters_trigger_one_refresh() {
        let dir = TempDir::new().unwrap();
        let provider = CountingFleetRole::new(chrono::Duration::hours(1));
        let mgr = Arc::new(manager(&dir, provider.clone(), FallbackPolicy::Strict));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                tokio::spawn(async move { mgr.credentials().await.unwrap() })
            })
            .collect();
        let creds = futures::future::join_all(tasks).await;

        assert_eq!(provider.calls(), 1);
        for cred in creds {
            assert_eq!(cred.unwrap().access_key_id, "AKIA1");
        }
    }

    #[tokio::test]
    async fn discard_removes_superseded_file() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(
            &dir,
            CountingFleetRole::new(chrono::Duration::hours(1)),
            FallbackPolicy::Strict,
        );
        mgr.initialize().await.unwrap();
        discard_persisted(&PersistenceLayout::new(dir.path()), mgr.worker_id()).unwrap();
        assert!(!mgr.path().exists());
    }
}
