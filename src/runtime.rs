//! Startup sequence and session slots.
//!
//! [`bootstrap`] resolves the worker identity, establishes fleet credentials and builds the
//! per-session managers. The resulting [`WorkerRuntime`] hands out bounded session slots, each
//! with a working directory and the queue's credential environment. Shutdown can also retire
//! the worker identity with the control plane.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::config::AgentSettings;
use crate::control_plane::{
    self, FleetRoleProvider, QueueRoleProvider, RetryPolicy, WorkerDeregistrar, WorkerRegistrar,
};
use crate::credentials::fleet::{self, FleetCredentialManager};
use crate::credentials::{FallbackPolicy, QueueCredentialVendor};
use crate::error::{Error, IdentityError, Result, SessionError};
use crate::fs;
use crate::identity::{
    ImdsProbe, InstanceIdentityProbe, InstanceProfileProbe, ResolvedIdentity,
    WorkerIdentityResolver, WorkerStateStore, await_profile_detached,
};
use crate::ids::{QueueId, SessionId, WorkerId};
use crate::layout::PersistenceLayout;
use crate::sessions::{CleanupOutcome, SessionDirectoryManager};

/// External services the agent depends on.
pub struct Collaborators {
    pub probe: Arc<dyn InstanceIdentityProbe>,
    pub profile: Arc<dyn InstanceProfileProbe>,
    pub registrar: Arc<dyn WorkerRegistrar>,
    pub fleet_roles: Arc<dyn FleetRoleProvider>,
    pub queue_roles: Arc<dyn QueueRoleProvider>,
    /// When set, [`WorkerRuntime::shutdown`] deletes the worker.
    pub deregistrar: Option<Arc<dyn WorkerDeregistrar>>,
}

impl Collaborators {
    /// Use the HTTP metadata probe at `settings.imds_endpoint`.
    pub fn with_imds(
        settings: &AgentSettings,
        registrar: Arc<dyn WorkerRegistrar>,
        fleet_roles: Arc<dyn FleetRoleProvider>,
        queue_roles: Arc<dyn QueueRoleProvider>,
    ) -> Self {
        let imds = Arc::new(ImdsProbe::new(settings.imds_endpoint.clone()));
        Self {
            probe: imds.clone(),
            profile: imds,
            registrar,
            fleet_roles,
            queue_roles,
            deregistrar: None,
        }
    }

    /// Delete the worker on shutdown.
    pub fn with_deregistrar(mut self, deregistrar: Arc<dyn WorkerDeregistrar>) -> Self {
        self.deregistrar = Some(deregistrar);
        self
    }
}

/// A running session's resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSession {
    pub session_id: SessionId,
    pub queue_id: QueueId,
    pub directory: PathBuf,
    /// Variables to set on the session's subprocesses.
    pub environment: BTreeMap<&'static str, PathBuf>,
}

/// Run the startup pass. Any error returned here means the agent must not run.
pub async fn bootstrap(settings: &AgentSettings, collaborators: Collaborators) -> Result<WorkerRuntime> {
    let layout = PersistenceLayout::new(settings.persistence_dir.clone());
    fs::ensure_private_dir(layout.root())?;
    sweep_interrupted_writes(&layout);

    let state_store = WorkerStateStore::new(layout.worker_state_file());
    let resolver = WorkerIdentityResolver::new(
        collaborators.probe,
        collaborators.registrar,
        state_store.clone(),
        settings.probe_timeout,
        settings.call_timeout,
    );
    let identity = resolver.resolve().await?;

    // Hosts with no known instance have no instance profile.
    if !settings.allow_instance_profile && identity.instance_id.is_some() {
        await_profile_detached(
            collaborators.profile.as_ref(),
            settings.probe_timeout,
            settings.instance_profile_wait,
            settings.instance_profile_poll,
        )
        .await?;
    }

    if let Some(previous) = &identity.previous_worker_id
        && let Err(e) = fleet::discard_persisted(&layout, previous)
    {
        tracing::warn!(
            worker_id = %previous,
            error = %e,
            "Failed to remove credentials of superseded worker"
        );
    }

    let fleet = FleetCredentialManager::new(
        &layout,
        identity.worker_id.clone(),
        collaborators.fleet_roles,
        settings.refresh_margin,
        settings.call_timeout,
        FallbackPolicy::default(),
    );
    fleet.initialize().await?;

    // No session is running yet, so any queue directory is left over from a previous run.
    if let Err(e) = fs::remove_tree(&layout.queues_dir()) {
        tracing::warn!(error = %e, "Failed to remove leftover queue credentials");
    }
    let queues = QueueCredentialVendor::new(
        layout.clone(),
        collaborators.queue_roles,
        settings.refresh_margin,
        settings.call_timeout,
        FallbackPolicy::default(),
    )
    .with_region(settings.region.clone());

    let sessions = SessionDirectoryManager::from_settings(settings);
    let orphans = sessions.scan_orphans().await;
    if !orphans.is_empty() {
        tracing::warn!(count = orphans.len(), "Found session directories from a previous run");
    }

    tracing::info!(
        worker_id = %identity.worker_id,
        max_sessions = settings.max_sessions,
        "Worker agent ready"
    );

    Ok(WorkerRuntime {
        identity,
        layout,
        state_store,
        fleet: Arc::new(fleet),
        queues: Arc::new(queues),
        sessions: Arc::new(sessions),
        deregistrar: collaborators.deregistrar,
        call_timeout: settings.call_timeout,
        delete_retry: settings.delete_retry,
        active: RwLock::new(HashMap::new()),
        max_sessions: settings.max_sessions,
    })
}

fn sweep_interrupted_writes(layout: &PersistenceLayout) {
    for dir in [layout.root().to_path_buf(), layout.credentials_dir()] {
        let stale = match fs::stale_temp_files(&dir) {
            Ok(stale) => stale,
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "Could not scan for interrupted writes");
                continue;
            }
        };
        for path in stale {
            tracing::debug!(path = %path.display(), "Removing temp file from interrupted write");
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(error = %e, "Failed to remove temp file");
            }
        }
    }
}

/// The identified, credentialed agent.
pub struct WorkerRuntime {
    identity: ResolvedIdentity,
    layout: PersistenceLayout,
    state_store: WorkerStateStore,
    fleet: Arc<FleetCredentialManager>,
    queues: Arc<QueueCredentialVendor>,
    sessions: Arc<SessionDirectoryManager>,
    deregistrar: Option<Arc<dyn WorkerDeregistrar>>,
    call_timeout: Duration,
    delete_retry: RetryPolicy,
    /// Session id -> queue id for every occupied slot.
    active: RwLock<HashMap<SessionId, QueueId>>,
    max_sessions: usize,
}

impl WorkerRuntime {
    pub fn identity(&self) -> &ResolvedIdentity {
        &self.identity
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.identity.worker_id
    }

    pub fn fleet_credentials(&self) -> &Arc<FleetCredentialManager> {
        &self.fleet
    }

    pub fn queue_credentials(&self) -> &Arc<QueueCredentialVendor> {
        &self.queues
    }

    pub fn session_directories(&self) -> &Arc<SessionDirectoryManager> {
        &self.sessions
    }

    pub async fn active_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.active.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Occupy a slot and prepare the session's directory and credentials.
    ///
    /// On failure everything this call did is undone; other sessions are untouched. A leftover
    /// directory adopted for the session is kept with its contents.
    pub async fn start_session(
        &self,
        session_id: SessionId,
        queue_id: QueueId,
    ) -> std::result::Result<ActiveSession, SessionError> {
        {
            let mut active = self.active.write().await;
            if active.contains_key(&session_id) {
                return Err(SessionError::AlreadyActive {
                    session_id: session_id.to_string(),
                });
            }
            if active.len() >= self.max_sessions {
                return Err(SessionError::NoCapacity {
                    max: self.max_sessions,
                });
            }
            active.insert(session_id.clone(), queue_id.clone());
        }

        let directory = match self.sessions.create(&session_id).await {
            Ok(directory) => directory,
            Err(source) => {
                self.vacate(&session_id, &queue_id).await;
                return Err(SessionError::Directory {
                    session_id: session_id.to_string(),
                    source,
                });
            }
        };

        let bundle = match self.queues.ensure_bundle(&queue_id).await {
            Ok(bundle) => bundle,
            Err(source) => {
                if let Err(e) = self.sessions.abandon(&session_id).await {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to undo session directory");
                }
                self.vacate(&session_id, &queue_id).await;
                return Err(SessionError::Credentials {
                    session_id: session_id.to_string(),
                    source,
                });
            }
        };

        tracing::info!(session_id = %session_id, queue_id = %queue_id, "Session started");
        Ok(ActiveSession {
            environment: bundle.environment(),
            directory: directory.path,
            session_id,
            queue_id,
        })
    }

    /// Release the session's slot, clean its directory and drop unreferenced queue credentials.
    ///
    /// Cleanup failures are logged and returned but do not affect other sessions.
    pub async fn finish_session(
        &self,
        session_id: &SessionId,
        retain_flag: Option<bool>,
    ) -> std::result::Result<CleanupOutcome, SessionError> {
        let Some(queue_id) = self.active.read().await.get(session_id).cloned() else {
            return Err(SessionError::NotActive {
                session_id: session_id.to_string(),
            });
        };

        let cleanup = self.sessions.cleanup(session_id, retain_flag).await;
        let released = self.vacate(session_id, &queue_id).await;
        tracing::info!(session_id = %session_id, queue_id = %queue_id, "Session finished");

        let outcome = cleanup.map_err(|source| SessionError::Directory {
            session_id: session_id.to_string(),
            source,
        })?;
        released.map_err(|source| SessionError::Credentials {
            session_id: session_id.to_string(),
            source,
        })?;
        Ok(outcome)
    }

    /// Finish every session and release all queue credentials, continuing past failures.
    ///
    /// With a deregistrar, the worker is then deleted and its persisted identity and fleet
    /// credentials are removed. If deletion fails they are kept, so a restart can resume as
    /// the same worker.
    pub async fn shutdown(&self) -> Vec<Error> {
        let mut failures = Vec::new();
        for session_id in self.active_sessions().await {
            if let Err(e) = self.finish_session(&session_id, None).await {
                tracing::warn!(session_id = %session_id, error = %e, "Session cleanup failed during shutdown");
                failures.push(Error::from(e));
            }
        }
        for (_, e) in self.queues.release_all().await {
            failures.push(Error::from(e));
        }
        if let Some(deregistrar) = &self.deregistrar
            && let Err(e) = self.deregister(deregistrar.as_ref()).await
        {
            tracing::warn!(worker_id = %self.identity.worker_id, error = %e, "Worker deregistration failed");
            failures.push(e);
        }
        tracing::info!(worker_id = %self.identity.worker_id, failures = failures.len(), "Worker agent stopped");
        failures
    }

    async fn deregister(&self, deregistrar: &dyn WorkerDeregistrar) -> Result<()> {
        let worker_id = &self.identity.worker_id;
        control_plane::delete_worker(deregistrar, worker_id, self.call_timeout, self.delete_retry)
            .await
            .map_err(IdentityError::DeregistrationFailed)?;
        self.state_store.clear()?;
        fleet::discard_persisted(&self.layout, worker_id)?;
        Ok(())
    }

    /// Free the slot and release the queue's bundle if no other session uses it.
    async fn vacate(
        &self,
        session_id: &SessionId,
        queue_id: &QueueId,
    ) -> std::result::Result<(), crate::error::CredentialError> {
        // Held across the release so a session starting on the same queue cannot reserve its
        // slot between the reference check and the directory removal.
        let mut active = self.active.write().await;
        active.remove(session_id);
        if active.values().any(|q| q == queue_id) {
            return Ok(());
        }
        let result = self.queues.release(queue_id).await;
        if let Err(e) = &result {
            tracing::warn!(queue_id = %queue_id, error = %e, "Failed to release queue credentials");
        }
        result
    }
}
