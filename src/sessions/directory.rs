//! Per-session working directories.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::config::{AgentSettings, RETAIN_SESSION_DIR_ENV};
use crate::error::SessionDirError;
use crate::fs;
use crate::ids::SessionId;
use crate::sessions::retention::resolve_retention;

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// A session's working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDirectory {
    pub session_id: SessionId,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Retention as resolved at creation, before any per-invocation flag.
    pub retain: bool,
    pub origin: DirectoryOrigin,
}

/// How [`SessionDirectoryManager::create`] obtained the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryOrigin {
    /// Made by this call.
    Created,
    /// Already present and empty.
    Reused,
    /// A leftover from a previous run, contents included.
    Adopted,
}

/// What [`SessionDirectoryManager::cleanup`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    Deleted,
    Retained,
}

/// Creates and removes `<sessions_root>/<session_id>/`.
pub struct SessionDirectoryManager {
    root: PathBuf,
    retain_default: Option<bool>,
    env: EnvLookup,
    active: RwLock<HashMap<SessionId, SessionDirectory>>,
    /// Leftovers from a previous run, found by [`scan_orphans`](Self::scan_orphans).
    stale: RwLock<HashSet<SessionId>>,
}

impl SessionDirectoryManager {
    /// Create a manager for directories under `root`.
    pub fn new(root: impl Into<PathBuf>, retain_default: Option<bool>) -> Self {
        Self {
            root: root.into(),
            retain_default,
            env: Arc::new(|key| std::env::var(key).ok()),
            active: RwLock::new(HashMap::new()),
            stale: RwLock::new(HashSet::new()),
        }
    }

    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self::new(settings.sessions_dir.clone(), settings.retain_session_dir)
    }

    /// Replace the source consulted for the retention environment variable.
    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Arc::new(lookup);
        self
    }

    /// The sessions root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory used for `session_id`, whether or not it exists.
    pub fn path_for(&self, session_id: &SessionId) -> PathBuf {
        self.root.join(session_id.as_str())
    }

    /// Record directories left behind by a previous run.
    ///
    /// Nothing is deleted: leftovers may hold job data and are left for operator review.
    /// A recorded leftover may be adopted by a later [`create`](Self::create) for the same id.
    pub async fn scan_orphans(&self) -> Vec<PathBuf> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!(path = %self.root.display(), error = %e, "Could not scan sessions directory");
                return Vec::new();
            }
        };

        let mut found = Vec::new();
        let mut stale = self.stale.write().await;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Ok(session_id) = SessionId::new(entry.file_name().to_string_lossy()) else {
                continue;
            };
            tracing::warn!(
                session_id = %session_id,
                path = %path.display(),
                "Session directory left over from a previous run; review and remove manually"
            );
            stale.insert(session_id);
            found.push(path);
        }
        found.sort();
        found
    }

    /// Create the session's directory.
    ///
    /// Fails if the directory already exists with content, unless it is a leftover recorded
    /// by [`scan_orphans`](Self::scan_orphans).
    pub async fn create(&self, session_id: &SessionId) -> Result<SessionDirectory, SessionDirError> {
        let failed = |reason: String| SessionDirError::DirectoryCreateFailed {
            session_id: session_id.to_string(),
            reason,
        };

        let mut active = self.active.write().await;
        if active.contains_key(session_id) {
            return Err(failed("session directory is already in use".into()));
        }

        let path = self.path_for(session_id);
        fs::ensure_private_dir(&self.root).map_err(|e| failed(e.to_string()))?;

        let origin = match std::fs::symlink_metadata(&path) {
            Ok(meta) if !meta.is_dir() => {
                return Err(failed(format!("{} exists and is not a directory", path.display())));
            }
            Ok(_) => {
                let has_entries = fs::dir_has_entries(&path).map_err(|e| failed(e.to_string()))?;
                if !has_entries {
                    DirectoryOrigin::Reused
                } else if self.stale.write().await.remove(session_id) {
                    tracing::warn!(
                        session_id = %session_id,
                        path = %path.display(),
                        "Reusing leftover session directory"
                    );
                    DirectoryOrigin::Adopted
                } else {
                    return Err(failed(format!("{} exists and is not empty", path.display())));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::create_dir(&path).map_err(|e| failed(format!("{}: {e}", path.display())))?;
                DirectoryOrigin::Created
            }
            Err(e) => return Err(failed(format!("{}: {e}", path.display()))),
        };

        let directory = SessionDirectory {
            session_id: session_id.clone(),
            path,
            created_at: Utc::now(),
            retain: self.resolve(None),
            origin,
        };
        active.insert(session_id.clone(), directory.clone());
        tracing::debug!(session_id = %session_id, path = %directory.path.display(), "Created session directory");
        Ok(directory)
    }

    /// Delete the session's directory unless retention is requested.
    ///
    /// `retain_flag` is the per-invocation override. A failed delete is logged and returned;
    /// the directory is then treated as a leftover.
    pub async fn cleanup(
        &self,
        session_id: &SessionId,
        retain_flag: Option<bool>,
    ) -> Result<CleanupOutcome, SessionDirError> {
        let directory = self.active.write().await.remove(session_id);
        let path = directory
            .map(|d| d.path)
            .unwrap_or_else(|| self.path_for(session_id));

        if self.resolve(retain_flag) {
            tracing::info!(session_id = %session_id, path = %path.display(), "Retaining session directory");
            return Ok(CleanupOutcome::Retained);
        }

        match fs::remove_tree(&path) {
            Ok(()) => {
                tracing::debug!(session_id = %session_id, "Removed session directory");
                Ok(CleanupOutcome::Deleted)
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Session directory cleanup failed");
                self.stale.write().await.insert(session_id.clone());
                Err(SessionDirError::CleanupFailed {
                    session_id: session_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Undo a [`create`](Self::create) for a session that never started.
    ///
    /// Only a directory made by that call is deleted. An adopted leftover is kept with its
    /// contents and is recorded as a leftover again.
    pub async fn abandon(&self, session_id: &SessionId) -> Result<(), SessionDirError> {
        let Some(directory) = self.active.write().await.remove(session_id) else {
            return Ok(());
        };

        match directory.origin {
            DirectoryOrigin::Created => {
                if let Err(e) = fs::remove_tree(&directory.path) {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to remove abandoned session directory");
                    self.stale.write().await.insert(session_id.clone());
                    return Err(SessionDirError::CleanupFailed {
                        session_id: session_id.to_string(),
                        reason: e.to_string(),
                    });
                }
                Ok(())
            }
            DirectoryOrigin::Reused => Ok(()),
            DirectoryOrigin::Adopted => {
                tracing::info!(
                    session_id = %session_id,
                    path = %directory.path.display(),
                    "Leaving leftover session directory in place"
                );
                self.stale.write().await.insert(session_id.clone());
                Ok(())
            }
        }
    }

    /// Clean up every tracked session, continuing past failures.
    pub async fn cleanup_all(&self, retain_flag: Option<bool>) -> Vec<SessionDirError> {
        let mut ids: Vec<SessionId> = self.active.read().await.keys().cloned().collect();
        ids.sort();
        let mut failures = Vec::new();
        for session_id in ids {
            if let Err(e) = self.cleanup(&session_id, retain_flag).await {
                failures.push(e);
            }
        }
        failures
    }

    pub async fn active_sessions(&self) -> Vec<SessionId> {
        self.active.read().await.keys().cloned().collect()
    }

    fn resolve(&self, flag: Option<bool>) -> bool {
        let env = (self.env)(RETAIN_SESSION_DIR_ENV);
        resolve_retention(flag, env.as_deref(), self.retain_default)
    }
}
