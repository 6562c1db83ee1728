//! Persisted worker identity record.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::IdentityError;
use crate::fs;
use crate::ids::{InstanceId, WorkerId};

/// The `worker.json` document.
///
/// When `instance_id` is present it is the instance id that was detected the last time this
/// worker id was confirmed valid on this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerState {
    pub worker_id: WorkerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,
}

impl WorkerState {
    pub fn new(worker_id: WorkerId, instance_id: Option<InstanceId>) -> Self {
        Self {
            worker_id,
            instance_id,
        }
    }
}

/// Reads and writes `worker.json`.
#[derive(Debug, Clone)]
pub struct WorkerStateStore {
    path: PathBuf,
}

impl WorkerStateStore {
    /// Create a store for the record at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of `worker.json`.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record. A missing file is `Ok(None)`; an unreadable or unparsable file is
    /// [`IdentityError::StateFileCorrupt`], never "no state".
    pub fn load(&self) -> Result<Option<WorkerState>, IdentityError> {
        let Some(bytes) = fs::read_private(&self.path)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| IdentityError::StateFileCorrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }

    /// Delete the record. A missing file is not an error.
    pub fn clear(&self) -> Result<(), IdentityError> {
        fs::remove_file(&self.path)?;
        tracing::debug!(path = %self.path.display(), "Removed worker state");
        Ok(())
    }

    /// Atomically replace the record.
    pub fn save(&self, state: &WorkerState) -> Result<(), IdentityError> {
        if let Some(dir) = self.path.parent() {
            fs::ensure_private_dir(dir)?;
        }
        let bytes = serde_json::to_vec_pretty(state).map_err(|e| {
            IdentityError::StateFileCorrupt {
                path: self.path.clone(),
                reason: format!("serialization failed: {e}"),
            }
        })?;
        fs::write_private_atomic(&self.path, &bytes, fs::PRIVATE_FILE_MODE)?;
        tracing::debug!(path = %self.path.display(), worker_id = %state.worker_id, "Saved worker state");
        Ok(())
    }
}
