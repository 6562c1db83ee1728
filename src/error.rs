//! Error types for the worker agent.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("File store error: {0}")]
    FileStore(#[from] FileStoreError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Session directory error: {0}")]
    SessionDir(#[from] SessionDirError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

impl Error {
    /// Whether this error must stop the agent from running as any worker.
    ///
    /// Identity, configuration and persistence-root failures abort startup. Credential and
    /// session failures only fail the session that hit them.
    pub fn is_fatal_to_startup(&self) -> bool {
        match self {
            Self::Config(_) | Self::FileStore(_) | Self::Identity(_) => true,
            Self::Credential(_) | Self::SessionDir(_) | Self::Session(_) => false,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid identifier {value:?} for {kind}")]
    InvalidIdentifier { kind: &'static str, value: String },
}

/// Errors from the owner-only file primitives.
#[derive(Debug, thiserror::Error)]
pub enum FileStoreError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Refusing to follow symlink at {path}")]
    Symlink { path: PathBuf },

    #[error("Failed to restrict permissions on {path}: {reason}")]
    Permissions { path: PathBuf, reason: String },

    #[error("Path {path} has no parent directory")]
    NoParent { path: PathBuf },
}

/// Failures reported by fleet control-plane collaborators.
#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    #[error("{operation} request failed: {source}")]
    RequestFailed {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("{operation} did not complete within {timeout:?}")]
    DeadlineExceeded {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("{operation} returned an invalid response: {reason}")]
    InvalidResponse {
        operation: &'static str,
        reason: String,
    },

    #[error("{operation} was throttled, retry after {retry_after:?}")]
    Throttled {
        operation: &'static str,
        retry_after: Option<Duration>,
    },

    #[error("{operation} hit an internal service error, retry after {retry_after:?}")]
    ServiceFault {
        operation: &'static str,
        retry_after: Option<Duration>,
    },
}

impl ControlPlaneError {
    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Throttled { .. } | Self::ServiceFault { .. })
    }

    /// Minimum wait the service asked for before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after, .. } | Self::ServiceFault { retry_after, .. } => {
                *retry_after
            }
            _ => None,
        }
    }
}

/// Worker identity reconciliation errors.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Instance metadata probe timed out after {timeout:?}")]
    ProbeTimeout { timeout: Duration },

    #[error("Instance metadata probe failed: {reason}")]
    ProbeFailed { reason: String },

    #[error("Worker registration failed: {0}")]
    RegistrationFailed(#[source] ControlPlaneError),

    #[error("Worker state file {path} is corrupt: {reason}")]
    StateFileCorrupt { path: PathBuf, reason: String },

    #[error(
        "Worker {worker_id} is bound to instance {recorded_instance} but this host is \
         {detected_instance}; registration returned the same worker id"
    )]
    IdentityConflict {
        worker_id: String,
        recorded_instance: String,
        detected_instance: String,
    },

    #[error("Instance profile is still attached to this host after waiting {waited:?}")]
    InstanceProfileAttached { waited: Duration },

    #[error("Worker deregistration failed: {0}")]
    DeregistrationFailed(#[source] ControlPlaneError),

    #[error("Worker state persistence failed: {0}")]
    Store(#[from] FileStoreError),
}

/// Credential acquisition and persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Credential refresh for {key} failed: {source}")]
    RefreshFailed {
        key: String,
        #[source]
        source: ControlPlaneError,
    },

    #[error("Credential file {path} is corrupt: {reason}")]
    CorruptFile { path: PathBuf, reason: String },

    #[error("No credential bundle is active for queue {queue_id}")]
    NoActiveBundle { queue_id: String },

    #[error("Credential persistence failed: {0}")]
    Store(#[from] FileStoreError),

    #[error("Credential serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Session working-directory errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionDirError {
    #[error("Failed to create directory for session {session_id}: {reason}")]
    DirectoryCreateFailed { session_id: String, reason: String },

    #[error("Failed to clean up directory for session {session_id}: {reason}")]
    CleanupFailed { session_id: String, reason: String },
}

/// Session slot errors raised by the worker runtime.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Maximum concurrent sessions ({max}) reached")]
    NoCapacity { max: usize },

    #[error("Session {session_id} is already active")]
    AlreadyActive { session_id: String },

    #[error("Session {session_id} is not active")]
    NotActive { session_id: String },

    #[error("Session {session_id} directory: {source}")]
    Directory {
        session_id: String,
        #[source]
        source: SessionDirError,
    },

    #[error("Session {session_id} credentials: {source}")]
    Credentials {
        session_id: String,
        #[source]
        source: CredentialError,
    },
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;
