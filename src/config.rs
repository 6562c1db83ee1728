//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::control_plane::RetryPolicy;
use crate::error::ConfigError;

/// Environment variable that overrides session-directory retention.
///
/// It is read at every cleanup (see `sessions::retention`), never into [`AgentSettings`].
pub const RETAIN_SESSION_DIR_ENV: &str = "DEADLINE_WORKER_RETAIN_SESSION_DIR";

/// Default instance metadata endpoint.
pub const DEFAULT_IMDS_ENDPOINT: &str = "http://169.254.169.254";

#[cfg(not(windows))]
const DEFAULT_PERSISTENCE_DIR: &str = "/var/lib/deadline";
#[cfg(windows)]
const DEFAULT_PERSISTENCE_DIR: &str = r"C:\ProgramData\Amazon\Deadline\Cache";

/// Worker agent settings.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Root for `worker.json`, fleet credentials and queue credential directories.
    pub persistence_dir: PathBuf,
    /// Root under which per-session working directories are created.
    pub sessions_dir: PathBuf,
    /// Directory for rolling log files (stderr only when unset).
    pub logs_dir: Option<PathBuf>,
    /// Emit debug-level logs.
    pub verbose: bool,
    /// Configuration-file default for keeping session directories after a session ends.
    /// Set by the embedder; [`AgentSettings::from_env`] leaves it unset.
    pub retain_session_dir: Option<bool>,
    /// Skip the startup wait for the instance profile to be disassociated.
    pub allow_instance_profile: bool,
    /// How long startup waits for the instance profile to go away.
    pub instance_profile_wait: Duration,
    /// Pause between instance profile checks.
    pub instance_profile_poll: Duration,
    /// Backoff for deleting the worker at shutdown.
    pub delete_retry: RetryPolicy,
    /// Deadline for the instance metadata probe.
    pub probe_timeout: Duration,
    /// Deadline for registration and role-assumption calls.
    pub call_timeout: Duration,
    /// Credentials are refreshed once they are within this margin of expiry.
    pub refresh_margin: Duration,
    /// Maximum number of concurrently active sessions.
    pub max_sessions: usize,
    /// Instance metadata service base URL.
    pub imds_endpoint: String,
    /// Region written into queue `config` files.
    pub region: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            persistence_dir: PathBuf::from(DEFAULT_PERSISTENCE_DIR),
            sessions_dir: std::env::temp_dir().join("deadline-sessions"),
            logs_dir: None,
            verbose: false,
            retain_session_dir: None,
            allow_instance_profile: false,
            instance_profile_wait: Duration::from_secs(60),
            instance_profile_poll: Duration::from_secs(5),
            delete_retry: RetryPolicy::default(),
            probe_timeout: Duration::from_millis(1000),
            call_timeout: Duration::from_secs(30),
            refresh_margin: Duration::from_secs(300), // 5 minutes
            max_sessions: 8,
            imds_endpoint: DEFAULT_IMDS_ENDPOINT.to_string(),
            region: None,
        }
    }
}

impl AgentSettings {
    /// Build settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let region = var("AWS_REGION").or_else(|| var("AWS_DEFAULT_REGION"));

        Ok(Self {
            persistence_dir: var("DEADLINE_WORKER_PERSISTENCE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.persistence_dir),
            sessions_dir: var("DEADLINE_WORKER_SESSIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.sessions_dir),
            logs_dir: var("DEADLINE_WORKER_LOGS_DIR").map(PathBuf::from),
            verbose: var("DEADLINE_WORKER_VERBOSE")
                .map(|v| parse_bool("DEADLINE_WORKER_VERBOSE", &v))
                .transpose()?
                .unwrap_or(defaults.verbose),
            retain_session_dir: defaults.retain_session_dir,
            allow_instance_profile: var("DEADLINE_WORKER_ALLOW_INSTANCE_PROFILE")
                .map(|v| parse_bool("DEADLINE_WORKER_ALLOW_INSTANCE_PROFILE", &v))
                .transpose()?
                .unwrap_or(defaults.allow_instance_profile),
            instance_profile_wait: var("DEADLINE_WORKER_INSTANCE_PROFILE_WAIT_SECS")
                .map(|v| parse_u64("DEADLINE_WORKER_INSTANCE_PROFILE_WAIT_SECS", &v))
                .transpose()?
                .map(Duration::from_secs)
                .unwrap_or(defaults.instance_profile_wait),
            instance_profile_poll: defaults.instance_profile_poll,
            delete_retry: defaults.delete_retry,
            probe_timeout: var("DEADLINE_WORKER_PROBE_TIMEOUT_MS")
                .map(|v| parse_u64("DEADLINE_WORKER_PROBE_TIMEOUT_MS", &v))
                .transpose()?
                .map(Duration::from_millis)
                .unwrap_or(defaults.probe_timeout),
            call_timeout: var("DEADLINE_WORKER_CALL_TIMEOUT_SECS")
                .map(|v| parse_u64("DEADLINE_WORKER_CALL_TIMEOUT_SECS", &v))
                .transpose()?
                .map(Duration::from_secs)
                .unwrap_or(defaults.call_timeout),
            refresh_margin: var("DEADLINE_WORKER_REFRESH_MARGIN_SECS")
                .map(|v| parse_u64("DEADLINE_WORKER_REFRESH_MARGIN_SECS", &v))
                .transpose()?
                .map(Duration::from_secs)
                .unwrap_or(defaults.refresh_margin),
            max_sessions: match var("DEADLINE_WORKER_MAX_SESSIONS") {
                Some(v) => match parse_u64("DEADLINE_WORKER_MAX_SESSIONS", &v)? {
                    0 => {
                        return Err(ConfigError::InvalidValue {
                            key: "DEADLINE_WORKER_MAX_SESSIONS".to_string(),
                            message: "must be at least 1".to_string(),
                        });
                    }
                    n => n as usize,
                },
                None => defaults.max_sessions,
            },
            imds_endpoint: var("DEADLINE_WORKER_IMDS_ENDPOINT")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(defaults.imds_endpoint),
            region,
        })
    }
}

/// Parse a boolean setting (`true/false/1/0/yes/no`, case-insensitive).
pub fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got {other:?}"),
        }),
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{e}"),
        })
}
