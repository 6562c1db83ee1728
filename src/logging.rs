//! Tracing subscriber setup.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::AgentSettings;

/// Log file prefix inside the logs directory.
const LOG_FILE_PREFIX: &str = "worker-agent.log";

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise the level follows `settings.verbose`. When a logs
/// directory is configured, a daily-rolling file layer is added next to stderr. Keep the
/// returned guard alive for the life of the process so buffered lines are flushed.
pub fn init(settings: &AgentSettings) -> Option<WorkerGuard> {
    let default_level = if settings.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    match &settings.logs_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer().with_ansi(false).with_writer(writer);
            let result = tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init();
            if result.is_err() {
                tracing::debug!("Global subscriber already installed");
            }
            Some(guard)
        }
        None => {
            if tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .try_init()
                .is_err()
            {
                tracing::debug!("Global subscriber already installed");
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn repeated_init_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let settings = AgentSettings {
            logs_dir: Some(dir.path().to_path_buf()),
            verbose: true,
            ..AgentSettings::default()
        };
        assert!(init(&settings).is_some());
        assert!(init(&AgentSettings::default()).is_none());
    }
}
