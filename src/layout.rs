//! On-disk layout of the persistence root.
//!
//! ```text
//! <root>/
//!   worker.json
//!   credentials/<worker_id>.json
//!   queues/<queue_id>/{config,credentials,get_aws_credentials.sh|.cmd,iam_credentials.json}
//! ```

use std::path::{Path, PathBuf};

use crate::ids::{QueueId, WorkerId};

/// Well-known file names.
pub mod names {
    pub const WORKER_STATE: &str = "worker.json";
    pub const CREDENTIALS_DIR: &str = "credentials";
    pub const QUEUES_DIR: &str = "queues";
    pub const AWS_CONFIG: &str = "config";
    pub const AWS_CREDENTIALS: &str = "credentials";
    pub const IAM_CREDENTIALS_JSON: &str = "iam_credentials.json";
    #[cfg(not(windows))]
    pub const VENDING_SCRIPT: &str = "get_aws_credentials.sh";
    #[cfg(windows)]
    pub const VENDING_SCRIPT: &str = "get_aws_credentials.cmd";
}

/// Paths under the persistence root.
#[derive(Debug, Clone)]
pub struct PersistenceLayout {
    root: PathBuf,
}

impl PersistenceLayout {
    /// Create a layout rooted at the persistence directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The persistence directory itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn worker_state_file(&self) -> PathBuf {
        self.root.join(names::WORKER_STATE)
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.root.join(names::CREDENTIALS_DIR)
    }

    pub fn fleet_credentials_file(&self, worker_id: &WorkerId) -> PathBuf {
        self.credentials_dir()
            .join(format!("{}.json", worker_id.as_str()))
    }

    pub fn queues_dir(&self) -> PathBuf {
        self.root.join(names::QUEUES_DIR)
    }

    pub fn queue_dir(&self, queue_id: &QueueId) -> PathBuf {
        self.queues_dir().join(queue_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_documented_layout() {
        let layout = PersistenceLayout::new("/var/lib/deadline");
        let worker = WorkerId::new("w-1").unwrap();
        let queue = QueueId::new("queueA").unwrap();

        assert_eq!(
            layout.worker_state_file(),
            PathBuf::from("/var/lib/deadline/worker.json")
        );
        assert_eq!(
            layout.fleet_credentials_file(&worker),
            PathBuf::from("/var/lib/deadline/credentials/w-1.json")
        );
        assert_eq!(
            layout.queue_dir(&queue),
            PathBuf::from("/var/lib/deadline/queues/queueA")
        );
    }
}
