//! Queue-scoped credential directories.
//!
//! Each queue with an active session gets `queues/<queue_id>/` holding:
//! - `config`: SDK config pointing `credential_process` at the vending script
//! - `credentials`: SDK shared-credentials file with the static keys
//! - `get_aws_credentials.sh` / `.cmd`: prints the process-credential JSON
//! - `iam_credentials.json`: the process-credential JSON itself
//!
//! Subprocesses find the files through [`QueueCredentialVendor::environment_for`]; the vendor
//! never touches any process environment itself.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use tokio::sync::Mutex;

use crate::control_plane::{QueueRoleProvider, with_deadline};
use crate::credentials::cache::{Cached, CredentialCache, FallbackPolicy};
use crate::credentials::types::{Expiring, TemporaryCredential};
use crate::error::CredentialError;
use crate::fs;
use crate::ids::QueueId;
use crate::layout::{PersistenceLayout, names};

/// Environment variable naming the SDK config file.
pub const AWS_CONFIG_FILE: &str = "AWS_CONFIG_FILE";

/// Environment variable naming the SDK shared-credentials file.
pub const AWS_SHARED_CREDENTIALS_FILE: &str = "AWS_SHARED_CREDENTIALS_FILE";

/// Materialized credential files for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueCredentialBundle {
    pub queue_id: QueueId,
    pub dir: PathBuf,
    pub config_file_path: PathBuf,
    pub credentials_file_path: PathBuf,
    pub vending_script_path: PathBuf,
    pub iam_credentials_path: PathBuf,
    pub expiration: DateTime<Utc>,
}

impl QueueCredentialBundle {
    fn at(queue_id: &QueueId, dir: &Path, expiration: DateTime<Utc>) -> Self {
        Self {
            queue_id: queue_id.clone(),
            dir: dir.to_path_buf(),
            config_file_path: dir.join(names::AWS_CONFIG),
            credentials_file_path: dir.join(names::AWS_CREDENTIALS),
            vending_script_path: dir.join(names::VENDING_SCRIPT),
            iam_credentials_path: dir.join(names::IAM_CREDENTIALS_JSON),
            expiration,
        }
    }

    /// Variables a subprocess needs to pick up this bundle.
    pub fn environment(&self) -> BTreeMap<&'static str, PathBuf> {
        BTreeMap::from([
            (AWS_CONFIG_FILE, self.config_file_path.clone()),
            (AWS_SHARED_CREDENTIALS_FILE, self.credentials_file_path.clone()),
        ])
    }
}

impl Expiring for QueueCredentialBundle {
    fn expiration(&self) -> DateTime<Utc> {
        self.expiration
    }
}

type QueueEntry = Arc<CredentialCache<QueueCredentialBundle>>;

/// Per-queue credential directory lifecycle.
pub struct QueueCredentialVendor {
    layout: PersistenceLayout,
    provider: Arc<dyn QueueRoleProvider>,
    region: Option<String>,
    refresh_margin: Duration,
    call_timeout: Duration,
    policy: FallbackPolicy,
    entries: Mutex<HashMap<QueueId, QueueEntry>>,
}

impl QueueCredentialVendor {
    /// Create a vendor writing under `layout`'s queues directory.
    pub fn new(
        layout: PersistenceLayout,
        provider: Arc<dyn QueueRoleProvider>,
        refresh_margin: Duration,
        call_timeout: Duration,
        policy: FallbackPolicy,
    ) -> Self {
        Self {
            layout,
            provider,
            region: None,
            refresh_margin,
            call_timeout,
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Write `region` into generated `config` files.
    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }

    /// Return the live bundle for `queue_id`, creating or refreshing it as needed.
    ///
    /// Concurrent callers for the same queue are serialized: only the first assumes the
    /// role and writes files, the rest receive its bundle.
    pub async fn ensure_bundle(
        &self,
        queue_id: &QueueId,
    ) -> Result<QueueCredentialBundle, CredentialError> {
        self.ensure_bundle_at(queue_id, Utc::now())
            .await
            .map(Cached::into_inner)
    }

    /// Like [`ensure_bundle`](Self::ensure_bundle) at an explicit time, reporting the origin.
    pub async fn ensure_bundle_at(
        &self,
        queue_id: &QueueId,
        now: DateTime<Utc>,
    ) -> Result<Cached<QueueCredentialBundle>, CredentialError> {
        let entry = self.entry(queue_id).await;
        let result = entry
            .get_or_refresh(now, self.refresh_margin, || self.materialize(queue_id))
            .await;
        if result.is_err() {
            self.forget_failed(queue_id, entry).await;
        }
        result
    }

    /// Environment variables for subprocesses of sessions on `queue_id`.
    pub async fn environment_for(
        &self,
        queue_id: &QueueId,
    ) -> Result<BTreeMap<&'static str, PathBuf>, CredentialError> {
        let entry = self.entries.lock().await.get(queue_id).cloned();
        let bundle = match entry {
            Some(entry) => entry.peek().await,
            None => None,
        };
        bundle
            .map(|b| b.environment())
            .ok_or_else(|| CredentialError::NoActiveBundle {
                queue_id: queue_id.to_string(),
            })
    }

    /// Queues that currently have a bundle entry.
    pub async fn active_queues(&self) -> Vec<QueueId> {
        let mut queues: Vec<QueueId> = self.entries.lock().await.keys().cloned().collect();
        queues.sort();
        queues
    }

    /// Forget the queue's bundle and delete its directory.
    pub async fn release(&self, queue_id: &QueueId) -> Result<(), CredentialError> {
        // The map stays locked until the directory is gone so a concurrent ensure_bundle
        // cannot start writing into it mid-delete.
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.remove(queue_id) {
            entry.invalidate().await;
        }
        let dir = self.layout.queue_dir(queue_id);
        fs::remove_tree(&dir)?;
        tracing::info!(queue_id = %queue_id, "Released queue credentials");
        Ok(())
    }

    /// Release every queue, continuing past failures.
    pub async fn release_all(&self) -> Vec<(QueueId, CredentialError)> {
        let mut failures = Vec::new();
        for queue_id in self.active_queues().await {
            if let Err(e) = self.release(&queue_id).await {
                tracing::warn!(queue_id = %queue_id, error = %e, "Failed to release queue credentials");
                failures.push((queue_id, e));
            }
        }
        failures
    }

    async fn entry(&self, queue_id: &QueueId) -> QueueEntry {
        let mut entries = self.entries.lock().await;
        Arc::clone(entries.entry(queue_id.clone()).or_insert_with(|| {
            Arc::new(CredentialCache::new(format!("queue:{queue_id}"), self.policy))
        }))
    }

    /// Drop an entry whose first refresh failed, along with anything it wrote.
    ///
    /// Entries holding a bundle, or shared with callers still waiting on them, are kept.
    async fn forget_failed(&self, queue_id: &QueueId, entry: QueueEntry) {
        let mut entries = self.entries.lock().await;
        let current = entries.get(queue_id).is_some_and(|e| Arc::ptr_eq(e, &entry));
        // One reference in the map, one here.
        if !current || Arc::strong_count(&entry) > 2 || entry.peek().await.is_some() {
            return;
        }
        entries.remove(queue_id);
        if let Err(e) = fs::remove_tree(&self.layout.queue_dir(queue_id)) {
            tracing::warn!(queue_id = %queue_id, error = %e, "Failed to remove partial queue credentials");
        }
    }

    async fn materialize(
        &self,
        queue_id: &QueueId,
    ) -> Result<QueueCredentialBundle, CredentialError> {
        let credential = with_deadline(
            "AssumeQueueRoleForWorker",
            self.call_timeout,
            self.provider.assume_queue_role(queue_id),
        )
        .await
        .map_err(|source| CredentialError::RefreshFailed {
            key: format!("queue:{queue_id}"),
            source,
        })?;

        let dir = self.layout.queue_dir(queue_id);
        fs::ensure_private_dir(&self.layout.queues_dir())?;
        fs::ensure_private_dir(&dir)?;

        let bundle = QueueCredentialBundle::at(queue_id, &dir, credential.expiration);
        // Written leaf-first: config -> script -> json.
        fs::write_private_atomic(
            &bundle.iam_credentials_path,
            &credential.to_json()?,
            fs::PRIVATE_FILE_MODE,
        )?;
        fs::write_private_atomic(
            &bundle.vending_script_path,
            vending_script(&bundle.iam_credentials_path).as_bytes(),
            fs::PRIVATE_EXEC_MODE,
        )?;
        fs::write_private_atomic(
            &bundle.credentials_file_path,
            render_credentials_file(&credential).as_bytes(),
            fs::PRIVATE_FILE_MODE,
        )?;
        fs::write_private_atomic(
            &bundle.config_file_path,
            render_config_file(&bundle.vending_script_path, self.region.as_deref()).as_bytes(),
            fs::PRIVATE_FILE_MODE,
        )?;

        tracing::info!(
            queue_id = %queue_id,
            expiration = %credential.expiration,
            "Wrote queue credentials"
        );
        Ok(bundle)
    }
}

/// SDK config file for the `default` profile.
pub fn render_config_file(vending_script: &Path, region: Option<&str>) -> String {
    let script = vending_script.display().to_string();
    let script = if script.contains(char::is_whitespace) {
        format!("\"{script}\"")
    } else {
        script
    };
    let mut out = String::from("[default]\n");
    if let Some(region) = region {
        out.push_str(&format!("region = {region}\n"));
    }
    out.push_str(&format!("credential_process = {script}\n"));
    out
}

/// SDK shared-credentials file for the `default` profile.
pub fn render_credentials_file(credential: &TemporaryCredential) -> String {
    format!(
        "[default]\naws_access_key_id = {}\naws_secret_access_key = {}\naws_session_token = {}\n",
        credential.access_key_id,
        credential.secret_access_key.expose_secret(),
        credential.session_token.expose_secret(),
    )
}

/// POSIX shell variant of the vending script.
pub fn render_posix_script(json_path: &Path) -> String {
    let quoted = json_path.display().to_string().replace('\'', r"'\''");
    format!("#!/bin/sh\nexec cat '{quoted}'\n")
}

/// Windows command-script variant of the vending script.
pub fn render_windows_script(json_path: &Path) -> String {
    format!("@echo off\r\ntype \"{}\"\r\n", json_path.display())
}

#[cfg(not(windows))]
fn vending_script(json_path: &Path) -> String {
    render_posix_script(json_path)
}

#[cfg(windows)]
fn vending_script(json_path: &Path) -> String {
    render_windows_script(json_path)
}
