//! Instance metadata probe.
//!
//! A probe answers "which cloud instance is this?". Every failure (timeout, access denied,
//! not running on a cloud host) is reported as `None`; the resolver treats that as "cannot
//! verify" rather than as an error. The HTTP probe also backs the instance profile check.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::error::IdentityError;
use crate::identity::profile::InstanceProfileProbe;
use crate::ids::InstanceId;

/// IMDSv2 session token lifetime requested from the metadata service.
const TOKEN_TTL_SECONDS: &str = "21600";

/// Reports the current host's instance id.
#[async_trait]
pub trait InstanceIdentityProbe: Send + Sync {
    /// Return the instance id, or `None` when it cannot be determined within `timeout`.
    async fn probe_instance_id(&self, timeout: Duration) -> Option<InstanceId>;
}

/// IMDSv2 probe over HTTP.
pub struct ImdsProbe {
    client: reqwest::Client,
    endpoint: String,
}

impl ImdsProbe {
    /// Create a probe against `endpoint` (e.g. `http://169.254.169.254`).
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    /// Fetch an IMDSv2 session token. `None` when the service refuses to issue one.
    async fn session_token(&self, timeout: Duration) -> Result<Option<String>, IdentityError> {
        let response = self
            .client
            .put(format!("{}/latest/api/token", self.endpoint))
            .header("X-aws-ec2-metadata-token-ttl-seconds", TOKEN_TTL_SECONDS)
            .timeout(timeout)
            .send()
            .await
            .map_err(request_error(timeout))?;
        if not_applicable(response.status()) {
            return Ok(None);
        }
        let token = response
            .error_for_status()
            .map_err(request_error(timeout))?
            .text()
            .await
            .map_err(request_error(timeout))?;
        Ok(Some(token.trim().to_string()))
    }

    /// GET `/latest/meta-data/<path>`. `None` when the entry is denied or missing.
    async fn metadata(
        &self,
        path: &str,
        token: &str,
        timeout: Duration,
    ) -> Result<Option<String>, IdentityError> {
        let response = self
            .client
            .get(format!("{}/latest/meta-data/{path}", self.endpoint))
            .header("X-aws-ec2-metadata-token", token)
            .timeout(timeout)
            .send()
            .await
            .map_err(request_error(timeout))?;
        if not_applicable(response.status()) {
            return Ok(None);
        }
        let body = response
            .error_for_status()
            .map_err(request_error(timeout))?
            .text()
            .await
            .map_err(request_error(timeout))?;
        Ok(Some(body))
    }

    async fn fetch(&self, timeout: Duration) -> Result<Option<InstanceId>, IdentityError> {
        let Some(token) = self.session_token(timeout).await? else {
            return Ok(None);
        };
        let Some(body) = self.metadata("instance-id", &token, timeout).await? else {
            return Ok(None);
        };

        let body = body.trim();
        if body.is_empty() {
            return Err(IdentityError::ProbeFailed {
                reason: "empty instance-id response".to_string(),
            });
        }
        InstanceId::new(body)
            .map(Some)
            .map_err(|e| IdentityError::ProbeFailed {
                reason: e.to_string(),
            })
    }

    /// `iam/info` only exists while an instance profile is associated with the instance.
    async fn profile_attached(&self, timeout: Duration) -> Result<bool, IdentityError> {
        let Some(token) = self.session_token(timeout).await? else {
            return Ok(false);
        };
        Ok(self.metadata("iam/info", &token, timeout).await?.is_some())
    }
}

fn request_error(timeout: Duration) -> impl Fn(reqwest::Error) -> IdentityError {
    move |e| {
        if e.is_timeout() {
            IdentityError::ProbeTimeout { timeout }
        } else {
            IdentityError::ProbeFailed {
                reason: e.to_string(),
            }
        }
    }
}

/// Denied or missing metadata means the host has no instance identity to offer.
fn not_applicable(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
    )
}

#[async_trait]
impl InstanceIdentityProbe for ImdsProbe {
    async fn probe_instance_id(&self, timeout: Duration) -> Option<InstanceId> {
        match self.fetch(timeout).await {
            Ok(Some(id)) => {
                tracing::debug!(instance_id = %id, "Detected instance id");
                Some(id)
            }
            Ok(None) => {
                tracing::info!("Instance metadata not available on this host");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Instance metadata probe failed; treating as absent");
                None
            }
        }
    }
}

#[async_trait]
impl InstanceProfileProbe for ImdsProbe {
    async fn instance_profile_attached(&self, timeout: Duration) -> Option<bool> {
        match self.profile_attached(timeout).await {
            Ok(attached) => Some(attached),
            Err(e) => {
                tracing::warn!(error = %e, "Instance profile check failed");
                None
            }
        }
    }
}

/// Probe for hosts that are known not to run on a cloud instance.
pub struct NoInstanceProbe;

#[async_trait]
impl InstanceProfileProbe for NoInstanceProbe {
    async fn instance_profile_attached(&self, _timeout: Duration) -> Option<bool> {
        Some(false)
    }
}

#[async_trait]
impl InstanceIdentityProbe for NoInstanceProbe {
    async fn probe_instance_id(&self, _timeout: Duration) -> Option<InstanceId> {
        None
    }
}
