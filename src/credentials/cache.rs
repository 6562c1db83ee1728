//! Expiring-credential holder with refresh-ahead.
//!
//! The slot is guarded by an async mutex that stays held across the refresh call, so at
//! most one refresh is in flight per cache. Callers that queue behind it re-check the slot
//! once they get the lock and usually find the value the first caller just stored.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::credentials::types::Expiring;
use crate::error::CredentialError;

/// What to do with the previous credential when a refresh fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    /// Surface the refresh failure.
    Strict,
    /// Keep serving the previous credential until its hard expiration.
    #[default]
    UseUntilExpiry,
}

/// Where a returned credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialOrigin {
    /// Served from the cache without refreshing.
    Cached,
    /// Obtained by this call's refresh (or one it waited on).
    Refreshed,
    /// Refresh failed; previous credential returned under [`FallbackPolicy::UseUntilExpiry`].
    StaleFallback,
}

/// A credential plus its origin.
#[derive(Debug, Clone)]
pub struct Cached<C> {
    pub credential: C,
    pub origin: CredentialOrigin,
}

impl<C> Cached<C> {
    pub fn into_inner(self) -> C {
        self.credential
    }
}

/// Single-slot credential cache.
pub struct CredentialCache<C> {
    key: String,
    policy: FallbackPolicy,
    slot: Mutex<Option<C>>,
}

impl<C> CredentialCache<C>
where
    C: Expiring + Clone + Send,
{
    /// Create an empty cache. `key` names the credential in logs and errors.
    pub fn new(key: impl Into<String>, policy: FallbackPolicy) -> Self {
        Self {
            key: key.into(),
            policy,
            slot: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Store a credential obtained elsewhere (e.g. loaded from disk).
    pub async fn seed(&self, credential: C) {
        *self.slot.lock().await = Some(credential);
    }

    /// Current value, without refreshing.
    pub async fn peek(&self) -> Option<C> {
        self.slot.lock().await.clone()
    }

    /// Drop the cached value so the next lookup refreshes.
    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }

    /// Return the cached credential if `now < expiration - margin`, otherwise run `refresh`.
    pub async fn get_or_refresh<F, Fut>(
        &self,
        now: DateTime<Utc>,
        margin: Duration,
        refresh: F,
    ) -> Result<Cached<C>, CredentialError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, CredentialError>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(current) = slot.as_ref()
            && current.is_fresh(now, margin)
        {
            return Ok(Cached {
                credential: current.clone(),
                origin: CredentialOrigin::Cached,
            });
        }

        tracing::debug!(key = %self.key, "Refreshing credential");
        match refresh().await {
            Ok(fresh) => {
                *slot = Some(fresh.clone());
                Ok(Cached {
                    credential: fresh,
                    origin: CredentialOrigin::Refreshed,
                })
            }
            Err(e) => {
                if self.policy == FallbackPolicy::UseUntilExpiry
                    && let Some(previous) = slot.as_ref()
                    && !previous.is_expired(now)
                {
                    tracing::warn!(
                        key = %self.key,
                        error = %e,
                        expiration = %previous.expiration(),
                        "Credential refresh failed; using previous credential until it expires"
                    );
                    return Ok(Cached {
                        credential: previous.clone(),
                        origin: CredentialOrigin::StaleFallback,
                    });
                }
                Err(e)
            }
        }
    }
}
