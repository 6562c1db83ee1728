//! Temporary credential types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// Process-credential document version understood by cloud SDKs.
pub const PROCESS_CREDENTIAL_VERSION: u32 = 1;

/// Anything with a hard expiration time.
pub trait Expiring {
    fn expiration(&self) -> DateTime<Utc>;

    /// Past hard expiration.
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiration()
    }

    /// Usable without refreshing: `now < expiration - margin`.
    fn is_fresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        chrono::Duration::from_std(margin)
            .ok()
            .and_then(|margin| self.expiration().checked_sub_signed(margin))
            .is_some_and(|refresh_at| now < refresh_at)
    }
}

/// AWS-style temporary credentials, serialized in process-credential form:
/// `{Version, AccessKeyId, SecretAccessKey, SessionToken, Expiration}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemporaryCredential {
    #[serde(default = "default_version")]
    pub version: u32,
    pub access_key_id: String,
    #[serde(with = "secret_string")]
    pub secret_access_key: SecretString,
    #[serde(with = "secret_string")]
    pub session_token: SecretString,
    pub expiration: DateTime<Utc>,
}

/// The worker's own role credentials.
pub type FleetCredential = TemporaryCredential;

fn default_version() -> u32 {
    PROCESS_CREDENTIAL_VERSION
}

impl TemporaryCredential {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: impl Into<String>,
        expiration: DateTime<Utc>,
    ) -> Self {
        Self {
            version: PROCESS_CREDENTIAL_VERSION,
            access_key_id: access_key_id.into(),
            secret_access_key: SecretString::from(secret_access_key.into()),
            session_token: SecretString::from(session_token.into()),
            expiration,
        }
    }

    /// Same key material and expiry.
    pub fn same_as(&self, other: &Self) -> bool {
        self.access_key_id == other.access_key_id
            && self.secret_access_key.expose_secret() == other.secret_access_key.expose_secret()
            && self.session_token.expose_secret() == other.session_token.expose_secret()
            && self.expiration == other.expiration
    }

    /// Pretty process-credential JSON.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }
}

impl Expiring for TemporaryCredential {
    fn expiration(&self) -> DateTime<Utc> {
        self.expiration
    }
}

mod secret_string {
    use secrecy::{ExposeSecret, SecretString};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(secret: &SecretString, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(secret.expose_secret())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SecretString, D::Error> {
        String::deserialize(d).map(SecretString::from)
    }
}
