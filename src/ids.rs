//! Validated identifiers.
//!
//! Queue and session ids are used as directory names under the persistence and sessions
//! roots, so every id is checked against a conservative character set before it reaches the
//! filesystem.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

static PATH_SAFE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,127}$").expect("static regex is valid")
});

fn validate(kind: &'static str, value: &str) -> Result<(), ConfigError> {
    if value == "." || value == ".." || !PATH_SAFE_ID.is_match(value) {
        return Err(ConfigError::InvalidIdentifier {
            kind,
            value: value.to_string(),
        });
    }
    Ok(())
}

macro_rules! path_safe_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Validate and wrap an identifier.
            pub fn new(value: impl Into<String>) -> Result<Self, ConfigError> {
                let value = value.into();
                validate($kind, &value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ConfigError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

path_safe_id!(
    /// Fleet-unique logical worker identity minted by the control plane.
    WorkerId,
    "worker id"
);
path_safe_id!(
    /// Cloud instance identifier reported by the metadata service.
    InstanceId,
    "instance id"
);
path_safe_id!(
    /// Work-submission queue.
    QueueId,
    "queue id"
);
path_safe_id!(
    /// One unit of assigned work.
    SessionId,
    "session id"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_service_style_ids() {
        assert!(WorkerId::new("worker-0123456789abcdef0123456789abcdef").is_ok());
        assert!(InstanceId::new("i-0abc123def4567890").is_ok());
        assert!(QueueId::new("queueA").is_ok());
        assert!(SessionId::new("s-1").is_ok());
    }

    #[test]
    fn rejects_traversal_and_separators() {
        for bad in ["", ".", "..", "../etc", "a/b", "a\\b", "-leading", "has space"] {
            assert!(SessionId::new(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn rejects_overlong_ids() {
        let long = "q".repeat(129);
        assert!(QueueId::new(long).is_err());
    }

    #[test]
    fn deserialize_validates() {
        let ok: WorkerId = serde_json::from_str("\"w-1\"").unwrap();
        assert_eq!(ok.as_str(), "w-1");
        assert!(serde_json::from_str::<WorkerId>("\"../w\"").is_err());
    }
}
