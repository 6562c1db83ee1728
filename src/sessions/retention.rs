//! Session-directory retention precedence.

use crate::config::{RETAIN_SESSION_DIR_ENV, parse_bool};

/// Decide whether a finished session's directory is kept.
///
/// Per-invocation flag, then environment variable, then configuration default, then delete.
/// An unparsable environment value is ignored with a warning.
pub fn resolve_retention(flag: Option<bool>, env: Option<&str>, config: Option<bool>) -> bool {
    if let Some(retain) = flag {
        return retain;
    }
    if let Some(raw) = env.filter(|v| !v.trim().is_empty()) {
        match parse_bool(RETAIN_SESSION_DIR_ENV, raw) {
            Ok(retain) => return retain,
            Err(e) => tracing::warn!(error = %e, "Ignoring retention environment variable"),
        }
    }
    config.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_delete() {
        assert!(!resolve_retention(None, None, None));
    }

    #[test]
    fn flag_beats_everything() {
        assert!(resolve_retention(Some(true), Some("false"), Some(false)));
        assert!(!resolve_retention(Some(false), Some("true"), Some(true)));
    }

    #[test]
    fn environment_beats_config() {
        assert!(resolve_retention(None, Some("1"), Some(false)));
        assert!(!resolve_retention(None, Some("no"), Some(true)));
    }

    #[test]
    fn config_applies_when_nothing_else_is_set() {
        assert!(resolve_retention(None, None, Some(true)));
        assert!(resolve_retention(None, Some(""), Some(true)));
    }

    #[test]
    fn garbage_environment_value_falls_through() {
        assert!(resolve_retention(None, Some("sometimes"), Some(true)));
        assert!(!resolve_retention(None, Some("sometimes"), None));
    }
}
