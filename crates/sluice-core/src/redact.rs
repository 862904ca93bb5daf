//! Log redaction of user data.
//!
//! Document keys and bodies are user data. Depending on the configured
//! level, log statements wrap them in `<ud>...</ud>` markers (so downstream
//! tooling can strip them) or replace them outright.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// How aggressively user data is redacted in log output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedactionLevel {
    /// Log user data verbatim.
    #[default]
    None,
    /// Wrap user data in `<ud>...</ud>` markers.
    Partial,
    /// Replace user data entirely.
    Full,
}

static LEVEL: AtomicU8 = AtomicU8::new(0);

/// Sets the process-wide redaction level. Called once at startup.
pub fn set_redaction_level(level: RedactionLevel) {
    LEVEL.store(level as u8, Ordering::Relaxed);
}

/// The current process-wide redaction level.
#[must_use]
pub fn redaction_level() -> RedactionLevel {
    match LEVEL.load(Ordering::Relaxed) {
        1 => RedactionLevel::Partial,
        2 => RedactionLevel::Full,
        _ => RedactionLevel::None,
    }
}

/// Renders a piece of user data for logging at the current level.
#[must_use]
pub fn redact_user(value: &str) -> String {
    match redaction_level() {
        RedactionLevel::None => value.to_string(),
        RedactionLevel::Partial => format!("<ud>{value}</ud>"),
        RedactionLevel::Full => "<ud>...</ud>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Redaction level is process-global, so exercise all levels in one test
    // to avoid cross-test interference.
    #[test]
    fn test_levels() {
        set_redaction_level(RedactionLevel::None);
        assert_eq!(redact_user("key-1"), "key-1");

        set_redaction_level(RedactionLevel::Partial);
        assert_eq!(redact_user("key-1"), "<ud>key-1</ud>");

        set_redaction_level(RedactionLevel::Full);
        assert_eq!(redact_user("key-1"), "<ud>...</ud>");

        set_redaction_level(RedactionLevel::None);
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(
            serde_json::from_str::<RedactionLevel>("\"partial\"").unwrap(),
            RedactionLevel::Partial
        );
    }
}
