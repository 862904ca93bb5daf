//! Declarative type rules: which documents go to which index, and how.
//!
//! Rules are loaded from configuration, validated once, and immutable for
//! the lifetime of the run. Matching is first-match-wins over the
//! configured order.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Matches `key` against a wildcard pattern where `*` matches any run of
/// characters and `?` matches exactly one.
#[must_use]
pub fn wildcard_match(pattern: &str, key: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let k: Vec<char> = key.chars().collect();
    let (mut pi, mut ki) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);

    while ki < k.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == k[ki]) {
            pi += 1;
            ki += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ki;
            pi += 1;
        } else if let Some(s) = star {
            // Backtrack: let the last star swallow one more character.
            pi = s + 1;
            mark += 1;
            ki = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// How source document content is laid out in the index document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocStructure {
    /// When `true`, the source document's fields become the root of the
    /// index document; when `false`, they are nested under a `doc` field.
    pub document_content_at_top_level: bool,
    /// Field under which `{type, cas, rev, partition, seqno}` metadata is
    /// injected. `None` omits the metadata entirely.
    pub metadata_field_name: Option<String>,
}

impl Default for DocStructure {
    fn default() -> Self {
        Self {
            document_content_at_top_level: false,
            metadata_field_name: Some("meta".into()),
        }
    }
}

/// One declarative routing rule. The first rule whose `key_pattern` matches
/// a document's key decides what happens to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeRule {
    /// Wildcard pattern matched against the document key.
    pub key_pattern: String,
    /// Logical type name, used by `doc_id_format` and injected metadata.
    /// Defaults to the target index name.
    #[serde(default)]
    pub type_name: Option<String>,
    /// Target index. Required unless the rule is `ignore`.
    #[serde(default)]
    pub index: Option<String>,
    /// Ingest pipeline passed through to the index, if any.
    #[serde(default)]
    pub pipeline: Option<String>,
    /// Routing value passed through to the index, if any.
    #[serde(default)]
    pub routing: Option<String>,
    /// Drop every matching event.
    #[serde(default)]
    pub ignore: bool,
    /// Drop matching deletions (mutations still replicate).
    #[serde(default)]
    pub ignore_deletes: bool,
    /// Template for the index document id over `{key}` and `{type}`.
    /// Defaults to the document key.
    #[serde(default)]
    pub doc_id_format: Option<String>,
    /// When present, only these source fields are copied into the index
    /// document.
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    /// Source-field to index-field renames, applied after the whitelist.
    #[serde(default)]
    pub rename: HashMap<String, String>,
}

impl TypeRule {
    /// Whether this rule matches the given document key.
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        wildcard_match(&self.key_pattern, key)
    }

    /// Checks the rule for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::TypeRule` when the rule neither ignores its
    /// matches nor names a target index, or has an empty pattern.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_pattern.is_empty() {
            return Err(ConfigError::TypeRule(
                "key_pattern must not be empty".into(),
            ));
        }
        if !self.ignore && self.index.is_none() {
            return Err(ConfigError::TypeRule(format!(
                "rule '{}' must either set an index or be marked ignore",
                self.key_pattern
            )));
        }
        Ok(())
    }

    /// The logical type label for matched documents.
    #[must_use]
    pub fn type_label(&self) -> &str {
        self.type_name
            .as_deref()
            .or(self.index.as_deref())
            .unwrap_or_default()
    }

    /// Renders the index document id for the given key.
    #[must_use]
    pub fn doc_id(&self, key: &str) -> String {
        match &self.doc_id_format {
            None => key.to_string(),
            Some(format) => format
                .replace("{key}", key)
                .replace("{type}", self.type_label()),
        }
    }
}

/// Returns the first rule matching `key`, if any.
#[must_use]
pub fn first_match<'a>(rules: &'a [TypeRule], key: &str) -> Option<&'a TypeRule> {
    rules.iter().find(|r| r.matches(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str) -> TypeRule {
        TypeRule {
            key_pattern: pattern.into(),
            index: Some("docs".into()),
            ..TypeRule::default()
        }
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("airline_*", "airline_10"));
        assert!(!wildcard_match("airline_*", "airport_10"));
        assert!(wildcard_match("user::?", "user::7"));
        assert!(!wildcard_match("user::?", "user::77"));
        assert!(wildcard_match("*::invoice::*", "2024::invoice::991"));
        assert!(!wildcard_match("abc", "abcd"));
        assert!(wildcard_match("a*b*c", "axxbyyc"));
    }

    #[test]
    fn test_first_match_wins() {
        let rules = vec![rule("airline_*"), rule("*")];
        assert_eq!(
            first_match(&rules, "airline_10").unwrap().key_pattern,
            "airline_*"
        );
        assert_eq!(first_match(&rules, "route_5").unwrap().key_pattern, "*");
    }

    #[test]
    fn test_no_match_drops() {
        let rules = vec![rule("airline_*")];
        assert!(first_match(&rules, "hotel_2").is_none());
    }

    #[test]
    fn test_validate_requires_index_or_ignore() {
        let mut r = TypeRule {
            key_pattern: "*".into(),
            ..TypeRule::default()
        };
        assert!(r.validate().is_err());
        r.ignore = true;
        assert!(r.validate().is_ok());
        r.ignore = false;
        r.index = Some("docs".into());
        assert!(r.validate().is_ok());
        r.key_pattern = String::new();
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_doc_id_template() {
        let mut r = rule("*");
        assert_eq!(r.doc_id("airline_10"), "airline_10");
        r.type_name = Some("airline".into());
        r.doc_id_format = Some("{type}::{key}".into());
        assert_eq!(r.doc_id("airline_10"), "airline::airline_10");
    }

    #[test]
    fn test_type_label_falls_back_to_index() {
        let r = rule("*");
        assert_eq!(r.type_label(), "docs");
    }

    #[test]
    fn test_doc_structure_defaults() {
        let s = DocStructure::default();
        assert!(!s.document_content_at_top_level);
        assert_eq!(s.metadata_field_name.as_deref(), Some("meta"));
    }
}
