//! Raw, deserialized shape of a behavioral specification document
//!
//! These types mirror the on-disk TOML/JSON layout one-to-one. They are
//! validated and indexed into a [`SpecRegistry`](super::SpecRegistry) and
//! never consulted at query time.

use crate::events::Severity;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Top-level specification document
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct SpecDocument {
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleDocument>,
}

/// One module's state machine as written in the document
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleDocument {
    pub states: Vec<String>,
    /// States in which an entity is expected to rest indefinitely
    #[serde(default)]
    pub terminal: Vec<String>,
    #[serde(default)]
    pub transitions: Vec<TransitionDocument>,
    /// "from->to" (or "from→to") mapped to required write identifiers
    #[serde(default)]
    pub writes: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub sla: SlaDocument,
    /// Category name mapped to severity
    #[serde(default)]
    pub severities: BTreeMap<String, Severity>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TransitionDocument {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct SlaDocument {
    pub stuck_minutes: Option<u64>,
    pub stale_minutes: Option<u64>,
}

/// Split a writes key into its (from, to) halves
///
/// Accepts both the arrow glyph and the ASCII `->` form, with optional
/// whitespace around the states.
pub fn split_transition_key(key: &str) -> Option<(&str, &str)> {
    let (from, to) = key.split_once('→').or_else(|| key.split_once("->"))?;
    let (from, to) = (from.trim(), to.trim());
    if from.is_empty() || to.is_empty() {
        return None;
    }
    Some((from, to))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_transition_key_forms() {
        assert_eq!(split_transition_key("draft->active"), Some(("draft", "active")));
        assert_eq!(split_transition_key("draft→active"), Some(("draft", "active")));
        assert_eq!(
            split_transition_key(" draft -> active "),
            Some(("draft", "active"))
        );
    }

    #[test]
    fn test_split_transition_key_rejects_malformed() {
        assert_eq!(split_transition_key("draft"), None);
        assert_eq!(split_transition_key("->active"), None);
        assert_eq!(split_transition_key("draft->"), None);
        assert_eq!(split_transition_key(""), None);
    }

    #[test]
    fn test_module_document_defaults() {
        let doc: ModuleDocument = toml::from_str(r#"states = ["a"]"#).unwrap();
        assert!(doc.transitions.is_empty());
        assert!(doc.writes.is_empty());
        assert!(doc.sla.stuck_minutes.is_none());
        assert!(doc.severities.is_empty());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result: Result<ModuleDocument, _> = toml::from_str(
            r#"
            states = ["a"]
            transitons = []
            "#,
        );
        assert!(result.is_err());
    }
}
