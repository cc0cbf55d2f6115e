//! Core event and issue types for the behavioral observer
//!
//! This module defines the fundamental data structures used throughout the application
//! for representing observed module events, detected issues and their classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Timestamp type for consistent time handling across the application
pub type Timestamp = DateTime<Utc>;

/// Identity of one tracked state machine instance: a module plus an entity id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub module: String,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(module: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.module, self.entity_id)
    }
}

/// Something a functional module reports about one of its entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObservedEvent {
    /// The entity moved from one state to another
    Transition {
        from: String,
        to: String,
        /// Write identifiers the module performed as part of the move
        #[serde(default)]
        writes: BTreeSet<String>,
        at: Timestamp,
    },
    /// Liveness ping without a state change
    Interaction { at: Timestamp },
}

impl ObservedEvent {
    /// When the event happened
    pub fn at(&self) -> Timestamp {
        match self {
            ObservedEvent::Transition { at, .. } | ObservedEvent::Interaction { at } => *at,
        }
    }
}

/// Severity level for detected issues and alerts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational, surfaces only in reports
    Info,
    /// Warning that may require attention
    Warning,
    /// Critical issue requiring immediate attention
    Critical,
}

impl Severity {
    /// Whether issues of this severity are escalated to the operator
    pub fn is_alertable(&self) -> bool {
        matches!(self, Severity::Warning | Severity::Critical)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Kind of divergence between observed behavior and the specification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    /// A (from, to) pair the specification does not declare
    InvalidTransition,
    /// A declared transition happened without its expected writes
    MissingWrite,
    /// An entity stayed in one state past its threshold
    StuckState,
    /// No activity observed for an entity past its threshold
    StaleInteraction,
}

impl IssueCategory {
    pub const ALL: [IssueCategory; 4] = [
        IssueCategory::InvalidTransition,
        IssueCategory::MissingWrite,
        IssueCategory::StuckState,
        IssueCategory::StaleInteraction,
    ];

    /// Severity used when the specification does not override it
    pub fn default_severity(&self) -> Severity {
        match self {
            IssueCategory::InvalidTransition | IssueCategory::MissingWrite => Severity::Critical,
            IssueCategory::StuckState => Severity::Warning,
            IssueCategory::StaleInteraction => Severity::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCategory::InvalidTransition => "invalid_transition",
            IssueCategory::MissingWrite => "missing_write",
            IssueCategory::StuckState => "stuck_state",
            IssueCategory::StaleInteraction => "stale_interaction",
        }
    }
}

impl fmt::Display for IssueCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded anomaly
///
/// Issues are immutable once they enter the [`IssueLog`](crate::issues::IssueLog),
/// which assigns the sequence `id` on append. Ids grow with append order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Issue {
    pub id: u64,
    pub timestamp: Timestamp,
    pub severity: Severity,
    pub category: IssueCategory,
    pub module: String,
    pub entity_id: String,
    pub message: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Issue {
    /// Create an issue that has not been logged yet (id 0)
    pub fn new(
        timestamp: Timestamp,
        severity: Severity,
        category: IssueCategory,
        key: &EntityKey,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            timestamp,
            severity,
            category,
            module: key.module.clone(),
            entity_id: key.entity_id.clone(),
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata entry
    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// The (module, category) pair alerts are rate limited on
    pub fn alert_key(&self) -> (String, IssueCategory) {
        (self.module.clone(), self.category)
    }
}
