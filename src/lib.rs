/// Error types for the observer
pub mod error;

/// Shared domain types: entities, observed events, issues
pub mod events;

/// Behavioral specification loading and lookups
pub mod spec;

/// Per-entity state and liveness tracking
pub mod tracker;

/// Bounded issue log
pub mod issues;

/// Alert delivery with per-key cooldowns
pub mod alerts;

/// Event input collectors
pub mod collectors;

/// Configuration management
pub mod config;

/// Orchestration and health reports
pub mod observer;

// Re-export commonly used types
pub use error::{AlertError, CollectorError, ConfigError, SpecError};
pub use events::{EntityKey, Issue, IssueCategory, ObservedEvent, Severity, Timestamp};
pub use observer::{CheckSummary, HealthReport, Observer};
pub use spec::SpecRegistry;
