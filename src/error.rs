use thiserror::Error;

/// Errors that can occur while reading observed events from a stream
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Failed to parse event: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors that can occur when loading the behavioral specification
///
/// Every variant is fatal: the observer never runs against a partially
/// loaded specification.
#[derive(Error, Debug)]
pub enum SpecError {
    #[error("Failed to read specification file: {0}")]
    ReadError(String),

    #[error("Failed to parse specification: {0}")]
    ParseError(String),

    #[error("Module '{module}' declares no states")]
    NoStates { module: String },

    #[error("Module '{module}' references undefined state '{state}' in {context}")]
    UndefinedState {
        module: String,
        state: String,
        context: String,
    },

    #[error("Module '{module}' has malformed writes key '{key}' (expected \"from->to\")")]
    MalformedWriteKey { module: String, key: String },

    #[error("Module '{module}' declares writes for undeclared transition {from} -> {to}")]
    UndeclaredTransition {
        module: String,
        from: String,
        to: String,
    },

    #[error("Module '{module}' overrides severity for unknown category '{category}'")]
    UnknownCategory { module: String, category: String },

    #[error("Module '{module}' has invalid SLA: {reason}")]
    InvalidSla { module: String, reason: String },
}

/// Errors that can occur when sending alerts
#[derive(Error, Debug)]
pub enum AlertError {
    #[error("Failed to send notification: {0}")]
    NotificationFailed(String),

    #[error("Notification timed out after {0} seconds")]
    Timeout(u64),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}
