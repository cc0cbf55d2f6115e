//! Application configuration
//!
//! Loaded from a TOML file. Every section and field has a default, so an
//! empty file (or no file at all) yields a working configuration.

use crate::alerts::DispatcherSettings;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Upper bound for minute-valued settings, one year
pub const MAX_MINUTES: u64 = 366 * 24 * 60;

/// Upper bound for second-valued settings, one year
pub const MAX_SECONDS: u64 = MAX_MINUTES * 60;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub observer: ObserverConfig,
    pub issues: IssuesConfig,
    pub alerts: AlertsConfig,
}

/// Orchestration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    /// Behavioral specification file; the `--spec` flag takes precedence
    pub spec_path: Option<PathBuf>,
    /// Seconds between periodic checks
    pub check_interval_seconds: u64,
    /// Window covered by health reports
    pub report_window_minutes: u64,
}

impl ObserverConfig {
    /// Window covered by health reports, clamped to [`MAX_MINUTES`]
    pub fn report_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.report_window_minutes.min(MAX_MINUTES) as i64)
    }
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            spec_path: None,
            check_interval_seconds: 60,
            report_window_minutes: 60,
        }
    }
}

/// Issue log settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuesConfig {
    /// Maximum number of issues retained
    pub capacity: usize,
}

impl Default for IssuesConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

/// Alert delivery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub recipient: String,
    pub cooldown_minutes: u64,
    pub max_attempts: u32,
    pub retry_delay_seconds: u64,
    pub send_timeout_seconds: u64,
    pub max_failed: usize,
    pub channel: ChannelConfig,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            recipient: "admin".to_string(),
            cooldown_minutes: 15,
            max_attempts: 3,
            retry_delay_seconds: 60,
            send_timeout_seconds: 10,
            max_failed: 100,
            channel: ChannelConfig::default(),
        }
    }
}

impl AlertsConfig {
    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            cooldown: chrono::Duration::minutes(self.cooldown_minutes.min(MAX_MINUTES) as i64),
            max_attempts: self.max_attempts,
            retry_delay: chrono::Duration::seconds(
                self.retry_delay_seconds.min(MAX_SECONDS) as i64,
            ),
            send_timeout: std::time::Duration::from_secs(
                self.send_timeout_seconds.min(MAX_SECONDS),
            ),
            recipient: self.recipient.clone(),
            max_failed: self.max_failed,
        }
    }
}

/// Where notifications are delivered
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelConfig {
    /// Write notifications to the application log
    #[default]
    Log,
    /// Run a program per notification
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// POST notifications as JSON
    Webhook { url: String },
    /// Record notifications in memory
    Mock,
}

impl Config {
    /// Load and validate configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadError` if the file cannot be read,
    /// `ConfigError::TomlError` if it is not valid TOML for this schema and
    /// `ConfigError::ValidationError` if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that values are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.issues.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "issues.capacity must be greater than 0".to_string(),
            ));
        }
        if self.observer.check_interval_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "observer.check_interval_seconds must be greater than 0".to_string(),
            ));
        }
        if self.alerts.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "alerts.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.alerts.send_timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "alerts.send_timeout_seconds must be greater than 0".to_string(),
            ));
        }
        for (name, value, max) in [
            (
                "observer.check_interval_seconds",
                self.observer.check_interval_seconds,
                MAX_SECONDS,
            ),
            (
                "observer.report_window_minutes",
                self.observer.report_window_minutes,
                MAX_MINUTES,
            ),
            ("alerts.cooldown_minutes", self.alerts.cooldown_minutes, MAX_MINUTES),
            (
                "alerts.retry_delay_seconds",
                self.alerts.retry_delay_seconds,
                MAX_SECONDS,
            ),
            (
                "alerts.send_timeout_seconds",
                self.alerts.send_timeout_seconds,
                MAX_SECONDS,
            ),
        ] {
            if value > max {
                return Err(ConfigError::ValidationError(format!(
                    "{} must not exceed {}, got {}",
                    name, max, value
                )));
            }
        }
        match &self.alerts.channel {
            ChannelConfig::Command { program, .. } if program.trim().is_empty() => {
                Err(ConfigError::ValidationError(
                    "alerts.channel.program must not be empty".to_string(),
                ))
            }
            ChannelConfig::Webhook { url }
                if !(url.starts_with("http://") || url.starts_with("https://")) =>
            {
                Err(ConfigError::ValidationError(format!(
                    "alerts.channel.url must be an http(s) URL, got '{}'",
                    url
                )))
            }
            _ => Ok(()),
        }
    }
}
