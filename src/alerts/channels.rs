use crate::config::ChannelConfig;
use crate::error::AlertError;
use crate::events::Severity;
use log::{debug, info};
use reqwest::Client;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Outbound notification contract
///
/// The dispatcher is agnostic to how a notification reaches the operator.
/// Implementations report failures through `AlertError`; the dispatcher
/// decides whether to retry.
pub trait NotificationChannel: Send + Sync {
    fn send<'a>(
        &'a self,
        recipient: &'a str,
        text: &'a str,
        severity: Severity,
    ) -> Pin<Box<dyn Future<Output = Result<(), AlertError>> + Send + 'a>>;

    /// Short name used in log lines
    fn name(&self) -> &str;
}

/// Build the channel selected in the configuration
pub fn build_channel(config: &ChannelConfig) -> Result<Arc<dyn NotificationChannel>, AlertError> {
    let channel: Arc<dyn NotificationChannel> = match config {
        ChannelConfig::Log => Arc::new(LogChannel),
        ChannelConfig::Command { program, args } => {
            Arc::new(CommandChannel::new(program.clone(), args.clone()))
        }
        ChannelConfig::Webhook { url } => Arc::new(WebhookChannel::new(url.clone())?),
        ChannelConfig::Mock => Arc::new(MockChannel::success()),
    };
    info!("Using '{}' notification channel", channel.name());
    Ok(channel)
}

/// Writes notifications to the application log
pub struct LogChannel;

impl NotificationChannel for LogChannel {
    fn send<'a>(
        &'a self,
        recipient: &'a str,
        text: &'a str,
        severity: Severity,
    ) -> Pin<Box<dyn Future<Output = Result<(), AlertError>> + Send + 'a>> {
        Box::pin(async move {
            info!("ALERT [{}] for {}: {}", severity, recipient, text);
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Runs an external program for every notification
///
/// The program receives its configured arguments followed by the recipient,
/// the severity and the notification text.
pub struct CommandChannel {
    program: String,
    args: Vec<String>,
}

impl CommandChannel {
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

impl NotificationChannel for CommandChannel {
    fn send<'a>(
        &'a self,
        recipient: &'a str,
        text: &'a str,
        severity: Severity,
    ) -> Pin<Box<dyn Future<Output = Result<(), AlertError>> + Send + 'a>> {
        Box::pin(async move {
            let output = tokio::process::Command::new(&self.program)
                .args(&self.args)
                .arg(recipient)
                .arg(severity.to_string())
                .arg(text)
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| {
                    AlertError::NotificationFailed(format!(
                        "Failed to execute {}: {}",
                        self.program, e
                    ))
                })?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(AlertError::NotificationFailed(format!(
                    "{} failed with status {}: {}",
                    self.program,
                    output.status,
                    stderr.trim()
                )));
            }

            debug!("Notification command {} succeeded", self.program);
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "command"
    }
}

/// JSON body posted by [`WebhookChannel`]
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    recipient: &'a str,
    severity: Severity,
    text: &'a str,
}

/// Posts notifications as JSON to an HTTP endpoint
pub struct WebhookChannel {
    client: Client,
    url: String,
}

impl WebhookChannel {
    /// Create a webhook channel
    ///
    /// # Example
    /// ```
    /// use specwatch::alerts::channels::WebhookChannel;
    ///
    /// let channel = WebhookChannel::new("http://localhost:9000/alerts".to_string());
    /// assert!(channel.is_ok());
    /// ```
    pub fn new(url: String) -> Result<Self, AlertError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .no_proxy()
            .build()?;
        Ok(Self { client, url })
    }
}

impl NotificationChannel for WebhookChannel {
    fn send<'a>(
        &'a self,
        recipient: &'a str,
        text: &'a str,
        severity: Severity,
    ) -> Pin<Box<dyn Future<Output = Result<(), AlertError>> + Send + 'a>> {
        Box::pin(async move {
            let payload = WebhookPayload {
                recipient,
                severity,
                text,
            };
            self.client
                .post(&self.url)
                .json(&payload)
                .send()
                .await?
                .error_for_status()?;
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

/// A notification captured by [`MockChannel`]
#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub recipient: String,
    pub text: String,
    pub severity: Severity,
}

/// In-memory channel that records notifications
///
/// Can be told to fail a number of times before succeeding, which is how
/// retry behavior is exercised without a real delivery target.
pub struct MockChannel {
    sent: Mutex<Vec<SentNotification>>,
    failures_remaining: AtomicUsize,
    attempts: AtomicUsize,
}

impl MockChannel {
    /// A channel that accepts every notification
    pub fn success() -> Self {
        Self::failing(0)
    }

    /// A channel that rejects the first `failures` notifications
    pub fn failing(failures: usize) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failures_remaining: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Notifications accepted so far
    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }

    /// Delivery attempts so far, including rejected ones
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl NotificationChannel for MockChannel {
    fn send<'a>(
        &'a self,
        recipient: &'a str,
        text: &'a str,
        severity: Severity,
    ) -> Pin<Box<dyn Future<Output = Result<(), AlertError>> + Send + 'a>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let should_fail = self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                    remaining.checked_sub(1)
                })
                .is_ok();
            if should_fail {
                return Err(AlertError::NotificationFailed(
                    "Mock channel failure".to_string(),
                ));
            }

            info!("MOCK NOTIFICATION [{}] {}: {}", severity, recipient, text);
            if let Ok(mut sent) = self.sent.lock() {
                sent.push(SentNotification {
                    recipient: recipient.to_string(),
                    text: text.to_string(),
                    severity,
                });
            }
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_channel_always_succeeds() {
        let channel = LogChannel;
        assert!(channel
            .send("admin", "hello", Severity::Warning)
            .await
            .is_ok());
        assert_eq!(channel.name(), "log");
    }

    #[tokio::test]
    async fn test_mock_channel_records_notifications() {
        let channel = MockChannel::success();
        channel
            .send("admin", "first", Severity::Critical)
            .await
            .unwrap();

        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0],
            SentNotification {
                recipient: "admin".to_string(),
                text: "first".to_string(),
                severity: Severity::Critical,
            }
        );
    }

    #[tokio::test]
    async fn test_mock_channel_fails_then_recovers() {
        let channel = MockChannel::failing(2);
        assert!(channel.send("admin", "a", Severity::Warning).await.is_err());
        assert!(channel.send("admin", "a", Severity::Warning).await.is_err());
        assert!(channel.send("admin", "a", Severity::Warning).await.is_ok());
        assert_eq!(channel.attempts(), 3);
        assert_eq!(channel.sent().len(), 1);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_command_channel_reports_exit_status() {
        let ok = CommandChannel::new("true".to_string(), vec![]);
        assert!(ok.send("admin", "text", Severity::Warning).await.is_ok());

        let failing = CommandChannel::new("false".to_string(), vec![]);
        let result = failing.send("admin", "text", Severity::Warning).await;
        assert!(matches!(result, Err(AlertError::NotificationFailed(_))));
    }

    #[tokio::test]
    async fn test_command_channel_missing_program() {
        let channel = CommandChannel::new("/nonexistent/notifier".to_string(), vec![]);
        let result = channel.send("admin", "text", Severity::Critical).await;
        assert!(matches!(result, Err(AlertError::NotificationFailed(_))));
    }

    #[tokio::test]
    async fn test_webhook_channel_unreachable_endpoint_fails() {
        let channel = WebhookChannel::new("http://127.0.0.1:9/alerts".to_string()).unwrap();
        let result = channel.send("admin", "text", Severity::Critical).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_build_channel_from_config() {
        assert_eq!(build_channel(&ChannelConfig::Log).unwrap().name(), "log");
        assert_eq!(build_channel(&ChannelConfig::Mock).unwrap().name(), "mock");
        let webhook = build_channel(&ChannelConfig::Webhook {
            url: "http://localhost:9000".to_string(),
        })
        .unwrap();
        assert_eq!(webhook.name(), "webhook");
    }
}
