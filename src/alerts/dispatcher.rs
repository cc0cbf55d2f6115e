use crate::alerts::channels::NotificationChannel;
use crate::alerts::cooldown::{AlertKey, CooldownTracker};
use crate::error::AlertError;
use crate::events::{Issue, Timestamp};
use chrono::Duration;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Tunables for [`AlertDispatcher`]
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Minimum spacing between notifications of one (module, category)
    pub cooldown: Duration,
    /// Delivery attempts before an alert is given up on
    pub max_attempts: u32,
    /// Delay before a failed delivery is attempted again
    pub retry_delay: Duration,
    /// Upper bound on a single delivery attempt
    pub send_timeout: std::time::Duration,
    /// Who notifications are addressed to
    pub recipient: String,
    /// How many given-up alerts are kept for reporting
    pub max_failed: usize,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            cooldown: Duration::minutes(15),
            max_attempts: 3,
            retry_delay: Duration::seconds(60),
            send_timeout: std::time::Duration::from_secs(10),
            recipient: "admin".to_string(),
            max_failed: 100,
        }
    }
}

/// An alert waiting for its cooldown to expire or for a retry
#[derive(Debug, Clone, Serialize)]
pub struct PendingAlert {
    pub issue: Issue,
    pub scheduled_at: Timestamp,
    pub attempts: u32,
    /// Similar issues folded into this alert while it waited
    pub collapsed: usize,
    pub last_error: Option<String>,
}

impl PendingAlert {
    fn new(issue: Issue, scheduled_at: Timestamp) -> Self {
        Self {
            issue,
            scheduled_at,
            attempts: 0,
            collapsed: 0,
            last_error: None,
        }
    }

    /// Count a similar issue, keeping the more severe of the two
    fn fold(&mut self, issue: &Issue) {
        self.collapsed += 1;
        if issue.severity > self.issue.severity {
            self.issue = issue.clone();
        }
    }
}

/// An alert whose delivery was given up after repeated failures
#[derive(Debug, Clone, Serialize)]
pub struct FailedAlert {
    pub issue: Issue,
    pub attempts: u32,
    pub collapsed: usize,
    pub last_error: String,
    pub failed_at: Timestamp,
}

/// What one dispatch pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchOutcome {
    pub sent: usize,
    pub queued: usize,
    pub collapsed: usize,
    pub retried: usize,
    pub failed: usize,
}

impl DispatchOutcome {
    pub fn merge(&mut self, other: DispatchOutcome) {
        self.sent += other.sent;
        self.queued += other.queued;
        self.collapsed += other.collapsed;
        self.retried += other.retried;
        self.failed += other.failed;
    }
}

/// Delivers operator notifications for qualifying issues
///
/// Each (module, category) key notifies at most once per cooldown window.
/// Issues arriving during the window fold into a single queued follow-up per
/// key, so a burst produces one immediate notification and at most one more.
/// Delivery failures are retried a bounded number of times and then kept as
/// [`FailedAlert`]s; they are never returned to the caller as errors.
///
/// Bookkeeping sits behind a short-lived sync lock that is never held while a
/// channel send is awaited, so status queries never wait on delivery.
pub struct AlertDispatcher {
    channel: Arc<dyn NotificationChannel>,
    settings: DispatcherSettings,
    state: Mutex<DispatchState>,
}

#[derive(Default)]
struct DispatchState {
    cooldowns: CooldownTracker,
    /// At most one entry per key
    pending: HashMap<AlertKey, PendingAlert>,
    /// Keys with a send currently awaited
    in_flight: HashSet<AlertKey>,
    failed: VecDeque<FailedAlert>,
    sent_total: u64,
}

impl AlertDispatcher {
    pub fn new(channel: Arc<dyn NotificationChannel>, settings: DispatcherSettings) -> Self {
        let state = DispatchState {
            cooldowns: CooldownTracker::new(settings.cooldown),
            ..DispatchState::default()
        };
        Self {
            channel,
            settings,
            state: Mutex::new(state),
        }
    }

    /// Create a dispatcher with default settings
    pub fn with_channel(channel: Arc<dyn NotificationChannel>) -> Self {
        Self::new(channel, DispatcherSettings::default())
    }

    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Alert on CRITICAL and WARNING issues, honoring per-key cooldowns
    ///
    /// INFO issues are ignored; they only surface in health reports.
    pub async fn notify_qualifying(&self, issues: &[Issue], now: Timestamp) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        let batch = self.plan_notifications(issues, now, &mut outcome);
        self.deliver_batch(batch, now, &mut outcome).await;
        outcome
    }

    /// Deliver queued alerts whose cooldown and retry delay have passed
    ///
    /// CRITICAL alerts go out before WARNING ones when both are due.
    pub async fn drain_pending(&self, now: Timestamp) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        let batch = self.plan_drain(now);
        self.deliver_batch(batch, now, &mut outcome).await;

        if outcome.sent > 0 {
            info!("Delivered {} queued alerts", outcome.sent);
        }
        outcome
    }

    /// Sort issues into immediate sends, queued follow-ups and collapses
    fn plan_notifications(
        &self,
        issues: &[Issue],
        now: Timestamp,
        outcome: &mut DispatchOutcome,
    ) -> Vec<(AlertKey, PendingAlert)> {
        let mut state = self.lock();
        let mut batch = Vec::new();

        for issue in issues {
            if !issue.severity.is_alertable() {
                continue;
            }
            let key = issue.alert_key();

            if let Some(pending) = state.pending.get_mut(&key) {
                pending.fold(issue);
                debug!(
                    "Folded issue #{} into pending {}/{} alert ({} similar)",
                    issue.id, key.0, key.1, pending.collapsed
                );
                outcome.collapsed += 1;
                continue;
            }

            if state.in_flight.contains(&key) {
                // Follow-up waits for the cooldown the in-flight send starts
                debug!("Queued follow-up for {}/{} behind a send in flight", key.0, key.1);
                state.pending.insert(key, PendingAlert::new(issue.clone(), now));
                outcome.queued += 1;
            } else if state.cooldowns.is_ready(&key, now) {
                state.in_flight.insert(key.clone());
                batch.push((key, PendingAlert::new(issue.clone(), now)));
            } else {
                let scheduled_at = state.cooldowns.ready_at(&key).unwrap_or(now);
                info!(
                    "Queued {}/{} alert until {} due to cooldown",
                    key.0, key.1, scheduled_at
                );
                state
                    .pending
                    .insert(key, PendingAlert::new(issue.clone(), scheduled_at));
                outcome.queued += 1;
            }
        }

        batch
    }

    /// Take due pending alerts out of the queue, most severe first
    fn plan_drain(&self, now: Timestamp) -> Vec<(AlertKey, PendingAlert)> {
        let mut state = self.lock();

        let mut due: Vec<AlertKey> = state
            .pending
            .iter()
            .filter(|(key, alert)| {
                alert.scheduled_at <= now
                    && !state.in_flight.contains(*key)
                    && state.cooldowns.is_ready(key, now)
            })
            .map(|(key, _)| key.clone())
            .collect();
        due.sort_by(|a, b| {
            let (a, b) = (&state.pending[a], &state.pending[b]);
            b.issue
                .severity
                .cmp(&a.issue.severity)
                .then(a.scheduled_at.cmp(&b.scheduled_at))
        });

        let mut batch = Vec::with_capacity(due.len());
        for key in due {
            if let Some(alert) = state.pending.remove(&key) {
                state.in_flight.insert(key.clone());
                batch.push((key, alert));
            }
        }
        batch
    }

    /// Send each alert in order, settling its outcome before the next
    async fn deliver_batch(
        &self,
        batch: Vec<(AlertKey, PendingAlert)>,
        now: Timestamp,
        outcome: &mut DispatchOutcome,
    ) {
        for (key, mut alert) in batch {
            let delivered = self.deliver(&key, &mut alert).await;
            self.settle(key, alert, delivered, now, outcome);
        }
    }

    /// Attempt one delivery without holding the state lock; true on success
    async fn deliver(&self, key: &AlertKey, alert: &mut PendingAlert) -> bool {
        alert.attempts += 1;
        let text = Self::format_notification(alert);

        let result = match tokio::time::timeout(
            self.settings.send_timeout,
            self.channel
                .send(&self.settings.recipient, &text, alert.issue.severity),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AlertError::Timeout(self.settings.send_timeout.as_secs())),
        };

        match result {
            Ok(()) => {
                info!(
                    "Sent {} alert for {}/{} via {}",
                    alert.issue.severity,
                    key.0,
                    key.1,
                    self.channel.name()
                );
                true
            }
            Err(e) => {
                warn!(
                    "Failed to deliver {}/{} alert (attempt {}/{}): {}",
                    key.0, key.1, alert.attempts, self.settings.max_attempts, e
                );
                alert.last_error = Some(e.to_string());
                false
            }
        }
    }

    /// Record a delivery result: start the cooldown, retry, or give up
    fn settle(
        &self,
        key: AlertKey,
        mut alert: PendingAlert,
        delivered: bool,
        now: Timestamp,
        outcome: &mut DispatchOutcome,
    ) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.in_flight.remove(&key);

        if delivered {
            state.cooldowns.record_sent(&key, now);
            state.sent_total += 1;
            outcome.sent += 1;
            if let Some(follow_up) = state.pending.get_mut(&key) {
                // Wait out the cooldown the send just started
                if let Some(ready_at) = state.cooldowns.ready_at(&key) {
                    follow_up.scheduled_at = follow_up.scheduled_at.max(ready_at);
                }
            }
            return;
        }

        if alert.attempts >= self.settings.max_attempts {
            error!(
                "Giving up on {}/{} alert after {} attempts",
                key.0, key.1, alert.attempts
            );
            if state.failed.len() >= self.settings.max_failed {
                state.failed.pop_front();
            }
            state.failed.push_back(FailedAlert {
                last_error: alert.last_error.take().unwrap_or_default(),
                issue: alert.issue,
                attempts: alert.attempts,
                collapsed: alert.collapsed,
                failed_at: now,
            });
            outcome.failed += 1;
            return;
        }

        alert.scheduled_at = now + self.settings.retry_delay;
        if let Some(follow_up) = state.pending.remove(&key) {
            // Issues queued while the send was awaited ride along with the retry
            alert.collapsed += follow_up.collapsed + 1;
            if follow_up.issue.severity > alert.issue.severity {
                alert.issue = follow_up.issue;
            }
        }
        state.pending.insert(key, alert);
        outcome.retried += 1;
    }

    /// Render the notification text for an alert
    ///
    /// The first line is a title of the form `[SEVERITY] module/category`.
    fn format_notification(alert: &PendingAlert) -> String {
        let issue = &alert.issue;
        let mut text = format!(
            "[{}] {}/{}\n{}\nEntity: {}\nDetected: {}",
            issue.severity,
            issue.module,
            issue.category,
            issue.message,
            issue.entity_id,
            issue.timestamp.to_rfc3339()
        );

        for (name, value) in &issue.metadata {
            text.push_str(&format!("\n{}: {}", name, value));
        }

        if alert.collapsed > 0 {
            let noun = if alert.collapsed == 1 { "issue" } else { "issues" };
            text.push_str(&format!("\n(+{} similar {} since)", alert.collapsed, noun));
        }

        Self::truncate_text(&text, 1024)
    }

    /// Truncate text to at most `max_length` bytes on a character boundary
    fn truncate_text(text: &str, max_length: usize) -> String {
        if text.len() <= max_length {
            return text.to_string();
        }
        let mut truncate_at = max_length.saturating_sub(3);
        while truncate_at > 0 && !text.is_char_boundary(truncate_at) {
            truncate_at -= 1;
        }
        format!("{}...", &text[..truncate_at])
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Sends currently awaited
    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Queued alerts, earliest first
    pub fn pending_alerts(&self) -> Vec<PendingAlert> {
        let mut alerts: Vec<PendingAlert> = self.lock().pending.values().cloned().collect();
        alerts.sort_by_key(|alert| alert.scheduled_at);
        alerts
    }

    /// Alerts that exhausted their delivery attempts, oldest first
    pub fn failed_alerts(&self) -> Vec<FailedAlert> {
        self.lock().failed.iter().cloned().collect()
    }

    /// Notifications delivered since creation
    pub fn sent_count(&self) -> u64 {
        self.lock().sent_total
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }
}
