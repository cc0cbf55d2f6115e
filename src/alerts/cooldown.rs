use crate::events::{IssueCategory, Timestamp};
use chrono::Duration;
use std::collections::HashMap;

/// Alerts are rate limited per module and issue category
pub type AlertKey = (String, IssueCategory);

/// Per-key cooldown bookkeeping for alert delivery
///
/// Remembers when each (module, category) key last produced a notification
/// and enforces a minimum spacing between notifications of the same key.
/// Keys are independent: a burst on one key never delays another.
#[derive(Debug)]
pub struct CooldownTracker {
    /// Minimum spacing between two notifications of the same key
    cooldown: Duration,
    /// When each key last produced a notification
    last_sent: HashMap<AlertKey, Timestamp>,
}

impl Default for CooldownTracker {
    fn default() -> Self {
        Self::new(Duration::minutes(15))
    }
}

impl CooldownTracker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_sent: HashMap::new(),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Check whether `key` may notify at `now`
    ///
    /// A key that never notified is always ready; otherwise at least the
    /// cooldown must have elapsed since its last notification.
    pub fn is_ready(&self, key: &AlertKey, now: Timestamp) -> bool {
        match self.last_sent.get(key) {
            None => true,
            Some(last) => now - *last >= self.cooldown,
        }
    }

    /// Earliest time `key` may notify again, None if it may notify right away
    pub fn ready_at(&self, key: &AlertKey) -> Option<Timestamp> {
        self.last_sent.get(key).map(|last| *last + self.cooldown)
    }

    /// Record that `key` produced a notification at `at`
    pub fn record_sent(&mut self, key: &AlertKey, at: Timestamp) {
        self.last_sent.insert(key.clone(), at);
    }

    pub fn last_sent(&self, key: &AlertKey) -> Option<Timestamp> {
        self.last_sent.get(key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn key(module: &str, category: IssueCategory) -> AlertKey {
        (module.to_string(), category)
    }

    #[test]
    fn test_fresh_key_is_ready() {
        let tracker = CooldownTracker::default();
        let k = key("planning", IssueCategory::MissingWrite);
        assert!(tracker.is_ready(&k, Utc::now()));
        assert_eq!(tracker.ready_at(&k), None);
        assert_eq!(tracker.cooldown(), Duration::minutes(15));
    }

    #[test]
    fn test_cooldown_window() {
        let mut tracker = CooldownTracker::new(Duration::minutes(15));
        let k = key("planning", IssueCategory::MissingWrite);
        let now = Utc::now();

        tracker.record_sent(&k, now);
        assert!(!tracker.is_ready(&k, now));
        assert!(!tracker.is_ready(&k, now + Duration::minutes(14)));
        // Boundary is inclusive
        assert!(tracker.is_ready(&k, now + Duration::minutes(15)));
        assert_eq!(tracker.ready_at(&k), Some(now + Duration::minutes(15)));
        assert_eq!(tracker.last_sent(&k), Some(now));
    }

    #[test]
    fn test_keys_are_independent() {
        let mut tracker = CooldownTracker::new(Duration::minutes(15));
        let now = Utc::now();
        let missing = key("planning", IssueCategory::MissingWrite);

        tracker.record_sent(&missing, now);

        assert!(tracker.is_ready(&key("planning", IssueCategory::InvalidTransition), now));
        assert!(tracker.is_ready(&key("money", IssueCategory::MissingWrite), now));
        assert!(!tracker.is_ready(&missing, now));
    }

    #[test]
    fn test_record_sent_moves_window_forward() {
        let mut tracker = CooldownTracker::new(Duration::minutes(10));
        let k = key("review", IssueCategory::StuckState);
        let now = Utc::now();

        tracker.record_sent(&k, now);
        tracker.record_sent(&k, now + Duration::minutes(10));

        assert!(!tracker.is_ready(&k, now + Duration::minutes(15)));
        assert!(tracker.is_ready(&k, now + Duration::minutes(20)));
    }
}
