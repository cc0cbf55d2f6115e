use crate::events::{EntityKey, Issue, IssueCategory, Timestamp};
use crate::spec::SpecRegistry;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, warn};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Observed state of one entity
///
/// The dedup markers hold the start of the episode that was already reported:
/// the `state_entered_at` of a stuck residency, or the `last_interaction_at`
/// that opened a silence period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityState {
    /// None until the first transition is observed
    pub current_state: Option<String>,
    pub state_entered_at: Timestamp,
    pub last_interaction_at: Timestamp,
    #[serde(skip)]
    stuck_reported_for: Option<Timestamp>,
    #[serde(skip)]
    stale_reported_for: Option<Timestamp>,
}

impl EntityState {
    fn entered(state: &str, at: Timestamp) -> Self {
        Self {
            current_state: Some(state.to_string()),
            state_entered_at: at,
            last_interaction_at: at,
            stuck_reported_for: None,
            stale_reported_for: None,
        }
    }

    fn interacted(at: Timestamp) -> Self {
        Self {
            current_state: None,
            state_entered_at: at,
            last_interaction_at: at,
            stuck_reported_for: None,
            stale_reported_for: None,
        }
    }

    fn apply_transition(&mut self, to: &str, at: Timestamp) {
        self.current_state = Some(to.to_string());
        self.state_entered_at = at;
        self.last_interaction_at = at;
        self.stuck_reported_for = None;
        self.stale_reported_for = None;
    }

    fn apply_interaction(&mut self, at: Timestamp) {
        self.last_interaction_at = at;
        self.stale_reported_for = None;
    }

    /// Whether a stuck issue was already raised for the current residency
    pub fn stuck_reported(&self) -> bool {
        self.stuck_reported_for == Some(self.state_entered_at)
    }

    /// Whether a stale issue was already raised for the current silence
    pub fn stale_reported(&self) -> bool {
        self.stale_reported_for == Some(self.last_interaction_at)
    }
}

/// Entity counts at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LivenessCounts {
    pub tracked: usize,
    pub stuck: usize,
    pub stale: usize,
}

/// Tracks per-entity state and checks it against the specification
///
/// Entity state lives in a sharded map: updates to one entity are serialized
/// by its shard lock while entities in other shards proceed in parallel.
/// Detection is advisory; every method accepts its input and only reports.
pub struct StateTracker {
    registry: Arc<SpecRegistry>,
    entities: DashMap<EntityKey, EntityState>,
}

impl StateTracker {
    pub fn new(registry: Arc<SpecRegistry>) -> Self {
        Self {
            registry,
            entities: DashMap::new(),
        }
    }

    /// Validate an observed transition and move the entity to `to`
    ///
    /// Returns the issues detected (at most one). Events older than the
    /// entity's latest recorded activity are validated but leave the stored
    /// state untouched.
    pub fn record_transition(
        &self,
        key: &EntityKey,
        from: &str,
        to: &str,
        writes_performed: &BTreeSet<String>,
        at: Timestamp,
    ) -> Vec<Issue> {
        let mut issues = Vec::new();
        let module = key.module.as_str();

        if !self.registry.contains_module(module) {
            debug!(
                "Module '{}' is not specified, accepting {} -> {} for {} unvalidated",
                module, from, to, key
            );
        } else if !self.registry.is_valid_transition(module, from, to) {
            let allowed = self.registry.allowed_from(module, from);
            let allowed_text = if allowed.is_empty() {
                "none".to_string()
            } else {
                allowed
                    .iter()
                    .map(|target| format!("{} -> {}", from, target))
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            let category = IssueCategory::InvalidTransition;
            issues.push(
                Issue::new(
                    at,
                    self.registry.severity_for(module, category),
                    category,
                    key,
                    format!(
                        "Invalid transition {} -> {} for {} (allowed: {})",
                        from, to, key, allowed_text
                    ),
                )
                .with_meta("from", from)
                .with_meta("to", to)
                .with_meta("allowed", allowed),
            );
        } else {
            let missing: Vec<&str> = self
                .registry
                .expected_writes(module, from, to)
                .into_iter()
                .filter(|write| !writes_performed.contains(*write))
                .collect();
            if !missing.is_empty() {
                let category = IssueCategory::MissingWrite;
                issues.push(
                    Issue::new(
                        at,
                        self.registry.severity_for(module, category),
                        category,
                        key,
                        format!(
                            "Transition {} -> {} for {} is missing writes: {}",
                            from,
                            to,
                            key,
                            missing.join(", ")
                        ),
                    )
                    .with_meta("from", from)
                    .with_meta("to", to)
                    .with_meta("missing_writes", missing),
                );
            }
        }

        match self.entities.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let state = occupied.get_mut();
                if at < state.last_interaction_at {
                    debug!(
                        "Out-of-order transition {} -> {} for {} at {}, keeping newer state",
                        from, to, key, at
                    );
                } else {
                    if let Some(current) = state.current_state.as_deref() {
                        if current != from {
                            warn!(
                                "{} reported transition from '{}' but was tracked in '{}'",
                                key, from, current
                            );
                        }
                    }
                    state.apply_transition(to, at);
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(EntityState::entered(to, at));
            }
        }

        issues
    }

    /// Record activity without a state change
    pub fn record_interaction(&self, key: &EntityKey, at: Timestamp) {
        match self.entities.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let state = occupied.get_mut();
                if at >= state.last_interaction_at {
                    state.apply_interaction(at);
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(EntityState::interacted(at));
            }
        }
    }

    /// Scan every tracked entity for stuck and stale episodes
    ///
    /// Each episode is reported exactly once no matter how often this runs.
    /// Unspecified modules and entities resting in a terminal state are skipped.
    pub fn sweep(&self, now: Timestamp) -> Vec<Issue> {
        let mut issues = Vec::new();

        for mut entry in self.entities.iter_mut() {
            let (key, state) = entry.pair_mut();
            let module = key.module.as_str();
            if !self.registry.contains_module(module) || self.is_resting(module, state) {
                continue;
            }
            let sla = self.registry.sla(module);

            if let Some(current) = state.current_state.clone() {
                let resident = now - state.state_entered_at;
                if resident > sla.stuck_after() && !state.stuck_reported() {
                    let category = IssueCategory::StuckState;
                    issues.push(
                        Issue::new(
                            now,
                            self.registry.severity_for(module, category),
                            category,
                            key,
                            format!(
                                "{} stuck in '{}' for {} minutes (threshold {})",
                                key,
                                current,
                                resident.num_minutes(),
                                sla.stuck_minutes
                            ),
                        )
                        .with_meta("state", current)
                        .with_meta("entered_at", state.state_entered_at.to_rfc3339())
                        .with_meta("threshold_minutes", sla.stuck_minutes),
                    );
                    state.stuck_reported_for = Some(state.state_entered_at);
                }
            }

            let silent = now - state.last_interaction_at;
            if silent > sla.stale_after() && !state.stale_reported() {
                let category = IssueCategory::StaleInteraction;
                issues.push(
                    Issue::new(
                        now,
                        self.registry.severity_for(module, category),
                        category,
                        key,
                        format!(
                            "No activity from {} for {} minutes (threshold {})",
                            key,
                            silent.num_minutes(),
                            sla.stale_minutes
                        ),
                    )
                    .with_meta("last_interaction_at", state.last_interaction_at.to_rfc3339())
                    .with_meta("threshold_minutes", sla.stale_minutes),
                );
                state.stale_reported_for = Some(state.last_interaction_at);
            }
        }

        if !issues.is_empty() {
            debug!("Sweep at {} produced {} issues", now, issues.len());
        }
        issues
    }

    /// How many entities are tracked, and how many are currently past a threshold
    pub fn liveness_counts(&self, now: Timestamp) -> LivenessCounts {
        let mut counts = LivenessCounts::default();
        for entry in self.entities.iter() {
            counts.tracked += 1;
            let module = entry.key().module.as_str();
            let state = entry.value();
            if !self.registry.contains_module(module) || self.is_resting(module, state) {
                continue;
            }
            let sla = self.registry.sla(module);
            if state.current_state.is_some() && now - state.state_entered_at > sla.stuck_after() {
                counts.stuck += 1;
            }
            if now - state.last_interaction_at > sla.stale_after() {
                counts.stale += 1;
            }
        }
        counts
    }

    /// Copy of one entity's state
    pub fn entity(&self, key: &EntityKey) -> Option<EntityState> {
        self.entities.get(key).map(|state| state.clone())
    }

    pub fn tracked_count(&self) -> usize {
        self.entities.len()
    }

    fn is_resting(&self, module: &str, state: &EntityState) -> bool {
        state
            .current_state
            .as_deref()
            .is_some_and(|current| self.registry.is_terminal(module, current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Severity;
    use chrono::{Duration, TimeZone, Utc};

    const SPEC: &str = r#"
        [modules.planning]
        states = ["draft", "active", "done"]
        terminal = ["done"]
        transitions = [
            { from = "draft", to = "active" },
            { from = "active", to = "done" },
            { from = "active", to = "draft" },
        ]

        [modules.planning.writes]
        "draft->active" = ["priorities_saved", "goals_saved"]

        [modules.review]
        states = ["open", "closed"]
        transitions = [{ from = "open", to = "closed" }]

        [modules.review.severities]
        invalid_transition = "warning"
    "#;

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn tracker() -> StateTracker {
        StateTracker::new(Arc::new(SpecRegistry::from_toml_str(SPEC).unwrap()))
    }

    fn writes(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    fn key(id: &str) -> EntityKey {
        EntityKey::new("planning", id)
    }

    fn count(issues: &[Issue], category: IssueCategory) -> usize {
        issues
            .iter()
            .filter(|issue| issue.category == category)
            .count()
    }

    #[test]
    fn test_declared_transitions_raise_nothing() {
        let tracker = tracker();
        let k = key("1");
        let all = writes(&["priorities_saved", "goals_saved"]);

        assert!(tracker
            .record_transition(&k, "draft", "active", &all, t0())
            .is_empty());
        assert!(tracker
            .record_transition(&k, "active", "done", &all, t0())
            .is_empty());

        let state = tracker.entity(&k).unwrap();
        assert_eq!(state.current_state.as_deref(), Some("done"));
    }

    #[test]
    fn test_undeclared_transition_raises_one_issue() {
        let tracker = tracker();
        let issues = tracker.record_transition(&key("1"), "draft", "done", &writes(&[]), t0());

        assert_eq!(issues.len(), 1);
        let issue = &issues[0];
        assert_eq!(issue.category, IssueCategory::InvalidTransition);
        assert_eq!(issue.severity, Severity::Critical);
        assert!(issue.message.contains("draft -> done"));
        assert!(issue.message.contains("draft -> active"));
        assert_eq!(issue.metadata["allowed"], serde_json::json!(["active"]));
    }

    #[test]
    fn test_invalid_transition_uses_configured_severity() {
        let tracker = tracker();
        let issues = tracker.record_transition(
            &EntityKey::new("review", "7"),
            "closed",
            "open",
            &writes(&[]),
            t0(),
        );
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Warning);
    }

    #[test]
    fn test_missing_write_names_exactly_the_missing_set() {
        let tracker = tracker();
        let issues = tracker.record_transition(
            &key("1"),
            "draft",
            "active",
            &writes(&["priorities_saved", "unrelated"]),
            t0(),
        );

        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].category, IssueCategory::MissingWrite);
        assert_eq!(
            issues[0].metadata["missing_writes"],
            serde_json::json!(["goals_saved"])
        );
    }

    #[test]
    fn test_unknown_module_is_accepted_silently() {
        let tracker = tracker();
        let k = EntityKey::new("payments", "9");

        assert!(tracker
            .record_transition(&k, "nowhere", "anywhere", &writes(&[]), t0())
            .is_empty());
        assert_eq!(
            tracker.entity(&k).unwrap().current_state.as_deref(),
            Some("anywhere")
        );
        // Never swept either
        assert!(tracker.sweep(t0() + Duration::days(2)).is_empty());
    }

    #[test]
    fn test_invalid_transition_still_updates_state() {
        let tracker = tracker();
        let k = key("1");
        tracker.record_transition(&k, "draft", "done", &writes(&[]), t0());
        assert_eq!(
            tracker.entity(&k).unwrap().current_state.as_deref(),
            Some("done")
        );
    }

    #[test]
    fn test_stuck_raised_once_per_episode() {
        let tracker = tracker();
        let k = key("1");
        tracker.record_transition(&k, "draft", "active", &writes(&[]), t0());

        let mut stuck = 0;
        for minute in 31..36 {
            let issues = tracker.sweep(t0() + Duration::minutes(minute));
            stuck += count(&issues, IssueCategory::StuckState);
        }
        assert_eq!(stuck, 1);
        assert!(tracker.entity(&k).unwrap().stuck_reported());
    }

    #[test]
    fn test_not_stuck_at_exact_threshold() {
        let tracker = tracker();
        tracker.record_transition(&key("1"), "draft", "active", &writes(&[]), t0());
        let issues = tracker.sweep(t0() + Duration::minutes(30));
        assert_eq!(count(&issues, IssueCategory::StuckState), 0);
    }

    #[test]
    fn test_reentering_state_starts_new_stuck_episode() {
        let tracker = tracker();
        let k = key("1");
        let w = writes(&["priorities_saved", "goals_saved"]);
        tracker.record_transition(&k, "draft", "active", &w, t0());
        assert_eq!(
            count(
                &tracker.sweep(t0() + Duration::minutes(31)),
                IssueCategory::StuckState
            ),
            1
        );

        let t1 = t0() + Duration::minutes(40);
        tracker.record_transition(&k, "active", "draft", &w, t1);
        tracker.record_transition(&k, "draft", "active", &w, t1);
        assert!(!tracker.entity(&k).unwrap().stuck_reported());

        let issues = tracker.sweep(t1 + Duration::minutes(31));
        assert_eq!(count(&issues, IssueCategory::StuckState), 1);
    }

    #[test]
    fn test_interaction_does_not_reset_stuck_episode() {
        let tracker = tracker();
        let k = key("1");
        tracker.record_transition(&k, "draft", "active", &writes(&[]), t0());
        tracker.sweep(t0() + Duration::minutes(31));

        tracker.record_interaction(&k, t0() + Duration::minutes(32));
        let issues = tracker.sweep(t0() + Duration::minutes(40));
        assert_eq!(count(&issues, IssueCategory::StuckState), 0);
    }

    #[test]
    fn test_stale_raised_once_and_reset_by_interaction() {
        let tracker = tracker();
        let k = key("1");
        tracker.record_interaction(&k, t0());

        let first = tracker.sweep(t0() + Duration::minutes(61));
        let second = tracker.sweep(t0() + Duration::minutes(90));
        assert_eq!(count(&first, IssueCategory::StaleInteraction), 1);
        assert_eq!(first[0].severity, Severity::Info);
        assert_eq!(count(&second, IssueCategory::StaleInteraction), 0);

        let t1 = t0() + Duration::minutes(100);
        tracker.record_interaction(&k, t1);
        assert!(!tracker.entity(&k).unwrap().stale_reported());
        let third = tracker.sweep(t1 + Duration::minutes(61));
        assert_eq!(count(&third, IssueCategory::StaleInteraction), 1);
    }

    #[test]
    fn test_interaction_only_entity_is_never_stuck() {
        let tracker = tracker();
        tracker.record_interaction(&key("1"), t0());
        let issues = tracker.sweep(t0() + Duration::minutes(45));
        assert!(issues.is_empty());
    }

    #[test]
    fn test_terminal_state_is_exempt() {
        let tracker = tracker();
        let k = key("1");
        tracker.record_transition(&k, "active", "done", &writes(&[]), t0());
        assert!(tracker.sweep(t0() + Duration::days(1)).is_empty());
        assert_eq!(tracker.liveness_counts(t0() + Duration::days(1)).stuck, 0);
    }

    #[test]
    fn test_out_of_order_event_keeps_newer_state() {
        let tracker = tracker();
        let k = key("1");
        tracker.record_transition(&k, "draft", "active", &writes(&[]), t0());
        tracker.record_transition(
            &k,
            "active",
            "done",
            &writes(&[]),
            t0() - Duration::minutes(5),
        );

        let state = tracker.entity(&k).unwrap();
        assert_eq!(state.current_state.as_deref(), Some("active"));
        assert_eq!(state.state_entered_at, t0());
    }

    #[test]
    fn test_interaction_updates_only_last_interaction() {
        let tracker = tracker();
        let k = key("1");
        tracker.record_transition(&k, "draft", "active", &writes(&[]), t0());
        let later = t0() + Duration::minutes(3);
        tracker.record_interaction(&k, later);

        let state = tracker.entity(&k).unwrap();
        assert_eq!(state.state_entered_at, t0());
        assert_eq!(state.last_interaction_at, later);
        assert_eq!(state.current_state.as_deref(), Some("active"));
    }

    #[test]
    fn test_liveness_counts() {
        let tracker = tracker();
        tracker.record_transition(&key("1"), "draft", "active", &writes(&[]), t0());
        tracker.record_transition(
            &key("2"),
            "draft",
            "active",
            &writes(&[]),
            t0() + Duration::minutes(50),
        );
        tracker.record_interaction(&EntityKey::new("payments", "3"), t0());

        let counts = tracker.liveness_counts(t0() + Duration::minutes(65));
        assert_eq!(
            counts,
            LivenessCounts {
                tracked: 3,
                stuck: 1,
                stale: 1
            }
        );
    }

    #[test]
    fn test_concurrent_updates_to_same_and_different_entities() {
        let tracker = Arc::new(tracker());
        let handles: Vec<_> = (0..8)
            .map(|thread| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let at = t0() + Duration::seconds(i);
                        tracker.record_interaction(&key("shared"), at);
                        tracker.record_interaction(&key(&format!("own-{}", thread)), at);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tracker.tracked_count(), 9);
        let shared = tracker.entity(&key("shared")).unwrap();
        assert_eq!(shared.last_interaction_at, t0() + Duration::seconds(199));
    }

    #[test]
    fn test_concurrent_transitions_on_one_entity() {
        let tracker = Arc::new(tracker());
        let shared = key("shared");
        let handles: Vec<_> = (0..8i64)
            .map(|thread| {
                let tracker = Arc::clone(&tracker);
                let shared = shared.clone();
                std::thread::spawn(move || {
                    let mut issues = Vec::new();
                    for round in 0..50i64 {
                        // Sequence numbers 0..400 spread across threads
                        let seq = round * 8 + thread;
                        let at = t0() + Duration::seconds(seq);
                        let (from, to) = match seq % 3 {
                            0 => ("done", "draft"),
                            1 => ("draft", "active"),
                            _ => ("active", "draft"),
                        };
                        issues.extend(tracker.record_transition(&shared, from, to, &writes(&[]), at));
                    }
                    issues
                })
            })
            .collect();

        let mut issues = Vec::new();
        for handle in handles {
            issues.extend(handle.join().unwrap());
        }

        // 0, 3, ..., 399 are invalid; 1, 4, ..., 397 miss their writes
        assert_eq!(count(&issues, IssueCategory::InvalidTransition), 134);
        assert_eq!(count(&issues, IssueCategory::MissingWrite), 133);
        assert_eq!(issues.len(), 267);

        // The newest event (399, done -> draft) wins regardless of arrival order
        let state = tracker.entity(&shared).unwrap();
        assert_eq!(state.current_state.as_deref(), Some("draft"));
        assert_eq!(state.state_entered_at, t0() + Duration::seconds(399));
        assert_eq!(state.last_interaction_at, t0() + Duration::seconds(399));
        assert_eq!(tracker.tracked_count(), 1);
    }
}
