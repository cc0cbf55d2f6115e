//! Top-level orchestration
//!
//! The Observer is the only write path for functional modules. It wires the
//! state tracker, issue log and alert dispatcher together and compiles health
//! reports. Ingestion is synchronous and never waits on alert delivery; the
//! periodic check is where notifications are sent. Health reports read
//! dispatcher status without waiting on a check in progress.

pub mod report;

pub use report::{HealthReport, IssueSummary};

use crate::alerts::{AlertDispatcher, DispatchOutcome};
use crate::events::{EntityKey, Issue, ObservedEvent, Severity, Timestamp};
use crate::issues::{IssueFilter, IssueLog};
use crate::spec::SpecRegistry;
use crate::tracker::StateTracker;
use chrono::Duration;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;

/// What one periodic check did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckSummary {
    /// Stuck and stale issues found by the sweep
    pub swept_issues: usize,
    /// Issues handed to the dispatcher (everything logged since the last check)
    pub scanned_issues: usize,
    pub dispatch: DispatchOutcome,
}

/// Runtime quality observer
///
/// Construct one explicitly with its collaborators; share it behind an `Arc`
/// between ingesting threads and the periodic scheduler.
pub struct Observer {
    registry: Arc<SpecRegistry>,
    tracker: StateTracker,
    issues: Arc<IssueLog>,
    dispatcher: AlertDispatcher,
    /// Id of the last issue handed to the dispatcher; serializes checks
    scanned_through: tokio::sync::Mutex<u64>,
}

impl Observer {
    pub fn new(
        registry: Arc<SpecRegistry>,
        issues: Arc<IssueLog>,
        dispatcher: AlertDispatcher,
    ) -> Self {
        info!(
            "Observer watching {} specified modules, issue log capacity {}",
            registry.module_names().len(),
            issues.capacity()
        );
        Self {
            tracker: StateTracker::new(Arc::clone(&registry)),
            registry,
            issues,
            dispatcher,
            scanned_through: tokio::sync::Mutex::new(0),
        }
    }

    /// Record one observed event for an entity
    ///
    /// Never fails: anomalies are logged and returned, the event is always
    /// accepted.
    pub fn ingest(&self, module: &str, entity_id: &str, event: &ObservedEvent) -> Vec<Issue> {
        let key = EntityKey::new(module, entity_id);
        let detected = match event {
            ObservedEvent::Transition {
                from,
                to,
                writes,
                at,
            } => self.tracker.record_transition(&key, from, to, writes, *at),
            ObservedEvent::Interaction { at } => {
                self.tracker.record_interaction(&key, *at);
                Vec::new()
            }
        };

        detected.into_iter().map(|issue| self.log_issue(issue)).collect()
    }

    /// Sweep for stuck/stale entities, alert on new issues, drain the queue
    ///
    /// Each step is safe to repeat; an interrupted check loses at most the
    /// in-memory pending alerts, never logged issues.
    pub async fn run_periodic_check(&self, now: Timestamp) -> CheckSummary {
        let swept: Vec<Issue> = self
            .tracker
            .sweep(now)
            .into_iter()
            .map(|issue| self.log_issue(issue))
            .collect();

        let mut scanned_through = self.scanned_through.lock().await;
        let fresh = self.issues.issues_after(*scanned_through);
        if let Some(last) = fresh.last() {
            *scanned_through = last.id;
        }

        let mut dispatch = self.dispatcher.notify_qualifying(&fresh, now).await;
        dispatch.merge(self.dispatcher.drain_pending(now).await);

        let summary = CheckSummary {
            swept_issues: swept.len(),
            scanned_issues: fresh.len(),
            dispatch,
        };
        debug!("Periodic check at {}: {:?}", now, summary);
        summary
    }

    /// Aggregate the issues of the last `window` with current entity health
    pub async fn health_report(&self, window: Duration, now: Timestamp) -> HealthReport {
        let in_window = self
            .issues
            .query(&IssueFilter::default().since(now - window));
        HealthReport {
            generated_at: now,
            window_minutes: window.num_minutes(),
            issues: IssueSummary::from_issues(&in_window),
            recent_issues: HealthReport::recent(in_window),
            entities: self.tracker.liveness_counts(now),
            pending_alerts: self.dispatcher.pending_count(),
            alerts_in_flight: self.dispatcher.in_flight_count(),
            failed_alerts: self.dispatcher.failed_alerts(),
            alerts_sent: self.dispatcher.sent_count(),
            issues_evicted: self.issues.evicted_count(),
        }
    }

    pub fn registry(&self) -> &SpecRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    pub fn issue_log(&self) -> &IssueLog {
        &self.issues
    }

    fn log_issue(&self, issue: Issue) -> Issue {
        let issue = self.issues.append(issue);
        if issue.severity >= Severity::Warning {
            warn!("[{}] {}: {}", issue.severity, issue.category, issue.message);
        } else {
            info!("[{}] {}: {}", issue.severity, issue.category, issue.message);
        }
        issue
    }
}
