use crate::alerts::FailedAlert;
use crate::events::{Issue, IssueCategory, Severity, Timestamp};
use crate::tracker::LivenessCounts;
use serde::Serialize;
use std::collections::BTreeMap;

/// Number of most recent issues carried in a report
pub const RECENT_ISSUE_LIMIT: usize = 20;

/// Issue counts within a report window
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IssueSummary {
    pub total: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_category: BTreeMap<IssueCategory, usize>,
    pub by_module: BTreeMap<String, usize>,
}

impl IssueSummary {
    pub fn from_issues(issues: &[Issue]) -> Self {
        let mut summary = Self {
            total: issues.len(),
            ..Self::default()
        };
        for issue in issues {
            *summary.by_severity.entry(issue.severity).or_default() += 1;
            *summary.by_category.entry(issue.category).or_default() += 1;
            *summary.by_module.entry(issue.module.clone()).or_default() += 1;
        }
        summary
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.by_severity.get(&severity).copied().unwrap_or(0)
    }
}

/// Snapshot of observed application health, handed to the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub generated_at: Timestamp,
    pub window_minutes: i64,
    pub issues: IssueSummary,
    /// Up to the last [`RECENT_ISSUE_LIMIT`] issues in the window, oldest first
    pub recent_issues: Vec<Issue>,
    pub entities: LivenessCounts,
    pub pending_alerts: usize,
    pub alerts_in_flight: usize,
    pub failed_alerts: Vec<FailedAlert>,
    pub alerts_sent: u64,
    pub issues_evicted: u64,
}

impl HealthReport {
    /// Keep only the tail of `issues` for the recent list
    pub fn recent(mut issues: Vec<Issue>) -> Vec<Issue> {
        let skip = issues.len().saturating_sub(RECENT_ISSUE_LIMIT);
        issues.drain(..skip);
        issues
    }

    /// No critical issue in the window and no alert given up on
    pub fn is_healthy(&self) -> bool {
        self.issues.count(Severity::Critical) == 0 && self.failed_alerts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EntityKey;
    use chrono::Utc;

    fn issue(module: &str, severity: Severity, category: IssueCategory) -> Issue {
        Issue::new(
            Utc::now(),
            severity,
            category,
            &EntityKey::new(module, "1"),
            "issue",
        )
    }

    #[test]
    fn test_summary_counts() {
        let issues = vec![
            issue("planning", Severity::Critical, IssueCategory::MissingWrite),
            issue("planning", Severity::Critical, IssueCategory::InvalidTransition),
            issue("money", Severity::Warning, IssueCategory::StuckState),
        ];

        let summary = IssueSummary::from_issues(&issues);

        assert_eq!(summary.total, 3);
        assert_eq!(summary.count(Severity::Critical), 2);
        assert_eq!(summary.count(Severity::Info), 0);
        assert_eq!(summary.by_category[&IssueCategory::StuckState], 1);
        assert_eq!(summary.by_module["planning"], 2);
    }

    #[test]
    fn test_summary_serializes_keys_as_names() {
        let summary = IssueSummary::from_issues(&[issue(
            "planning",
            Severity::Warning,
            IssueCategory::StuckState,
        )]);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["by_severity"]["warning"], 1);
        assert_eq!(json["by_category"]["stuck_state"], 1);
    }

    #[test]
    fn test_recent_keeps_the_tail() {
        let mut issues: Vec<Issue> = (0..30)
            .map(|_| issue("planning", Severity::Info, IssueCategory::StaleInteraction))
            .collect();
        for (i, issue) in issues.iter_mut().enumerate() {
            issue.id = i as u64 + 1;
        }

        let recent = HealthReport::recent(issues);
        assert_eq!(recent.len(), RECENT_ISSUE_LIMIT);
        assert_eq!(recent[0].id, 11);
        assert_eq!(recent.last().unwrap().id, 30);
    }
}
