//! Bounded issue log with FIFO eviction
//!
//! This module provides the IssueLog which stores detected issues in a
//! fixed-capacity ring. Appends are O(1); when the ring is full the oldest
//! issue is evicted first, regardless of severity.

use crate::events::{Issue, IssueCategory, Severity, Timestamp};
use log::debug;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Selection criteria for [`IssueLog::query`]; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct IssueFilter {
    pub since: Option<Timestamp>,
    pub severity: Option<Severity>,
    pub module: Option<String>,
    pub category: Option<IssueCategory>,
}

impl IssueFilter {
    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn category(mut self, category: IssueCategory) -> Self {
        self.category = Some(category);
        self
    }

    fn matches(&self, issue: &Issue) -> bool {
        self.since.map_or(true, |since| issue.timestamp >= since)
            && self.severity.map_or(true, |severity| issue.severity == severity)
            && self
                .module
                .as_deref()
                .map_or(true, |module| issue.module == module)
            && self.category.map_or(true, |category| issue.category == category)
    }
}

struct Ring {
    buffer: VecDeque<Issue>,
    next_id: u64,
    evicted: u64,
}

/// Shared, bounded, chronologically ordered issue store
///
/// Safe to append from many threads. Readers always get an owned copy so they
/// never iterate a structure that is being mutated.
pub struct IssueLog {
    ring: Mutex<Ring>,
    capacity: usize,
}

impl IssueLog {
    /// Default number of issues retained
    pub const DEFAULT_CAPACITY: usize = 1000;

    /// Create an issue log holding at most `capacity` issues (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                buffer: VecDeque::with_capacity(capacity),
                next_id: 1,
                evicted: 0,
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        // A panic while holding the lock cannot leave the ring half-updated,
        // so a poisoned lock is still safe to use.
        self.ring.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an issue, evicting the oldest entry when full
    ///
    /// Assigns the issue its sequence id and returns the stored copy.
    pub fn append(&self, mut issue: Issue) -> Issue {
        let mut ring = self.lock();
        issue.id = ring.next_id;
        ring.next_id += 1;

        if ring.buffer.len() >= self.capacity {
            if let Some(evicted) = ring.buffer.pop_front() {
                ring.evicted += 1;
                debug!("Issue log full, evicted issue #{}", evicted.id);
            }
        }
        ring.buffer.push_back(issue.clone());
        issue
    }

    /// Issues matching `filter`, oldest first
    pub fn query(&self, filter: &IssueFilter) -> Vec<Issue> {
        self.lock()
            .buffer
            .iter()
            .filter(|issue| filter.matches(issue))
            .cloned()
            .collect()
    }

    /// Ordered copy of every retained issue
    pub fn snapshot(&self) -> Vec<Issue> {
        self.lock().buffer.iter().cloned().collect()
    }

    /// Retained issues with an id greater than `id`, oldest first
    pub fn issues_after(&self, id: u64) -> Vec<Issue> {
        let ring = self.lock();
        // Ids grow with position, so everything newer sits at the back.
        let start = ring.buffer.partition_point(|issue| issue.id <= id);
        ring.buffer.range(start..).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of issues dropped to make room since creation
    pub fn evicted_count(&self) -> u64 {
        self.lock().evicted
    }
}

impl Default for IssueLog {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
