/// Bounded issue log
pub mod issue_log;

pub use issue_log::{IssueFilter, IssueLog};
