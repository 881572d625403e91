//! Tree nodes and the composite state of a node's dependencies.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use crate::domain::{Job, JobState};
use crate::time::TimeQualifier;

/// One (process, timeperiod) slot in a tree
#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    pub process_name: String,
    pub timeperiod: String,
    pub time_qualifier: TimeQualifier,
    pub job: Job,
    /// Timeperiods of the child nodes one level down
    pub children: BTreeSet<String>,
}

impl TreeNode {
    pub fn new(job: Job, time_qualifier: TimeQualifier) -> Self {
        Self {
            process_name: job.process_name.clone(),
            timeperiod: job.timeperiod.clone(),
            time_qualifier,
            job,
            children: BTreeSet::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

impl fmt::Display for TreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}({})", self.process_name, self.timeperiod, self.job.state.as_str())
    }
}

/// Composite state of a node's counterparts in the trees it depends on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependentOnSummary {
    /// Counterparts whose job is not finished
    pub unfinished: Vec<String>,
    /// Counterparts whose job is neither processed nor noop
    pub unprocessed: Vec<String>,
    /// Counterparts whose job is neither active, processed nor noop
    pub unhealthy: Vec<String>,
    pub skipped: Vec<String>,
}

impl DependentOnSummary {
    pub fn enlist(&mut self, node: &TreeNode) {
        let state = node.job.state;
        let label = node.to_string();
        let processed = matches!(state, JobState::Processed | JobState::Noop);

        if !state.is_finished() {
            self.unfinished.push(label.clone());
        }
        if !processed {
            self.unprocessed.push(label.clone());
        }
        if !(state.is_active() || processed) {
            self.unhealthy.push(label.clone());
        }
        if state == JobState::Skipped {
            self.skipped.push(label);
        }
    }

    pub fn all_finished(&self) -> bool {
        self.unfinished.is_empty()
    }

    pub fn all_processed(&self) -> bool {
        self.unprocessed.is_empty()
    }

    pub fn all_healthy(&self) -> bool {
        self.unhealthy.is_empty()
    }

    pub fn skipped_present(&self) -> bool {
        !self.skipped.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(state: JobState) -> TreeNode {
        let mut job = Job::new("daily", "20200101");
        job.state = state;
        TreeNode::new(job, TimeQualifier::Daily)
    }

    #[test]
    fn test_empty_summary_is_satisfied() {
        let summary = DependentOnSummary::default();
        assert!(summary.all_finished());
        assert!(summary.all_processed());
        assert!(summary.all_healthy());
        assert!(!summary.skipped_present());
    }

    #[test]
    fn test_enlist_classification() {
        let mut summary = DependentOnSummary::default();
        summary.enlist(&node(JobState::InProgress));
        summary.enlist(&node(JobState::Processed));
        summary.enlist(&node(JobState::Skipped));
        summary.enlist(&node(JobState::Noop));

        assert_eq!(summary.unfinished.len(), 1);
        assert_eq!(summary.unprocessed.len(), 2);
        assert_eq!(summary.unhealthy.len(), 1);
        assert_eq!(summary.skipped.len(), 1);
        assert!(summary.skipped_present());
        assert!(!summary.all_finished());
    }

    #[test]
    fn test_display() {
        assert_eq!(node(JobState::Embryo).to_string(), "daily@20200101(embryo)");
    }
}
