//! Job record: the state of one (process, timeperiod) pair in a timetable tree

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::id::job_id;
use crate::storage::HasId;

/// Maximum number of entries kept in a job or schedulable event log
pub const EVENT_LOG_MAX_SIZE: usize = 128;

/// Failures tolerated on a leaf node before it is skipped
pub const MAX_NUMBER_OF_FAILURES: u32 = 3;

/// State of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Materialized but not yet dispatched
    Embryo,
    /// A unit of work has been dispatched
    InProgress,
    /// Period closed, last unit of work dispatched
    FinalRun,
    Processed,
    Skipped,
    /// Period grouped out, never dispatched
    Noop,
}

impl JobState {
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Embryo | JobState::InProgress | JobState::FinalRun)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Processed | JobState::Skipped | JobState::Noop)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Embryo => "embryo",
            JobState::InProgress => "in_progress",
            JobState::FinalRun => "final_run",
            JobState::Processed => "processed",
            JobState::Skipped => "skipped",
            JobState::Noop => "noop",
        }
    }
}

/// One job per (process_name, timeperiod)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub process_name: String,
    pub timeperiod: String,
    pub state: JobState,
    pub related_unit_of_work: Option<String>,
    pub number_of_failures: u32,
    /// Bumped by every timetable write that changes the job
    #[serde(default)]
    pub revision: u64,
    /// Newest entry first
    #[serde(default)]
    pub event_log: VecDeque<String>,
}

impl Job {
    /// Create an embryo job
    pub fn new(process_name: &str, timeperiod: &str) -> Self {
        Self {
            id: job_id(process_name, timeperiod),
            process_name: process_name.to_string(),
            timeperiod: timeperiod.to_string(),
            state: JobState::Embryo,
            related_unit_of_work: None,
            number_of_failures: 0,
            revision: 0,
            event_log: VecDeque::new(),
        }
    }

    /// Create a job for a period that is grouped out
    pub fn new_noop(process_name: &str, timeperiod: &str) -> Self {
        let mut job = Self::new(process_name, timeperiod);
        job.state = JobState::Noop;
        job
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// Prepend an entry, dropping the oldest one past the cap
    pub fn add_log_entry(&mut self, entry: impl Into<String>) {
        push_event(&mut self.event_log, entry.into());
    }
}

impl HasId for Job {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Push onto a bounded newest-first event log
pub fn push_event(log: &mut VecDeque<String>, entry: String) {
    log.push_front(entry);
    log.truncate(EVENT_LOG_MAX_SIZE);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_is_embryo() {
        let job = Job::new("hourly", "2020010100");
        assert_eq!(job.state, JobState::Embryo);
        assert_eq!(job.id, "hourly@2020010100");
        assert!(job.is_active());
        assert!(job.related_unit_of_work.is_none());
    }

    #[test]
    fn test_noop_job_is_finished() {
        let job = Job::new_noop("hourly", "2020010101");
        assert!(job.is_finished());
        assert!(!job.is_active());
    }

    #[test]
    fn test_state_classification() {
        assert!(JobState::FinalRun.is_active());
        assert!(JobState::Skipped.is_finished());
        assert!(!JobState::InProgress.is_finished());
    }

    #[test]
    fn test_event_log_is_bounded_newest_first() {
        let mut job = Job::new("hourly", "2020010100");
        for i in 0..(EVENT_LOG_MAX_SIZE + 10) {
            job.add_log_entry(format!("entry {}", i));
        }
        assert_eq!(job.event_log.len(), EVENT_LOG_MAX_SIZE);
        assert_eq!(job.event_log.front().map(String::as_str), Some("entry 137"));
        assert_eq!(job.event_log.back().map(String::as_str), Some("entry 10"));
    }

    #[test]
    fn test_serialization_roundtrip_keeps_state() {
        let mut job = Job::new("daily", "20200101");
        job.state = JobState::FinalRun;
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"final_run\""));
        let restored: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, job);
    }
}
