//! Unit of work record and related types
//!
//! A unit of work is one dispatchable task bound to a process and a time/id range.
//! Its lifecycle is independent of the timetable tree; a Job only references it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::id::uow_id;
use crate::storage::HasId;

/// Lifecycle state of a unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UowState {
    /// Published, waiting for a worker
    Requested,
    /// Picked up by a worker
    InProgress,
    /// Completed successfully
    Processed,
    /// Abandoned by the garbage collector or an operator
    Canceled,
    /// Worker failed, eligible for garbage collection
    Invalid,
    /// Completed with nothing to do
    Noop,
}

impl UowState {
    /// Work that may still produce a result
    pub fn is_active(&self) -> bool {
        matches!(self, UowState::Requested | UowState::InProgress | UowState::Invalid)
    }

    /// Work that reached a terminal outcome
    pub fn is_finished(&self) -> bool {
        matches!(self, UowState::Processed | UowState::Canceled | UowState::Noop)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UowState::Requested => "requested",
            UowState::InProgress => "in_progress",
            UowState::Processed => "processed",
            UowState::Canceled => "canceled",
            UowState::Invalid => "invalid",
            UowState::Noop => "noop",
        }
    }
}

/// Who drives the unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UowType {
    /// Bound to a timetable job
    Managed,
    /// Bound to a freerun schedulable
    Freerun,
}

/// A persisted unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOfWork {
    //=== Identity ===
    /// Derived from process name and boundaries
    pub id: String,
    /// Process name, or schedulable name for freerun work
    pub process_name: String,
    /// Timeperiod of the job that owns this work
    pub timeperiod: String,

    //=== Boundaries ===
    pub start_timeperiod: String,
    pub end_timeperiod: String,
    /// Opaque cursor into the source collection
    pub start_id: String,
    pub end_id: String,

    //=== Runtime State ===
    pub state: UowState,
    pub number_of_retries: u32,
    pub unit_of_work_type: UowType,

    //=== Payload ===
    pub source: Option<String>,
    pub sink: Option<String>,
    #[serde(default)]
    pub arguments: Map<String, Value>,

    //=== Timestamps ===
    pub created_at: DateTime<Utc>,
    /// Last time the work was published to a worker
    pub submitted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl UnitOfWork {
    /// Create a new requested unit of work for the given boundaries
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        process_name: &str,
        timeperiod: &str,
        start_timeperiod: &str,
        end_timeperiod: &str,
        start_id: &str,
        end_id: &str,
        unit_of_work_type: UowType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uow_id(process_name, start_timeperiod, end_timeperiod, start_id, end_id),
            process_name: process_name.to_string(),
            timeperiod: timeperiod.to_string(),
            start_timeperiod: start_timeperiod.to_string(),
            end_timeperiod: end_timeperiod.to_string(),
            start_id: start_id.to_string(),
            end_id: end_id.to_string(),
            state: UowState::Requested,
            number_of_retries: 0,
            unit_of_work_type,
            source: None,
            sink: None,
            arguments: Map::new(),
            created_at: now,
            submitted_at: Some(now),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_source_sink(mut self, source: Option<String>, sink: Option<String>) -> Self {
        self.source = source;
        self.sink = sink;
        self
    }

    pub fn with_arguments(mut self, arguments: Map<String, Value>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    pub fn is_managed(&self) -> bool {
        self.unit_of_work_type == UowType::Managed
    }

    /// Put finished or invalid work back into the requested state for another run
    pub fn recycle(&mut self, now: DateTime<Utc>) {
        self.state = UowState::Requested;
        self.number_of_retries = 0;
        self.created_at = now;
        self.submitted_at = Some(now);
        self.started_at = None;
        self.finished_at = None;
    }
}

impl HasId for UnitOfWork {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Cursor following `end_id`; opaque cursors restart at zero
pub fn next_cursor(end_id: &str) -> String {
    match end_id.parse::<u64>() {
        Ok(n) => (n + 1).to_string(),
        Err(_) => "0".to_string(),
    }
}
