//! Domain types for Timeslicer
//!
//! - UnitOfWork: one dispatchable task bound to a process and a time/id range
//! - Job: the state record of one (process, timeperiod) pair in a timetable tree
//! - FreerunEntry: a schedulable outside the time hierarchy
//! - MqTransmission: the reference published over the transport

pub mod freerun_entry;
pub mod job;
pub mod transmission;
pub mod unit_of_work;

pub use freerun_entry::FreerunEntry;
pub use job::{EVENT_LOG_MAX_SIZE, Job, JobState, MAX_NUMBER_OF_FAILURES, push_event};
pub use transmission::MqTransmission;
pub use unit_of_work::{UnitOfWork, UowState, UowType, next_cursor};
