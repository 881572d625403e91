//! Timeslicer - a time-sliced job scheduler
//!
//! Processes are arranged in timetable trees by time granularity (yearly, monthly,
//! daily, hourly). Each (process, timeperiod) pair is a job driven by a state machine
//! that dispatches units of work to workers; a garbage collector resubmits or cancels
//! work that gets stuck.

pub mod config;
pub mod domain;
pub mod error;
pub mod gc;
pub mod id;
pub mod notify;
pub mod scheduler;
pub mod state_machine;
pub mod storage;
pub mod time;
pub mod timetable;
pub mod transport;

pub use error::{Result, SchedulerError};
