//! Scheduler: timers, workers and the management surface.
//!
//! Every managed process, freerun schedulable and the garbage collector owns one
//! `RepeatTimer`. A fire runs the matching worker on the blocking pool:
//!
//! - **Managed worker**: takes the next job record of the process and runs it through
//!   the state machine, draining finished jobs within one fire
//! - **Freerun worker**: fires the schedulable's state machine
//! - **Garbage collector**: enlists, cancels and reposts stuck work, then grows and
//!   validates the trees
//!
//! The completion listeners run as single-consumer tasks beside the timers.

mod service;
mod timer;

pub use service::{GC_HANDLER, Scheduler};
pub use timer::{Callback, RepeatTimer};
