//! Completion handling
//!
//! `UowStatusListener` applies finished units of work to their jobs. `JobStatusListener`
//! hands finished jobs to the `Broadcaster`, which wakes the dependant processes once
//! per completion event.

mod broadcaster;
mod listener;

pub use broadcaster::{Broadcaster, Trigger};
pub use listener::{Delivery, JobStatusListener, UowStatusListener};
