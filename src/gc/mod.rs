//! Garbage collector for stuck or abandoned units of work
//!
//! Each tick scans the reprocessing candidates: work that is both long-lived and stale
//! since its last submission is canceled, everything else is enlisted with a release
//! lag. Entries whose release time has passed are flipped back to requested and
//! republished in release-time order.

mod collector;
mod entry;

pub use collector::{GarbageCollector, GcStats};
pub use entry::CollectorEntry;
