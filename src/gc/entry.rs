//! Reprocessing queue entries.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::UnitOfWork;

/// A unit of work waiting in the collector until its release time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectorEntry {
    pub uow_id: String,
    pub process_name: String,
    pub timeperiod: String,
    pub release_time: DateTime<Utc>,
    /// Enlistment order; breaks ties between equal release times
    pub seq: u64,
}

impl CollectorEntry {
    pub fn new(uow: &UnitOfWork, release_time: DateTime<Utc>, seq: u64) -> Self {
        Self {
            uow_id: uow.id.clone(),
            process_name: uow.process_name.clone(),
            timeperiod: uow.timeperiod.clone(),
            release_time,
            seq,
        }
    }

    pub fn key(&self) -> (DateTime<Utc>, u64) {
        (self.release_time, self.seq)
    }
}

/// Per-process queue ordered by `(release_time, seq)`
#[derive(Debug, Default)]
pub(super) struct ProcessQueue {
    entries: BTreeMap<(DateTime<Utc>, u64), CollectorEntry>,
    members: HashSet<String>,
}

impl ProcessQueue {
    pub(super) fn contains(&self, uow_id: &str) -> bool {
        self.members.contains(uow_id)
    }

    pub(super) fn push(&mut self, entry: CollectorEntry) {
        self.members.insert(entry.uow_id.clone());
        self.entries.insert(entry.key(), entry);
    }

    /// Earliest entry, if it is due at `now`
    pub(super) fn pop_due(&mut self, now: DateTime<Utc>) -> Option<CollectorEntry> {
        let (key, _) = self.entries.first_key_value()?;
        if key.0 > now {
            return None;
        }
        self.pop_first()
    }

    pub(super) fn pop_first(&mut self) -> Option<CollectorEntry> {
        let (_, entry) = self.entries.pop_first()?;
        self.members.remove(&entry.uow_id);
        Some(entry)
    }

    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(super) fn iter(&self) -> impl Iterator<Item = &CollectorEntry> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UowType;
    use chrono::{Duration, TimeZone};

    fn uow(tp: &str) -> UnitOfWork {
        let now = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        UnitOfWork::new("hourly", tp, tp, tp, "0", "0", UowType::Managed, now)
    }

    #[test]
    fn test_equal_release_times_keep_enlistment_order() {
        let t = Utc.with_ymd_and_hms(2020, 1, 1, 0, 15, 0).unwrap();
        let mut queue = ProcessQueue::default();
        queue.push(CollectorEntry::new(&uow("2020010102"), t, 7));
        queue.push(CollectorEntry::new(&uow("2020010101"), t, 3));

        assert_eq!(queue.pop_due(t).unwrap().seq, 3);
        assert_eq!(queue.pop_due(t).unwrap().seq, 7);
        assert!(queue.pop_due(t).is_none());
    }

    #[test]
    fn test_pop_due_stops_at_future_entry() {
        let t = Utc.with_ymd_and_hms(2020, 1, 1, 0, 15, 0).unwrap();
        let mut queue = ProcessQueue::default();
        let entry = CollectorEntry::new(&uow("2020010100"), t, 0);
        let id = entry.uow_id.clone();
        queue.push(entry);

        assert!(queue.pop_due(t - Duration::minutes(1)).is_none());
        assert!(queue.contains(&id));
        assert!(queue.pop_due(t).is_some());
        assert!(!queue.contains(&id));
        assert_eq!(queue.len(), 0);
    }
}
