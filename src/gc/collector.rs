//! The collector and its per-process reprocessing queues.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};

use super::entry::{CollectorEntry, ProcessQueue};
use crate::config::{GcConfig, ProcessRegistry};
use crate::domain::{MqTransmission, UnitOfWork, UowState};
use crate::error::{Result, SchedulerError};
use crate::storage::{Storage, UowDao};
use crate::transport::{Publisher, QUEUE_UOW_REPORT, worker_queue};

/// What one collector pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub enlisted: usize,
    pub canceled: usize,
    pub reposted: usize,
}

#[derive(Default)]
struct GcState {
    queues: HashMap<String, ProcessQueue>,
    next_seq: u64,
}

pub struct GarbageCollector {
    state: Mutex<GcState>,
    config: GcConfig,
    registry: Arc<ProcessRegistry>,
    uow_dao: UowDao,
    publisher: Arc<dyn Publisher>,
}

impl GarbageCollector {
    pub fn new(
        config: GcConfig,
        registry: Arc<ProcessRegistry>,
        storage: Arc<dyn Storage>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            state: Mutex::new(GcState::default()),
            config,
            registry,
            uow_dao: UowDao::new(storage),
            publisher,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, GcState>> {
        self.state.lock().map_err(SchedulerError::poisoned)
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// One full tick: enlist or cancel candidates, then repost what is due
    pub fn run(&self, now: DateTime<Utc>) -> Result<GcStats> {
        let mut stats = self.enlist_or_cancel(now)?;
        stats.reposted = self.repost(now)?;
        if stats != GcStats::default() {
            log::info!(
                "GC pass: {} enlisted, {} canceled, {} reposted",
                stats.enlisted,
                stats.canceled,
                stats.reposted
            );
        }
        Ok(stats)
    }

    //=== Enlisting ===

    /// Scan reprocessing candidates created at or after the system start boundary
    pub fn enlist_or_cancel(&self, now: DateTime<Utc>) -> Result<GcStats> {
        let mut state = self.lock()?;
        let candidates = self.uow_dao.get_reprocessing_candidates(self.registry.start_timeperiod())?;
        let mut stats = GcStats::default();

        for uow in candidates {
            match self.registry.get(&uow.process_name) {
                Ok(process) if process.is_on => {}
                Ok(_) => {
                    log::debug!("Process {} is inactive; skipping UOW {}", uow.process_name, uow.id);
                    continue;
                }
                Err(_) => {
                    log::debug!("Process {} is not registered; skipping UOW {}", uow.process_name, uow.id);
                    continue;
                }
            }

            if state
                .queues
                .get(&uow.process_name)
                .is_some_and(|q| q.contains(&uow.id))
            {
                continue;
            }

            if self.is_beyond_life_support(&uow, now) {
                self.cancel(uow, now)?;
                stats.canceled += 1;
            } else {
                let release_time = now + Duration::minutes(self.config.release_lag_minutes);
                let seq = state.next_seq;
                state.next_seq += 1;
                log::info!(
                    "UOW {} for {}@{} enlisted for reprocessing at {}",
                    uow.id,
                    uow.process_name,
                    uow.timeperiod,
                    release_time
                );
                state
                    .queues
                    .entry(uow.process_name.clone())
                    .or_default()
                    .push(CollectorEntry::new(&uow, release_time, seq));
                stats.enlisted += 1;
            }
        }
        Ok(stats)
    }

    /// Long-lived and stale since the last submission
    fn is_beyond_life_support(&self, uow: &UnitOfWork, now: DateTime<Utc>) -> bool {
        let submitted_at = uow.submitted_at.unwrap_or(uow.created_at);
        now - uow.created_at > Duration::hours(self.config.life_support_hours)
            && now - submitted_at > Duration::hours(self.config.resubmit_after_hours)
    }

    fn cancel(&self, mut uow: UnitOfWork, now: DateTime<Utc>) -> Result<()> {
        uow.state = UowState::Canceled;
        uow.finished_at = Some(now);
        self.uow_dao.update(&uow)?;
        self.publisher
            .publish(QUEUE_UOW_REPORT, &MqTransmission::new(&uow.process_name, &uow.id))?;
        log::warn!(
            "UOW {} for {}@{} transferred to canceled after {} retries",
            uow.id,
            uow.process_name,
            uow.timeperiod,
            uow.number_of_retries
        );
        Ok(())
    }

    /// Operator-forced enlist pass
    pub fn scan_uow_candidates(&self, now: DateTime<Utc>) -> Result<GcStats> {
        self.enlist_or_cancel(now)
    }

    pub fn validate(&self, now: DateTime<Utc>) -> Result<GcStats> {
        self.scan_uow_candidates(now)
    }

    //=== Reposting ===

    /// Resubmit every entry whose release time has come, in release-time order
    pub fn repost(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut state = self.lock()?;
        let mut reposted = 0;
        for (process_name, queue) in state.queues.iter_mut() {
            while let Some(entry) = queue.pop_due(now) {
                match self.resubmit(&entry, now) {
                    Ok(true) => reposted += 1,
                    Ok(false) => {}
                    Err(e) => {
                        // Retried next tick; the other queues still drain
                        log::error!("Failed to repost UOW {} for {}: {}", entry.uow_id, process_name, e);
                        queue.push(entry);
                        break;
                    }
                }
            }
        }
        Ok(reposted)
    }

    /// Drain one process's queue ignoring release times
    pub fn flush_one(&self, process_name: &str, now: DateTime<Utc>) -> Result<usize> {
        self.registry.get(process_name)?;
        let mut state = self.lock()?;
        let mut flushed = 0;
        if let Some(queue) = state.queues.get_mut(process_name) {
            while let Some(entry) = queue.pop_first() {
                match self.resubmit(&entry, now) {
                    Ok(true) => flushed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        queue.push(entry);
                        return Err(e);
                    }
                }
            }
        }
        log::info!("Flushed {} entries for {}", flushed, process_name);
        Ok(flushed)
    }

    /// Drain every queue ignoring release times
    pub fn flush_all(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut state = self.lock()?;
        let mut flushed = 0;
        for queue in state.queues.values_mut() {
            while let Some(entry) = queue.pop_first() {
                match self.resubmit(&entry, now) {
                    Ok(true) => flushed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        queue.push(entry);
                        return Err(e);
                    }
                }
            }
        }
        log::info!("Flushed {} entries", flushed);
        Ok(flushed)
    }

    /// Flip the entry's unit of work back to requested and publish it.
    ///
    /// Returns false when the work resolved while it waited in the queue.
    fn resubmit(&self, entry: &CollectorEntry, now: DateTime<Utc>) -> Result<bool> {
        let mut uow = match self.uow_dao.get_one(&entry.uow_id) {
            Ok(uow) => uow,
            Err(e) if e.is_lookup() => {
                log::warn!("Enlisted UOW {} disappeared: {}", entry.uow_id, e);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        if !uow.is_active() {
            log::debug!("UOW {} resolved as {} while enlisted", uow.id, uow.state.as_str());
            return Ok(false);
        }

        if uow.state == UowState::Invalid {
            uow.number_of_retries += 1;
        }
        uow.state = UowState::Requested;
        uow.submitted_at = Some(now);
        self.uow_dao.update(&uow)?;
        self.publisher
            .publish(&worker_queue(&uow.process_name), &MqTransmission::new(&uow.process_name, &uow.id))?;
        log::info!(
            "UOW {} for {}@{} resubmitted; attempt {}",
            uow.id,
            uow.process_name,
            uow.timeperiod,
            uow.number_of_retries
        );
        Ok(true)
    }

    //=== Snapshots ===

    /// Enlisted entries per process, in release order
    pub fn queue_snapshot(&self) -> Result<BTreeMap<String, Vec<CollectorEntry>>> {
        Ok(self
            .lock()?
            .queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(name, q)| (name.clone(), q.iter().cloned().collect()))
            .collect())
    }

    /// Timeperiods enlisted for a process, sorted
    pub fn reprocessing_timeperiods(&self, process_name: &str) -> Result<Vec<String>> {
        let state = self.lock()?;
        let mut timeperiods: Vec<String> = state
            .queues
            .get(process_name)
            .map(|q| q.iter().map(|e| e.timeperiod.clone()).collect())
            .unwrap_or_default();
        timeperiods.sort();
        Ok(timeperiods)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProcessEntry, TimeslicerConfig};
    use crate::domain::UowType;
    use crate::storage::MemoryStorage;
    use crate::transport::MemoryTransport;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 3, 12, 0, 0).unwrap()
    }

    struct Fixture {
        gc: GarbageCollector,
        uow_dao: UowDao,
        transport: Arc<MemoryTransport>,
    }

    fn fixture() -> Fixture {
        let registry = ProcessRegistry::from_config(&TimeslicerConfig {
            processes: vec![
                ProcessEntry::new("hourly_site", "hourly", "discrete"),
                ProcessEntry::new("hourly_alerts", "hourly", "discrete"),
                ProcessEntry::new("daily_site", "daily", "discrete"),
                ProcessEntry::new("yearly_site", "yearly", "discrete"),
                ProcessEntry {
                    is_on: false,
                    ..ProcessEntry::new("hourly_paused", "hourly", "discrete")
                },
            ],
            ..Default::default()
        })
        .unwrap();
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let transport = Arc::new(MemoryTransport::new());
        fixture_with(registry, storage, transport.clone(), transport)
    }

    fn fixture_with(
        registry: ProcessRegistry,
        storage: Arc<dyn Storage>,
        transport: Arc<MemoryTransport>,
        publisher: Arc<dyn Publisher>,
    ) -> Fixture {
        Fixture {
            gc: GarbageCollector::new(GcConfig::default(), Arc::new(registry), storage.clone(), publisher),
            uow_dao: UowDao::new(storage),
            transport,
        }
    }

    fn insert_uow(f: &Fixture, process: &str, tp: &str, state: UowState, created_at: DateTime<Utc>) -> UnitOfWork {
        let mut uow = UnitOfWork::new(process, tp, tp, tp, "0", "0", UowType::Managed, created_at);
        uow.state = state;
        f.uow_dao.insert(&uow).unwrap();
        uow
    }

    #[test]
    fn test_release_lag_holds_back_repost() {
        let f = fixture();
        let uow = insert_uow(&f, "hourly_site", "2020010300", UowState::Invalid, t0());

        let stats = f.gc.enlist_or_cancel(t0()).unwrap();
        assert_eq!(stats.enlisted, 1);

        assert_eq!(f.gc.repost(t0() + Duration::minutes(10)).unwrap(), 0);
        assert_eq!(f.gc.repost(t0() + Duration::minutes(16)).unwrap(), 1);

        let reposted = f.uow_dao.get_one(&uow.id).unwrap();
        assert_eq!(reposted.state, UowState::Requested);
        assert_eq!(reposted.number_of_retries, 1);
        assert_eq!(reposted.submitted_at, Some(t0() + Duration::minutes(16)));
        assert_eq!(f.transport.published_to("q_hourly_site").unwrap().len(), 1);
    }

    #[test]
    fn test_slow_work_requeue_does_not_count_retry() {
        let f = fixture();
        let uow = insert_uow(&f, "hourly_site", "2020010300", UowState::InProgress, t0());
        f.gc.run(t0()).unwrap();
        f.gc.repost(t0() + Duration::minutes(20)).unwrap();

        let reposted = f.uow_dao.get_one(&uow.id).unwrap();
        assert_eq!(reposted.state, UowState::Requested);
        assert_eq!(reposted.number_of_retries, 0);
    }

    #[test]
    fn test_repost_in_release_order() {
        let f = fixture();
        let c = insert_uow(&f, "hourly_site", "2020010302", UowState::Invalid, t0());
        f.gc.enlist_or_cancel(t0() + Duration::minutes(20)).unwrap();
        let a = insert_uow(&f, "hourly_site", "2020010300", UowState::Invalid, t0());
        f.gc.enlist_or_cancel(t0()).unwrap();
        let b = insert_uow(&f, "hourly_site", "2020010301", UowState::Invalid, t0());
        f.gc.enlist_or_cancel(t0() + Duration::minutes(10)).unwrap();

        // Releases at +15, +25 and +35 minutes
        assert_eq!(f.gc.repost(t0() + Duration::minutes(30)).unwrap(), 2);

        let order: Vec<String> = f
            .transport
            .published_to("q_hourly_site")
            .unwrap()
            .into_iter()
            .map(|m| m.record_db_id)
            .collect();
        assert_eq!(order, vec![a.id, b.id]);
        assert_eq!(f.gc.reprocessing_timeperiods("hourly_site").unwrap(), vec!["2020010302"]);
        assert_eq!(f.uow_dao.get_one(&c.id).unwrap().state, UowState::Invalid);
    }

    #[test]
    fn test_already_enlisted_is_not_enlisted_twice() {
        let f = fixture();
        insert_uow(&f, "hourly_site", "2020010300", UowState::Invalid, t0());
        assert_eq!(f.gc.enlist_or_cancel(t0()).unwrap().enlisted, 1);
        assert_eq!(f.gc.enlist_or_cancel(t0() + Duration::minutes(1)).unwrap().enlisted, 0);
        assert_eq!(f.gc.queue_snapshot().unwrap()["hourly_site"].len(), 1);
    }

    #[test]
    fn test_cancellation_needs_both_age_and_staleness() {
        let f = fixture();
        let old = t0() - Duration::hours(49);

        // Old but submitted recently: kept alive
        let mut fresh = insert_uow(&f, "hourly_site", "2020010100", UowState::Requested, old);
        fresh.submitted_at = Some(t0() - Duration::minutes(30));
        f.uow_dao.update(&fresh).unwrap();

        // Old and stale: canceled
        let mut stale = insert_uow(&f, "hourly_site", "2020010101", UowState::Requested, old);
        stale.submitted_at = Some(t0() - Duration::hours(2));
        f.uow_dao.update(&stale).unwrap();

        // Stale but young: kept alive
        let mut young = insert_uow(&f, "hourly_site", "2020010102", UowState::Invalid, t0() - Duration::hours(10));
        young.submitted_at = Some(t0() - Duration::hours(2));
        f.uow_dao.update(&young).unwrap();

        let stats = f.gc.enlist_or_cancel(t0()).unwrap();
        assert_eq!(stats.canceled, 1);
        assert_eq!(stats.enlisted, 2);

        assert_eq!(f.uow_dao.get_one(&stale.id).unwrap().state, UowState::Canceled);
        assert_eq!(f.uow_dao.get_one(&fresh.id).unwrap().state, UowState::Requested);
        let report = f.transport.published_to(QUEUE_UOW_REPORT).unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].record_db_id, stale.id);
    }

    #[test]
    fn test_inactive_and_unknown_processes_are_ignored() {
        let f = fixture();
        insert_uow(&f, "hourly_paused", "2020010300", UowState::Invalid, t0());
        insert_uow(&f, "hourly_ghost", "2020010300", UowState::Invalid, t0());
        assert_eq!(f.gc.enlist_or_cancel(t0()).unwrap(), GcStats::default());
    }

    #[test]
    fn test_resolved_work_is_dropped_on_repost() {
        let f = fixture();
        let mut uow = insert_uow(&f, "hourly_site", "2020010300", UowState::Invalid, t0());
        f.gc.enlist_or_cancel(t0()).unwrap();
        uow.state = UowState::Processed;
        f.uow_dao.update(&uow).unwrap();

        assert_eq!(f.gc.repost(t0() + Duration::minutes(16)).unwrap(), 0);
        assert_eq!(f.uow_dao.get_one(&uow.id).unwrap().state, UowState::Processed);
        assert!(f.gc.queue_snapshot().unwrap().is_empty());
    }

    #[test]
    fn test_coarse_work_at_the_start_boundary_is_collected() {
        let f = fixture();
        let daily = insert_uow(&f, "daily_site", "20200101", UowState::Invalid, t0());
        let yearly = insert_uow(&f, "yearly_site", "2020", UowState::Invalid, t0());

        let stats = f.gc.enlist_or_cancel(t0()).unwrap();
        assert_eq!(stats.enlisted, 2);
        assert_eq!(f.gc.reprocessing_timeperiods("daily_site").unwrap(), vec![daily.timeperiod]);
        assert_eq!(f.gc.reprocessing_timeperiods("yearly_site").unwrap(), vec![yearly.timeperiod]);
    }

    /// Publisher that refuses one queue and forwards the rest
    struct RefusingPublisher {
        refused: String,
        inner: Arc<MemoryTransport>,
    }

    impl Publisher for RefusingPublisher {
        fn publish(&self, queue: &str, message: &MqTransmission) -> Result<()> {
            if queue == self.refused {
                return Err(SchedulerError::Transport(format!("{} is unreachable", queue)));
            }
            self.inner.publish(queue, message)
        }
    }

    #[test]
    fn test_failed_repost_keeps_entry_and_other_queues_drain() {
        let base = fixture();
        let registry = ProcessRegistry::from_config(&TimeslicerConfig {
            processes: vec![
                ProcessEntry::new("hourly_site", "hourly", "discrete"),
                ProcessEntry::new("hourly_alerts", "hourly", "discrete"),
            ],
            ..Default::default()
        })
        .unwrap();
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let publisher: Arc<dyn Publisher> = Arc::new(RefusingPublisher {
            refused: "q_hourly_site".to_string(),
            inner: base.transport.clone(),
        });
        let f = fixture_with(registry, storage, base.transport.clone(), publisher);

        let blocked = insert_uow(&f, "hourly_site", "2020010300", UowState::Invalid, t0());
        let healthy = insert_uow(&f, "hourly_alerts", "2020010300", UowState::Invalid, t0());
        f.gc.enlist_or_cancel(t0()).unwrap();

        assert_eq!(f.gc.repost(t0() + Duration::minutes(16)).unwrap(), 1);
        let delivered = f.transport.published_to("q_hourly_alerts").unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].record_db_id, healthy.id);

        let queue = f.gc.queue_snapshot().unwrap();
        assert_eq!(queue["hourly_site"].len(), 1);
        assert_eq!(queue["hourly_site"][0].uow_id, blocked.id);
        assert!(!queue.contains_key("hourly_alerts"));
        assert!(f.gc.flush_one("hourly_site", t0()).is_err());
        assert_eq!(f.gc.queue_snapshot().unwrap()["hourly_site"].len(), 1);
    }

    #[test]
    fn test_flush_ignores_release_time() {
        let f = fixture();
        insert_uow(&f, "hourly_site", "2020010300", UowState::Invalid, t0());
        insert_uow(&f, "hourly_site", "2020010301", UowState::Invalid, t0());
        f.gc.enlist_or_cancel(t0()).unwrap();

        assert_eq!(f.gc.flush_one("hourly_site", t0()).unwrap(), 2);
        assert!(f.gc.flush_one("hourly_ghost", t0()).unwrap_err().is_lookup());
        assert_eq!(f.gc.flush_all(t0()).unwrap(), 0);
    }
}
