//! Typed data access objects over a [`Storage`] backend.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::traits::{Filter, HasId, Storage};
use super::{COLLECTION_FREERUN_PROCESS, COLLECTION_UNIT_OF_WORK, job_collection};
use crate::domain::{FreerunEntry, Job, UnitOfWork, UowState, UowType};
use crate::error::{Result, SchedulerError};
use crate::time::{TimeQualifier, cast_to_time_qualifier, parse_timeperiod};

fn to_value<T: Serialize>(record: &T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(record)?)
}

fn from_values<T: DeserializeOwned>(values: Vec<serde_json::Value>) -> Result<Vec<T>> {
    values
        .into_iter()
        .map(|v| serde_json::from_value(v).map_err(SchedulerError::from))
        .collect()
}

fn fetch<T: DeserializeOwned>(storage: &dyn Storage, collection: &str, id: &str) -> Result<T> {
    match storage.get_one(collection, id)? {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => Err(SchedulerError::NotFound(format!("{} in {}", id, collection))),
    }
}

fn upsert<T: Serialize + HasId>(storage: &dyn Storage, collection: &str, record: &T) -> Result<()> {
    storage.update(collection, &to_value(record)?)
}

/// Unit of work persistence
#[derive(Clone)]
pub struct UowDao {
    storage: Arc<dyn Storage>,
}

impl UowDao {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn get_one(&self, id: &str) -> Result<UnitOfWork> {
        fetch(self.storage.as_ref(), COLLECTION_UNIT_OF_WORK, id)
    }

    /// Insert a new unit of work; `DuplicateKey` if one exists for the same boundaries
    pub fn insert(&self, uow: &UnitOfWork) -> Result<()> {
        self.storage.insert(COLLECTION_UNIT_OF_WORK, &to_value(uow)?)
    }

    pub fn update(&self, uow: &UnitOfWork) -> Result<()> {
        upsert(self.storage.as_ref(), COLLECTION_UNIT_OF_WORK, uow)
    }

    /// Fetch the record that made an insert of `uow` collide
    pub fn recover_from_duplicate(&self, uow: &UnitOfWork) -> Result<UnitOfWork> {
        self.get_one(&uow.id)
    }

    /// Managed units of work that may need reprocessing, starting at or after `since`
    ///
    /// `since` is cast to the qualifier of each unit of work before comparing, so
    /// coarse work covering the boundary period is included.
    pub fn get_reprocessing_candidates(&self, since: &str) -> Result<Vec<UnitOfWork>> {
        let filters = [
            Filter::one_of(
                "state",
                &[UowState::Requested, UowState::InProgress, UowState::Invalid],
            ),
            Filter::eq("unit_of_work_type", UowType::Managed),
        ];
        let found: Vec<UnitOfWork> = from_values(self.storage.query(COLLECTION_UNIT_OF_WORK, &filters)?)?;
        let mut candidates = Vec::with_capacity(found.len());
        for uow in found {
            let (qualifier, _) = parse_timeperiod(&uow.start_timeperiod)?;
            if uow.start_timeperiod >= cast_to_time_qualifier(qualifier, since)? {
                candidates.push(uow);
            }
        }
        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(candidates)
    }

    /// Units of work of a process whose start timeperiod lies in `[from, to)`
    pub fn query_range(&self, process_name: &str, from: &str, to: &str) -> Result<Vec<UnitOfWork>> {
        let filters = [
            Filter::eq("process_name", process_name),
            Filter::gte("start_timeperiod", from),
            Filter::lt("start_timeperiod", to),
        ];
        let mut found: Vec<UnitOfWork> = from_values(self.storage.query(COLLECTION_UNIT_OF_WORK, &filters)?)?;
        found.sort_by(|a, b| a.start_timeperiod.cmp(&b.start_timeperiod));
        Ok(found)
    }
}

/// Job persistence; one collection per time qualifier
#[derive(Clone)]
pub struct JobDao {
    storage: Arc<dyn Storage>,
}

impl JobDao {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn get_one(&self, qualifier: TimeQualifier, process_name: &str, timeperiod: &str) -> Result<Job> {
        let id = crate::id::job_id(process_name, timeperiod);
        fetch(self.storage.as_ref(), job_collection(qualifier)?, &id)
    }

    pub fn update(&self, qualifier: TimeQualifier, job: &Job) -> Result<()> {
        upsert(self.storage.as_ref(), job_collection(qualifier)?, job)
    }

    /// Jobs of a process with timeperiod at or after `from` (and before `to` when given)
    pub fn query_range(
        &self,
        qualifier: TimeQualifier,
        process_name: &str,
        from: &str,
        to: Option<&str>,
    ) -> Result<Vec<Job>> {
        let mut filters = vec![Filter::eq("process_name", process_name), Filter::gte("timeperiod", from)];
        if let Some(to) = to {
            filters.push(Filter::lt("timeperiod", to));
        }
        let mut found: Vec<Job> = from_values(self.storage.query(job_collection(qualifier)?, &filters)?)?;
        found.sort_by(|a, b| a.timeperiod.cmp(&b.timeperiod));
        Ok(found)
    }
}

/// Freerun schedulable persistence
#[derive(Clone)]
pub struct FreerunDao {
    storage: Arc<dyn Storage>,
}

impl FreerunDao {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn get_one(&self, schedulable_name: &str) -> Result<FreerunEntry> {
        fetch(self.storage.as_ref(), COLLECTION_FREERUN_PROCESS, schedulable_name)
    }

    pub fn update(&self, entry: &FreerunEntry) -> Result<()> {
        upsert(self.storage.as_ref(), COLLECTION_FREERUN_PROCESS, entry)
    }

    pub fn list(&self) -> Result<Vec<FreerunEntry>> {
        from_values(self.storage.query(COLLECTION_FREERUN_PROCESS, &[])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use chrono::{TimeZone, Utc};

    fn storage() -> Arc<dyn Storage> {
        Arc::new(MemoryStorage::new())
    }

    fn uow(process: &str, tp: &str, end_id: &str) -> UnitOfWork {
        let now = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        UnitOfWork::new(process, tp, tp, tp, "0", end_id, UowType::Managed, now)
    }

    #[test]
    fn test_uow_insert_duplicate_and_recover() {
        let dao = UowDao::new(storage());
        let first = uow("hourly", "2020010100", "0");
        dao.insert(&first).unwrap();

        let again = uow("hourly", "2020010100", "0");
        let err = dao.insert(&again).unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateKey { .. }));

        let recovered = dao.recover_from_duplicate(&again).unwrap();
        assert_eq!(recovered.id, first.id);
    }

    #[test]
    fn test_uow_get_missing_is_lookup_error() {
        let dao = UowDao::new(storage());
        let err = dao.get_one("uow-missing").unwrap_err();
        assert!(err.is_lookup());
    }

    #[test]
    fn test_reprocessing_candidates_filter_state_type_and_since() {
        let dao = UowDao::new(storage());

        let requested = uow("hourly", "2020010100", "0");
        let mut processed = uow("hourly", "2020010101", "0");
        processed.state = UowState::Processed;
        let mut invalid = uow("hourly", "2020010102", "0");
        invalid.state = UowState::Invalid;
        let old = uow("hourly", "2019123123", "0");
        let mut freerun = uow("alert::disk", "20200101000000", "0");
        freerun.unit_of_work_type = UowType::Freerun;

        for u in [&requested, &processed, &invalid, &old, &freerun] {
            dao.insert(u).unwrap();
        }

        let candidates = dao.get_reprocessing_candidates("2020").unwrap();
        let ids: Vec<&str> = candidates.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(candidates.len(), 2);
        assert!(ids.contains(&requested.id.as_str()));
        assert!(ids.contains(&invalid.id.as_str()));
    }

    #[test]
    fn test_reprocessing_candidates_include_coarse_work_at_the_boundary() {
        let dao = UowDao::new(storage());

        let daily = uow("daily", "20200101", "0");
        let monthly = uow("monthly", "202001", "0");
        let yearly = uow("yearly", "2020", "0");
        let earlier_day = uow("daily", "20191231", "0");
        for u in [&daily, &monthly, &yearly, &earlier_day] {
            dao.insert(u).unwrap();
        }

        let candidates = dao.get_reprocessing_candidates("2020010100").unwrap();
        let ids: Vec<&str> = candidates.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(candidates.len(), 3);
        assert!(ids.contains(&daily.id.as_str()));
        assert!(ids.contains(&monthly.id.as_str()));
        assert!(ids.contains(&yearly.id.as_str()));
    }

    #[test]
    fn test_uow_query_range() {
        let dao = UowDao::new(storage());
        for tp in ["2020010100", "2020010101", "2020010102"] {
            dao.insert(&uow("hourly", tp, "0")).unwrap();
        }
        let found = dao.query_range("hourly", "2020010101", "2020010103").unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].start_timeperiod, "2020010101");
    }

    #[test]
    fn test_job_roundtrip_and_range() {
        let dao = JobDao::new(storage());
        for tp in ["2020010100", "2020010101", "2020010102"] {
            dao.update(TimeQualifier::Hourly, &Job::new("hourly", tp)).unwrap();
        }

        let job = dao.get_one(TimeQualifier::Hourly, "hourly", "2020010101").unwrap();
        assert_eq!(job.timeperiod, "2020010101");

        let range = dao
            .query_range(TimeQualifier::Hourly, "hourly", "2020010101", None)
            .unwrap();
        assert_eq!(range.len(), 2);
    }

    #[test]
    fn test_job_in_real_time_collection_is_rejected() {
        let dao = JobDao::new(storage());
        assert!(dao.update(TimeQualifier::RealTime, &Job::new("x", "20200101000000")).is_err());
    }

    #[test]
    fn test_freerun_dao() {
        let dao = FreerunDao::new(storage());
        dao.update(&FreerunEntry::new("alert", "disk", "every 60")).unwrap();
        assert_eq!(dao.get_one("alert::disk").unwrap().entry_name, "disk");
        assert_eq!(dao.list().unwrap().len(), 1);
    }
}
