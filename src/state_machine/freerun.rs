//! Freerun state machine: schedulables that fire on their own cadence.
//!
//! A schedulable owns at most one unit of work. Pending work is republished,
//! finished or invalid work is replaced by a fresh unit of work on the next fire.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::Level;

use crate::config::ProcessRegistry;
use crate::domain::{FreerunEntry, MqTransmission, UnitOfWork, UowState, UowType};
use crate::error::{Result, SchedulerError};
use crate::storage::{FreerunDao, Storage, UowDao};
use crate::time::{TimeQualifier, actual_timeperiod_at};
use crate::transport::{Publisher, worker_queue};

pub struct FreerunStateMachine {
    registry: Arc<ProcessRegistry>,
    freerun_dao: FreerunDao,
    uow_dao: UowDao,
    publisher: Arc<dyn Publisher>,
}

impl FreerunStateMachine {
    pub fn new(registry: Arc<ProcessRegistry>, storage: Arc<dyn Storage>, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            registry,
            freerun_dao: FreerunDao::new(storage.clone()),
            uow_dao: UowDao::new(storage),
            publisher,
        }
    }

    /// Log, append to the entry's event log and persist the entry
    fn log_message(&self, entry: &mut FreerunEntry, level: Level, now: DateTime<Utc>, msg: String) -> Result<()> {
        log::log!(level, "{}", msg);
        entry.add_log_entry(format!("{} {}", now.format("%Y-%m-%d %H:%M:%S"), msg));
        self.freerun_dao.update(entry)
    }

    /// Persisted entry, created from the registry on first use
    pub fn load_entry(&self, schedulable_name: &str) -> Result<FreerunEntry> {
        match self.freerun_dao.get_one(schedulable_name) {
            Ok(entry) => Ok(entry),
            Err(e) if e.is_lookup() => {
                let context = self.registry.get_freerun(schedulable_name)?;
                let mut entry = FreerunEntry::new(
                    &context.process_name,
                    &context.entry_name,
                    &context.trigger_frequency.to_string(),
                );
                entry.description = context.description.clone();
                entry.arguments = context.arguments.clone();
                entry.is_on = context.is_on;
                self.freerun_dao.update(&entry)?;
                log::info!("Registered freerun schedulable {}", schedulable_name);
                Ok(entry)
            }
            Err(e) => Err(e),
        }
    }

    /// One fire of a schedulable
    pub fn manage_schedulable(&self, schedulable_name: &str, now: DateTime<Utc>) -> Result<()> {
        let mut entry = self.load_entry(schedulable_name)?;
        if !entry.is_on {
            log::info!("Freerun schedulable {} is off; skipping", schedulable_name);
            return Ok(());
        }

        let uow = match &entry.related_unit_of_work {
            Some(id) => match self.uow_dao.get_one(id) {
                Ok(uow) => Some(uow),
                Err(e) if e.is_lookup() => {
                    let msg = format!("Lookup issue for schedulable {}, because of: {}", schedulable_name, e);
                    return self.log_message(&mut entry, Level::Warn, now, msg);
                }
                Err(e) => return Err(e),
            },
            None => None,
        };

        match uow {
            None => self.insert_and_publish_uow(&mut entry, now),
            Some(uow) if matches!(uow.state, UowState::Requested | UowState::InProgress) => {
                self.publish_uow(&entry, &uow)?;
                let msg = format!("Republished: UOW {} for {}", uow.id, entry.id);
                self.log_message(&mut entry, Level::Info, now, msg)
            }
            Some(uow) => {
                let msg = format!("UOW for {} found in state {}", entry.id, uow.state.as_str());
                self.log_message(&mut entry, Level::Info, now, msg)?;
                self.insert_and_publish_uow(&mut entry, now)
            }
        }
    }

    /// Create a unit of work stamped with the real-time period of `now` and publish it.
    ///
    /// A colliding record is finished or invalid work from the same second, so it is
    /// recycled instead of reused as is.
    fn insert_and_publish_uow(&self, entry: &mut FreerunEntry, now: DateTime<Utc>) -> Result<()> {
        let timeperiod = actual_timeperiod_at(TimeQualifier::RealTime, now);
        let candidate = UnitOfWork::new(
            &entry.id,
            &timeperiod,
            &timeperiod,
            &timeperiod,
            "0",
            "0",
            UowType::Freerun,
            now,
        )
        .with_arguments(entry.arguments.clone());

        let uow = match self.uow_dao.insert(&candidate) {
            Ok(()) => {
                let msg = format!("Created: UOW {} for {}@{}", candidate.id, entry.id, timeperiod);
                self.log_message(entry, Level::Info, now, msg)?;
                candidate
            }
            Err(SchedulerError::DuplicateKey { .. }) => {
                let msg = format!("Duplication of UOW found for {}", entry.id);
                self.log_message(entry, Level::Warn, now, msg)?;
                let mut existing = self.uow_dao.recover_from_duplicate(&candidate)?;
                if !matches!(existing.state, UowState::Requested | UowState::InProgress) {
                    existing.recycle(now);
                    existing.arguments = entry.arguments.clone();
                    self.uow_dao.update(&existing)?;
                }
                existing
            }
            Err(e) => return Err(e),
        };

        self.publish_uow(entry, &uow)?;
        entry.related_unit_of_work = Some(uow.id.clone());
        let msg = format!("Published: UOW {} for {}", uow.id, entry.id);
        self.log_message(entry, Level::Info, now, msg)
    }

    fn publish_uow(&self, entry: &FreerunEntry, uow: &UnitOfWork) -> Result<()> {
        let message = MqTransmission::new(&entry.process_name, &uow.id).with_entry(&entry.entry_name);
        self.publisher.publish(&worker_queue(&entry.process_name), &message)
    }

    /// Cancel the schedulable's current unit of work
    pub fn cancel_uow(&self, schedulable_name: &str, now: DateTime<Utc>) -> Result<()> {
        let mut entry = self.load_entry(schedulable_name)?;
        let msg = match entry.related_unit_of_work.clone() {
            None => format!("cancel_uow: no related UOW for {}", schedulable_name),
            Some(id) => {
                let mut uow = self.uow_dao.get_one(&id)?;
                uow.state = UowState::Canceled;
                uow.finished_at = Some(now);
                self.uow_dao.update(&uow)?;
                format!("cancel_uow: canceled UOW {} for {}", id, schedulable_name)
            }
        };
        self.log_message(&mut entry, Level::Info, now, msg)
    }

    /// Record the outcome of a finished freerun unit of work
    pub fn notify(&self, uow: &UnitOfWork, now: DateTime<Utc>) -> Result<()> {
        let mut entry = self.freerun_dao.get_one(&uow.process_name)?;
        let msg = format!("UOW {} for {} finished as {}", uow.id, entry.id, uow.state.as_str());
        self.log_message(&mut entry, Level::Info, now, msg)
    }

    pub fn entries(&self) -> Result<Vec<FreerunEntry>> {
        self.freerun_dao.list()
    }
}
