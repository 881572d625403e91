//! Storage layer for Timeslicer.
//!
//! The scheduler core needs four primitives from a document store: `insert` (raising
//! DuplicateKey), `get_one`, `update` and `query`. Typed DAOs on top map records to the
//! domain types.

mod dao;
mod jsonl;
mod memory;
mod traits;

use std::sync::Arc;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{Result, SchedulerError};
use crate::time::TimeQualifier;

pub use dao::{FreerunDao, JobDao, UowDao};
pub use jsonl::JsonlStorage;
pub use memory::MemoryStorage;
pub use traits::{Filter, FilterOp, HasId, Storage, record_id};

pub const COLLECTION_JOB_HOURLY: &str = "job_hourly";
pub const COLLECTION_JOB_DAILY: &str = "job_daily";
pub const COLLECTION_JOB_MONTHLY: &str = "job_monthly";
pub const COLLECTION_JOB_YEARLY: &str = "job_yearly";
pub const COLLECTION_UNIT_OF_WORK: &str = "unit_of_work";
pub const COLLECTION_FREERUN_PROCESS: &str = "freerun_process";

/// Job collection for a time qualifier
pub fn job_collection(qualifier: TimeQualifier) -> Result<&'static str> {
    match qualifier {
        TimeQualifier::Hourly => Ok(COLLECTION_JOB_HOURLY),
        TimeQualifier::Daily => Ok(COLLECTION_JOB_DAILY),
        TimeQualifier::Monthly => Ok(COLLECTION_JOB_MONTHLY),
        TimeQualifier::Yearly => Ok(COLLECTION_JOB_YEARLY),
        TimeQualifier::RealTime => Err(SchedulerError::InvalidRequest(
            "real-time processes have no job collection".to_string(),
        )),
    }
}

/// Open the configured storage backend
pub fn open(config: &StorageConfig) -> Result<Arc<dyn Storage>> {
    match config.backend {
        StorageBackend::Jsonl => {
            log::info!("Opening JSONL storage at {}", config.data_dir.display());
            Ok(Arc::new(JsonlStorage::new(&config.data_dir)?))
        }
        StorageBackend::Memory => {
            log::warn!("Using in-memory storage; state is lost on exit");
            Ok(Arc::new(MemoryStorage::new()))
        }
    }
}
