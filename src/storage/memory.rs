//! In-memory storage, used for embedding and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use serde_json::Value;

use super::traits::{Filter, Storage, record_id};
use crate::error::{Result, SchedulerError};

/// Volatile storage backed by ordered maps.
#[derive(Default)]
pub struct MemoryStorage {
    collections: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn insert(&self, collection: &str, record: &Value) -> Result<()> {
        let id = record_id(record)?.to_string();
        let mut collections = self.collections.write().map_err(SchedulerError::poisoned)?;
        let records = collections.entry(collection.to_string()).or_default();
        if records.contains_key(&id) {
            return Err(SchedulerError::DuplicateKey {
                collection: collection.to_string(),
                key: id,
            });
        }
        records.insert(id, record.clone());
        Ok(())
    }

    fn get_one(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let collections = self.collections.read().map_err(SchedulerError::poisoned)?;
        Ok(collections.get(collection).and_then(|records| records.get(id)).cloned())
    }

    fn update(&self, collection: &str, record: &Value) -> Result<()> {
        let id = record_id(record)?.to_string();
        let mut collections = self.collections.write().map_err(SchedulerError::poisoned)?;
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id, record.clone());
        Ok(())
    }

    fn query(&self, collection: &str, filters: &[Filter]) -> Result<Vec<Value>> {
        let collections = self.collections.read().map_err(SchedulerError::poisoned)?;
        Ok(collections
            .get(collection)
            .map(|records| {
                records
                    .values()
                    .filter(|record| filters.iter().all(|f| f.matches(record)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
