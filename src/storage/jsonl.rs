//! JSONL-based storage implementation with in-memory caching.
//!
//! Each collection is an append-only `<collection>.jsonl` file. Inserts and updates append
//! the full record; on load the last line for an id wins. `compact` rewrites a file with
//! one line per record.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde_json::Value;

use super::traits::{Filter, Storage, record_id};
use crate::error::{Result, SchedulerError};

type Collection = BTreeMap<String, Value>;

/// JSONL-based storage with in-memory caching.
pub struct JsonlStorage {
    base_path: PathBuf,
    cache: RwLock<HashMap<String, Collection>>,
}

impl JsonlStorage {
    /// Create a new JsonlStorage at the given path.
    pub fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Get the file path for a collection.
    fn collection_path(&self, collection: &str) -> PathBuf {
        self.base_path.join(format!("{}.jsonl", collection))
    }

    /// Load a collection into cache if not already loaded.
    fn ensure_loaded(&self, collection: &str) -> Result<()> {
        {
            let cache = self.cache.read().map_err(SchedulerError::poisoned)?;
            if cache.contains_key(collection) {
                return Ok(());
            }
        }

        let mut cache = self.cache.write().map_err(SchedulerError::poisoned)?;
        if cache.contains_key(collection) {
            return Ok(());
        }

        let path = self.collection_path(collection);
        let mut records = Collection::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: Value = serde_json::from_str(&line)?;
                let id = record_id(&record)?.to_string();
                records.insert(id, record);
            }
            log::debug!("Loaded {} records from {}", records.len(), path.display());
        }

        cache.insert(collection.to_string(), records);
        Ok(())
    }

    /// Append a record to the JSONL file.
    fn append_to_file(&self, collection: &str, record: &Value) -> Result<()> {
        let path = self.collection_path(collection);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        Ok(())
    }

    /// Rewrite a collection file with exactly one line per record.
    pub fn compact(&self, collection: &str) -> Result<usize> {
        self.ensure_loaded(collection)?;

        let cache = self.cache.read().map_err(SchedulerError::poisoned)?;
        let records = cache
            .get(collection)
            .ok_or_else(|| SchedulerError::Storage(format!("Collection not loaded: {}", collection)))?;

        let path = self.collection_path(collection);
        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut file = File::create(&tmp)?;
            for record in records.values() {
                writeln!(file, "{}", serde_json::to_string(record)?)?;
            }
        }
        fs::rename(&tmp, &path)?;
        Ok(records.len())
    }
}

impl Storage for JsonlStorage {
    fn insert(&self, collection: &str, record: &Value) -> Result<()> {
        self.ensure_loaded(collection)?;
        let id = record_id(record)?.to_string();

        let mut cache = self.cache.write().map_err(SchedulerError::poisoned)?;
        let records = cache
            .get_mut(collection)
            .ok_or_else(|| SchedulerError::Storage(format!("Collection not loaded: {}", collection)))?;

        if records.contains_key(&id) {
            return Err(SchedulerError::DuplicateKey {
                collection: collection.to_string(),
                key: id,
            });
        }

        // Append to file first (source of truth)
        self.append_to_file(collection, record)?;
        records.insert(id, record.clone());
        Ok(())
    }

    fn get_one(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        self.ensure_loaded(collection)?;

        let cache = self.cache.read().map_err(SchedulerError::poisoned)?;
        Ok(cache.get(collection).and_then(|records| records.get(id)).cloned())
    }

    fn update(&self, collection: &str, record: &Value) -> Result<()> {
        self.ensure_loaded(collection)?;
        let id = record_id(record)?.to_string();

        let mut cache = self.cache.write().map_err(SchedulerError::poisoned)?;
        let records = cache
            .get_mut(collection)
            .ok_or_else(|| SchedulerError::Storage(format!("Collection not loaded: {}", collection)))?;

        self.append_to_file(collection, record)?;
        records.insert(id, record.clone());
        Ok(())
    }

    fn query(&self, collection: &str, filters: &[Filter]) -> Result<Vec<Value>> {
        self.ensure_loaded(collection)?;

        let cache = self.cache.read().map_err(SchedulerError::poisoned)?;
        let records = cache
            .get(collection)
            .ok_or_else(|| SchedulerError::Storage(format!("Collection not loaded: {}", collection)))?;

        Ok(records
            .values()
            .filter(|record| filters.iter().all(|f| f.matches(record)))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_storage() -> (JsonlStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = JsonlStorage::new(temp_dir.path()).unwrap();
        (storage, temp_dir)
    }

    #[test]
    fn test_insert_and_get() {
        let (storage, _temp) = create_test_storage();
        let record = json!({"id": "1", "state": "requested"});

        storage.insert("unit_of_work", &record).unwrap();
        let retrieved = storage.get_one("unit_of_work", "1").unwrap();

        assert_eq!(retrieved, Some(record));
    }

    #[test]
    fn test_get_not_found() {
        let (storage, _temp) = create_test_storage();
        assert_eq!(storage.get_one("unit_of_work", "nonexistent").unwrap(), None);
    }

    #[test]
    fn test_insert_duplicate_is_rejected() {
        let (storage, _temp) = create_test_storage();
        storage.insert("unit_of_work", &json!({"id": "1", "state": "requested"})).unwrap();

        let err = storage
            .insert("unit_of_work", &json!({"id": "1", "state": "processed"}))
            .unwrap_err();

        assert!(matches!(err, SchedulerError::DuplicateKey { .. }));
        let kept = storage.get_one("unit_of_work", "1").unwrap().unwrap();
        assert_eq!(kept["state"], "requested");
    }

    #[test]
    fn test_update_upserts() {
        let (storage, _temp) = create_test_storage();
        storage.update("job_hourly", &json!({"id": "a", "state": "embryo"})).unwrap();
        storage.update("job_hourly", &json!({"id": "a", "state": "processed"})).unwrap();

        let all = storage.query("job_hourly", &[]).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["state"], "processed");
    }

    #[test]
    fn test_query_with_filters() {
        let (storage, _temp) = create_test_storage();
        for (id, tp) in [("1", "2020010100"), ("2", "2020010101"), ("3", "2020010102")] {
            storage
                .insert("job_hourly", &json!({"id": id, "process_name": "hourly", "timeperiod": tp}))
                .unwrap();
        }

        let found = storage
            .query(
                "job_hourly",
                &[Filter::eq("process_name", "hourly"), Filter::gte("timeperiod", "2020010101")],
            )
            .unwrap();

        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_last_write_wins_across_instances() {
        let temp_dir = TempDir::new().unwrap();

        {
            let storage = JsonlStorage::new(temp_dir.path()).unwrap();
            storage.insert("unit_of_work", &json!({"id": "1", "state": "requested"})).unwrap();
            storage.update("unit_of_work", &json!({"id": "1", "state": "processed"})).unwrap();
        }

        {
            let storage = JsonlStorage::new(temp_dir.path()).unwrap();
            let retrieved = storage.get_one("unit_of_work", "1").unwrap().unwrap();
            assert_eq!(retrieved["state"], "processed");
        }
    }

    #[test]
    fn test_compact_keeps_latest() {
        let (storage, temp) = create_test_storage();
        storage.insert("job_daily", &json!({"id": "1", "state": "embryo"})).unwrap();
        storage.update("job_daily", &json!({"id": "1", "state": "in_progress"})).unwrap();
        storage.update("job_daily", &json!({"id": "1", "state": "processed"})).unwrap();

        assert_eq!(storage.compact("job_daily").unwrap(), 1);

        let content = fs::read_to_string(temp.path().join("job_daily.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("processed"));
    }

    #[test]
    fn test_multiple_collections() {
        let (storage, _temp) = create_test_storage();
        storage.insert("collection_a", &json!({"id": "1", "name": "in_a"})).unwrap();
        storage.insert("collection_b", &json!({"id": "1", "name": "in_b"})).unwrap();

        assert_eq!(storage.get_one("collection_a", "1").unwrap().unwrap()["name"], "in_a");
        assert_eq!(storage.get_one("collection_b", "1").unwrap().unwrap()["name"], "in_b");
    }

    #[test]
    fn test_record_without_id_is_rejected() {
        let (storage, _temp) = create_test_storage();
        assert!(storage.insert("test", &json!({"name": "anonymous"})).is_err());
    }
}
