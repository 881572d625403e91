//! ID generation utilities
//!
//! Record identities are natural keys: the same logical record always maps to the same id,
//! which is what lets storage detect duplicate creation.

use sha2::{Digest, Sha256};

/// Separator between process name and entry name in a freerun schedulable name
pub const SCHEDULABLE_SEPARATOR: &str = "::";

/// Derive the unit-of-work id from its boundaries
///
/// Format: `uow-{first 8 bytes of sha256 as hex}`
pub fn uow_id(process_name: &str, start_timeperiod: &str, end_timeperiod: &str, start_id: &str, end_id: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [process_name, start_timeperiod, end_timeperiod, start_id, end_id] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    format!("uow-{}", hex::encode(&digest[..8]))
}

/// Job id for a (process, timeperiod) pair
///
/// Format: `{process_name}@{timeperiod}`
pub fn job_id(process_name: &str, timeperiod: &str) -> String {
    format!("{}@{}", process_name, timeperiod)
}

/// Split a job id back into (process_name, timeperiod)
pub fn split_job_id(id: &str) -> Option<(&str, &str)> {
    id.rsplit_once('@')
}

/// Name of a freerun schedulable
///
/// Format: `{process_name}::{entry_name}`
pub fn schedulable_name(process_name: &str, entry_name: &str) -> String {
    format!("{}{}{}", process_name, SCHEDULABLE_SEPARATOR, entry_name)
}

/// Split a schedulable name back into (process_name, entry_name)
pub fn split_schedulable_name(name: &str) -> Option<(&str, &str)> {
    name.split_once(SCHEDULABLE_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uow_id_is_deterministic() {
        let a = uow_id("hourly", "2020010100", "2020010101", "0", "0");
        let b = uow_id("hourly", "2020010100", "2020010101", "0", "0");
        assert_eq!(a, b);
        assert!(a.starts_with("uow-"));
        assert_eq!(a.len(), 4 + 16);
        assert!(a[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_uow_id_distinguishes_boundaries() {
        let a = uow_id("hourly", "2020010100", "2020010101", "0", "0");
        let b = uow_id("hourly", "2020010100", "2020010101", "0", "1");
        let c = uow_id("hourly2", "2020010100", "2020010101", "0", "0");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_job_id_format() {
        assert_eq!(job_id("daily", "20200101"), "daily@20200101");
        assert_eq!(split_job_id("daily@20200101"), Some(("daily", "20200101")));
    }

    #[test]
    fn test_schedulable_name_roundtrip() {
        let name = schedulable_name("alert", "disk_usage");
        assert_eq!(name, "alert::disk_usage");
        assert_eq!(split_schedulable_name(&name), Some(("alert", "disk_usage")));
        assert_eq!(split_schedulable_name("plain"), None);
    }
}
