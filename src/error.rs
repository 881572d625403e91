//! Error types for Timeslicer
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur in the scheduler core
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Record, tree, node or process not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A record with the same identity already exists
    #[error("Duplicate key in {collection}: {key}")]
    DuplicateKey { collection: String, key: String },

    /// Rejected process, tree or scheduler configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid state value or transition
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Malformed timeperiod token
    #[error("Invalid timeperiod: {0}")]
    InvalidTimeperiod(String),

    /// Operator action that cannot be applied
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Storage/persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Message transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SchedulerError {
    /// Lookup failures are transient: the caller aborts the cycle and retries later
    pub fn is_lookup(&self) -> bool {
        matches!(self, SchedulerError::NotFound(_))
    }

    pub fn poisoned<T>(err: std::sync::PoisonError<T>) -> Self {
        SchedulerError::InvalidState(format!("lock poisoned: {}", err))
    }
}

/// Result type alias for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let err = SchedulerError::NotFound("job hourly@2020010100".to_string());
        assert_eq!(err.to_string(), "Not found: job hourly@2020010100");
        assert!(err.is_lookup());
    }

    #[test]
    fn test_duplicate_key_error() {
        let err = SchedulerError::DuplicateKey {
            collection: "unit_of_work".to_string(),
            key: "uow-1a2b".to_string(),
        };
        assert_eq!(err.to_string(), "Duplicate key in unit_of_work: uow-1a2b");
        assert!(!err.is_lookup());
    }

    #[test]
    fn test_invalid_config_error() {
        let err = SchedulerError::InvalidConfig("yearly grouping must be 1".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: yearly grouping must be 1");
    }

    #[test]
    fn test_invalid_timeperiod_error() {
        let err = SchedulerError::InvalidTimeperiod("20201".to_string());
        assert_eq!(err.to_string(), "Invalid timeperiod: 20201");
    }

    #[test]
    fn test_storage_error() {
        let err = SchedulerError::Storage("file locked".to_string());
        assert_eq!(err.to_string(), "Storage error: file locked");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SchedulerError = io_err.into();
        assert!(matches!(err, SchedulerError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let err: SchedulerError = json_err.into();
        assert!(matches!(err, SchedulerError::Json(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(SchedulerError::InvalidState("test".to_string()))
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }
}
