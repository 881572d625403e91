//! Storage trait definitions and filter types.

use crate::error::{Result, SchedulerError};
use serde::Serialize;
use serde_json::Value;

/// Filter operations for querying records.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    /// Field equals value
    Eq,
    /// Field does not equal value
    Ne,
    /// Field contains value (string/array)
    Contains,
    /// Field is greater than or equal to value (strings compare lexicographically)
    Gte,
    /// Field is strictly less than value
    Lt,
    /// Field equals one of the values in an array
    In,
}

/// A filter for querying records.
#[derive(Debug, Clone)]
pub struct Filter {
    /// Field name to filter on
    pub field: String,
    /// Filter operation
    pub op: FilterOp,
    /// Value to compare against
    pub value: Value,
}

impl Filter {
    fn new(field: impl Into<String>, op: FilterOp, value: impl Serialize) -> Self {
        Self {
            field: field.into(),
            op,
            value: serde_json::to_value(value).unwrap_or(Value::Null),
        }
    }

    /// Create an equality filter.
    pub fn eq(field: impl Into<String>, value: impl Serialize) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    /// Create a not-equal filter.
    pub fn ne(field: impl Into<String>, value: impl Serialize) -> Self {
        Self::new(field, FilterOp::Ne, value)
    }

    /// Create a contains filter.
    pub fn contains(field: impl Into<String>, value: impl Serialize) -> Self {
        Self::new(field, FilterOp::Contains, value)
    }

    /// Create a lower-bound (inclusive) filter.
    pub fn gte(field: impl Into<String>, value: impl Serialize) -> Self {
        Self::new(field, FilterOp::Gte, value)
    }

    /// Create an upper-bound (exclusive) filter.
    pub fn lt(field: impl Into<String>, value: impl Serialize) -> Self {
        Self::new(field, FilterOp::Lt, value)
    }

    /// Create a membership filter.
    pub fn one_of<T: Serialize>(field: impl Into<String>, values: &[T]) -> Self {
        Self::new(field, FilterOp::In, values)
    }

    /// Check if a record matches this filter.
    pub fn matches(&self, record: &Value) -> bool {
        let field_value = record.get(&self.field);

        match &self.op {
            FilterOp::Eq => match field_value {
                Some(v) => *v == self.value,
                None => self.value.is_null(),
            },
            FilterOp::Ne => match field_value {
                Some(v) => *v != self.value,
                None => !self.value.is_null(),
            },
            FilterOp::Contains => match field_value {
                Some(Value::String(s)) => match &self.value {
                    Value::String(needle) => s.contains(needle.as_str()),
                    _ => false,
                },
                Some(Value::Array(arr)) => arr.contains(&self.value),
                _ => false,
            },
            FilterOp::Gte | FilterOp::Lt => {
                let ordering = match (field_value, &self.value) {
                    (Some(Value::String(a)), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
                    (Some(Value::Number(a)), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
                        (Some(a), Some(b)) => a.partial_cmp(&b),
                        _ => None,
                    },
                    _ => None,
                };
                match (ordering, &self.op) {
                    (Some(o), FilterOp::Gte) => o != std::cmp::Ordering::Less,
                    (Some(o), FilterOp::Lt) => o == std::cmp::Ordering::Less,
                    _ => false,
                }
            }
            FilterOp::In => match (&self.value, field_value) {
                (Value::Array(options), Some(v)) => options.contains(v),
                _ => false,
            },
        }
    }
}

/// Trait for records that have an ID field.
pub trait HasId {
    /// Get the record's unique identifier.
    fn id(&self) -> &str;
}

/// Document store used by the scheduler core.
///
/// Records are JSON objects carrying a string `id` field. Implementations must
/// give read-after-write consistency on a single record.
pub trait Storage: Send + Sync {
    /// Insert a new record; fails with `DuplicateKey` if the id is taken.
    fn insert(&self, collection: &str, record: &Value) -> Result<()>;

    /// Get a record by ID.
    fn get_one(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// Insert or replace a record by ID.
    fn update(&self, collection: &str, record: &Value) -> Result<()>;

    /// Query records with filters (all filters must match).
    fn query(&self, collection: &str, filters: &[Filter]) -> Result<Vec<Value>>;
}

/// Extract the `id` field of a record.
pub fn record_id(record: &Value) -> Result<&str> {
    record
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| SchedulerError::Storage("record has no string id field".to_string()))
}
