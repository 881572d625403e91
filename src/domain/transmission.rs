//! Payload exchanged over the message transport

use serde::{Deserialize, Serialize};

/// Opaque reference to a record: the consumer looks the record up by id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqTransmission {
    pub process_name: String,
    /// Set for freerun schedulables
    pub entry_name: Option<String>,
    pub record_db_id: String,
}

impl MqTransmission {
    pub fn new(process_name: &str, record_db_id: &str) -> Self {
        Self {
            process_name: process_name.to_string(),
            entry_name: None,
            record_db_id: record_db_id.to_string(),
        }
    }

    pub fn with_entry(mut self, entry_name: &str) -> Self {
        self.entry_name = Some(entry_name.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_name_is_optional_on_the_wire() {
        let msg = MqTransmission::new("hourly", "uow-01");
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json["entry_name"].is_null());

        let msg = msg.with_entry("disk");
        assert_eq!(msg.entry_name.as_deref(), Some("disk"));
    }
}
