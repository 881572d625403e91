//! Freerun schedulable record
//!
//! A freerun schedulable is not tied to the time hierarchy: it fires on its own cadence and
//! owns at most one unit of work at a time.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::job::push_event;
use crate::id::schedulable_name;
use crate::storage::HasId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreerunEntry {
    /// Schedulable name: `process::entry`
    pub id: String,
    pub process_name: String,
    pub entry_name: String,
    #[serde(default)]
    pub description: String,
    /// `every NNN` or `at D-HH:MM, ...`
    pub trigger_frequency: String,
    pub is_on: bool,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    pub related_unit_of_work: Option<String>,
    /// Newest entry first
    #[serde(default)]
    pub event_log: VecDeque<String>,
}

impl FreerunEntry {
    pub fn new(process_name: &str, entry_name: &str, trigger_frequency: &str) -> Self {
        Self {
            id: schedulable_name(process_name, entry_name),
            process_name: process_name.to_string(),
            entry_name: entry_name.to_string(),
            description: String::new(),
            trigger_frequency: trigger_frequency.to_string(),
            is_on: true,
            arguments: Map::new(),
            related_unit_of_work: None,
            event_log: VecDeque::new(),
        }
    }

    pub fn schedulable_name(&self) -> &str {
        &self.id
    }

    pub fn add_log_entry(&mut self, entry: impl Into<String>) {
        push_event(&mut self.event_log, entry.into());
    }
}

impl HasId for FreerunEntry {
    fn id(&self) -> &str {
        &self.id
    }
}
