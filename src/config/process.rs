//! Process, tree and freerun entries as written in the configuration file.
//!
//! Entries are kept loosely typed here so a single bad entry can be rejected
//! without failing the whole file; `ProcessRegistry` does the validation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::SchedulerError;

/// How a job waits on other jobs before it is handed to its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockingType {
    /// No blocking; the state machine decides alone.
    #[default]
    BlockingNormal,
    /// Wait until every child node is finished.
    BlockingChildren,
    /// Wait until every dependency tree counterpart is processed.
    BlockingDependencies,
}

impl BlockingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockingType::BlockingNormal => "blocking_normal",
            BlockingType::BlockingChildren => "blocking_children",
            BlockingType::BlockingDependencies => "blocking_dependencies",
        }
    }
}

impl fmt::Display for BlockingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockingType {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocking_normal" => Ok(BlockingType::BlockingNormal),
            "blocking_children" => Ok(BlockingType::BlockingChildren),
            "blocking_dependencies" => Ok(BlockingType::BlockingDependencies),
            other => Err(SchedulerError::InvalidConfig(format!("unknown blocking type: {}", other))),
        }
    }
}

/// A managed process.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProcessEntry {
    #[serde(rename = "process-name")]
    pub process_name: String,

    /// `hourly`, `daily`, `monthly` or `yearly`.
    #[serde(rename = "time-qualifier")]
    pub time_qualifier: String,

    /// Only every Nth period is dispatched.
    #[serde(rename = "time-grouping")]
    pub time_grouping: u32,

    /// `continuous`, `discrete` or `simplified_discrete`.
    #[serde(rename = "state-machine")]
    pub state_machine: String,

    #[serde(rename = "blocking-type")]
    pub blocking_type: BlockingType,

    /// `every N` or `at [D-]HH:MM, ...`.
    #[serde(rename = "trigger-frequency")]
    pub trigger_frequency: String,

    pub source: Option<String>,
    pub sink: Option<String>,
    pub arguments: Map<String, Value>,

    #[serde(rename = "is-on")]
    pub is_on: bool,

    /// Overrides the state machine's default.
    #[serde(rename = "run-on-active-timeperiod")]
    pub run_on_active_timeperiod: Option<bool>,
}

impl Default for ProcessEntry {
    fn default() -> Self {
        Self {
            process_name: String::new(),
            time_qualifier: "hourly".to_string(),
            time_grouping: 1,
            state_machine: "discrete".to_string(),
            blocking_type: BlockingType::BlockingNormal,
            trigger_frequency: "every 60".to_string(),
            source: None,
            sink: None,
            arguments: Map::new(),
            is_on: true,
            run_on_active_timeperiod: None,
        }
    }
}

impl ProcessEntry {
    pub fn new(process_name: &str, time_qualifier: &str, state_machine: &str) -> Self {
        Self {
            process_name: process_name.to_string(),
            time_qualifier: time_qualifier.to_string(),
            state_machine: state_machine.to_string(),
            ..Default::default()
        }
    }

    pub fn with_grouping(mut self, time_grouping: u32) -> Self {
        self.time_grouping = time_grouping;
        self
    }

    pub fn with_blocking(mut self, blocking_type: BlockingType) -> Self {
        self.blocking_type = blocking_type;
        self
    }

    pub fn with_run_on_active(mut self, run_on_active: bool) -> Self {
        self.run_on_active_timeperiod = Some(run_on_active);
        self
    }
}

/// A timetable tree over registered processes.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TreeEntry {
    #[serde(rename = "tree-name")]
    pub tree_name: String,

    /// Process names in any order; sorted coarsest to finest on registration.
    #[serde(rename = "process-hierarchy")]
    pub process_hierarchy: Vec<String>,

    /// Trees whose completions this tree waits for.
    #[serde(rename = "dependent-on")]
    pub dependent_on: Vec<String>,

    #[serde(rename = "mx-name")]
    pub mx_name: String,

    #[serde(rename = "mx-page")]
    pub mx_page: String,
}

impl TreeEntry {
    pub fn new(tree_name: &str, process_hierarchy: &[&str]) -> Self {
        Self {
            tree_name: tree_name.to_string(),
            process_hierarchy: process_hierarchy.iter().map(|p| p.to_string()).collect(),
            mx_name: tree_name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_dependent_on(mut self, trees: &[&str]) -> Self {
        self.dependent_on = trees.iter().map(|t| t.to_string()).collect();
        self
    }
}

/// A freerun schedulable.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FreerunEntryConfig {
    #[serde(rename = "process-name")]
    pub process_name: String,

    #[serde(rename = "entry-name")]
    pub entry_name: String,

    pub description: String,

    #[serde(rename = "trigger-frequency")]
    pub trigger_frequency: String,

    pub arguments: Map<String, Value>,

    #[serde(rename = "is-on")]
    pub is_on: bool,
}

impl Default for FreerunEntryConfig {
    fn default() -> Self {
        Self {
            process_name: String::new(),
            entry_name: String::new(),
            description: String::new(),
            trigger_frequency: "every 60".to_string(),
            arguments: Map::new(),
            is_on: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_type_parse() {
        assert_eq!(
            "blocking_children".parse::<BlockingType>().unwrap(),
            BlockingType::BlockingChildren
        );
        assert!("blocking_everything".parse::<BlockingType>().is_err());
    }

    #[test]
    fn test_process_entry_defaults() {
        let yaml = "process-name: daily_site\ntime-qualifier: daily\n";
        let entry: ProcessEntry = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(entry.time_grouping, 1);
        assert_eq!(entry.state_machine, "discrete");
        assert_eq!(entry.blocking_type, BlockingType::BlockingNormal);
        assert!(entry.is_on);
        assert!(entry.run_on_active_timeperiod.is_none());
    }

    #[test]
    fn test_blocking_type_yaml_name() {
        let yaml = "process-name: p\nblocking-type: blocking_dependencies\n";
        let entry: ProcessEntry = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(entry.blocking_type, BlockingType::BlockingDependencies);
    }

    #[test]
    fn test_tree_entry_builder() {
        let tree = TreeEntry::new("site", &["daily_site", "hourly_site"]).with_dependent_on(&["client"]);
        assert_eq!(tree.process_hierarchy.len(), 2);
        assert_eq!(tree.dependent_on, vec!["client"]);
        assert_eq!(tree.mx_name, "site");
    }
}
