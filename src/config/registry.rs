//! Validated, immutable view of the configured processes, trees and freerun entries.
//!
//! Invalid entries are logged and excluded instead of failing the whole configuration.

use std::collections::{BTreeMap, HashSet};

use serde_json::{Map, Value};

use super::process::{BlockingType, FreerunEntryConfig, ProcessEntry, TreeEntry};
use super::settings::TimeslicerConfig;
use crate::error::{Result, SchedulerError};
use crate::id::schedulable_name;
use crate::state_machine::StateMachineKind;
use crate::time::{TimeQualifier, TriggerFrequency, parse_timeperiod};
use crate::timetable::ProcessHierarchy;

/// A registered managed process.
#[derive(Debug, Clone)]
pub struct ProcessContext {
    pub process_name: String,
    pub time_qualifier: TimeQualifier,
    pub time_grouping: u32,
    pub state_machine: StateMachineKind,
    pub blocking_type: BlockingType,
    pub trigger_frequency: TriggerFrequency,
    pub source: Option<String>,
    pub sink: Option<String>,
    pub arguments: Map<String, Value>,
    pub is_on: bool,
    pub run_on_active_timeperiod: bool,
}

impl ProcessContext {
    fn from_entry(entry: &ProcessEntry) -> Result<Self> {
        if entry.process_name.is_empty() {
            return Err(SchedulerError::InvalidConfig("process without a name".to_string()));
        }
        let time_qualifier: TimeQualifier = entry.time_qualifier.parse()?;
        if time_qualifier == TimeQualifier::RealTime {
            return Err(SchedulerError::InvalidConfig(
                "real-time qualifier is reserved for freerun entries".to_string(),
            ));
        }

        let state_machine: StateMachineKind = entry.state_machine.parse()?;
        if !state_machine.is_managed() {
            return Err(SchedulerError::InvalidConfig(format!(
                "state machine {} cannot drive a managed process",
                state_machine
            )));
        }

        let max_grouping = match time_qualifier {
            TimeQualifier::Yearly => 1,
            TimeQualifier::Monthly => 12,
            TimeQualifier::Daily => 31,
            TimeQualifier::Hourly | TimeQualifier::RealTime => 24,
        };
        if time_qualifier == TimeQualifier::Yearly && entry.time_grouping > 1 {
            return Err(SchedulerError::InvalidConfig(
                "yearly processes must use time grouping 1".to_string(),
            ));
        }
        if entry.time_grouping == 0 || entry.time_grouping > max_grouping {
            return Err(SchedulerError::InvalidConfig(format!(
                "time grouping {} is out of range 1..={} for {}",
                entry.time_grouping, max_grouping, time_qualifier
            )));
        }

        let trigger_frequency: TriggerFrequency = entry.trigger_frequency.parse()?;

        Ok(Self {
            process_name: entry.process_name.clone(),
            time_qualifier,
            time_grouping: entry.time_grouping,
            state_machine,
            blocking_type: entry.blocking_type,
            trigger_frequency,
            source: entry.source.clone(),
            sink: entry.sink.clone(),
            arguments: entry.arguments.clone(),
            is_on: entry.is_on,
            run_on_active_timeperiod: entry
                .run_on_active_timeperiod
                .unwrap_or_else(|| state_machine.run_on_active_timeperiod()),
        })
    }
}

/// A registered tree.
#[derive(Debug, Clone)]
pub struct TreeContext {
    pub tree_name: String,
    pub hierarchy: ProcessHierarchy,
    pub dependent_on: Vec<String>,
    pub mx_name: String,
    pub mx_page: String,
}

/// A registered freerun schedulable.
#[derive(Debug, Clone)]
pub struct FreerunContext {
    pub schedulable_name: String,
    pub process_name: String,
    pub entry_name: String,
    pub description: String,
    pub trigger_frequency: TriggerFrequency,
    pub arguments: Map<String, Value>,
    pub is_on: bool,
}

impl FreerunContext {
    fn from_entry(entry: &FreerunEntryConfig) -> Result<Self> {
        if entry.process_name.is_empty() || entry.entry_name.is_empty() {
            return Err(SchedulerError::InvalidConfig(
                "freerun entry needs both a process and an entry name".to_string(),
            ));
        }
        Ok(Self {
            schedulable_name: schedulable_name(&entry.process_name, &entry.entry_name),
            process_name: entry.process_name.clone(),
            entry_name: entry.entry_name.clone(),
            description: entry.description.clone(),
            trigger_frequency: entry.trigger_frequency.parse()?,
            arguments: entry.arguments.clone(),
            is_on: entry.is_on,
        })
    }
}

/// An entry excluded during registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub name: String,
    pub reason: String,
}

/// Read-only registry shared by every component.
#[derive(Debug, Clone)]
pub struct ProcessRegistry {
    start_timeperiod: String,
    processes: BTreeMap<String, ProcessContext>,
    trees: Vec<TreeContext>,
    freerun: BTreeMap<String, FreerunContext>,
    rejected: Vec<Rejection>,
}

impl ProcessRegistry {
    /// Validate the configuration; fails only when the start boundary itself is unusable
    pub fn from_config(config: &TimeslicerConfig) -> Result<Self> {
        parse_timeperiod(&config.settings.start_timeperiod)?;

        let mut registry = Self {
            start_timeperiod: config.settings.start_timeperiod.clone(),
            processes: BTreeMap::new(),
            trees: Vec::new(),
            freerun: BTreeMap::new(),
            rejected: Vec::new(),
        };

        for entry in &config.processes {
            if registry.processes.contains_key(&entry.process_name) {
                registry.reject(&entry.process_name, "duplicate process name".to_string());
                continue;
            }
            match ProcessContext::from_entry(entry) {
                Ok(context) => {
                    registry.processes.insert(context.process_name.clone(), context);
                }
                Err(e) => registry.reject(&entry.process_name, e.to_string()),
            }
        }

        registry.register_trees(&config.trees);

        for entry in &config.freerun {
            match FreerunContext::from_entry(entry) {
                Ok(context) if registry.freerun.contains_key(&context.schedulable_name) => {
                    registry.reject(&context.schedulable_name, "duplicate freerun entry".to_string());
                }
                Ok(context) => {
                    registry.freerun.insert(context.schedulable_name.clone(), context);
                }
                Err(e) => registry.reject(&schedulable_name(&entry.process_name, &entry.entry_name), e.to_string()),
            }
        }

        log::info!(
            "Registered {} processes, {} trees, {} freerun entries ({} rejected)",
            registry.processes.len(),
            registry.trees.len(),
            registry.freerun.len(),
            registry.rejected.len()
        );
        Ok(registry)
    }

    fn register_trees(&mut self, entries: &[TreeEntry]) {
        let mut claimed: HashSet<String> = HashSet::new();
        let mut names: HashSet<String> = HashSet::new();
        let mut candidates: Vec<TreeContext> = Vec::new();

        for entry in entries {
            match self.tree_from_entry(entry, &claimed, &names) {
                Ok(tree) => {
                    claimed.extend(tree.hierarchy.iter().map(|e| e.process_name.clone()));
                    names.insert(tree.tree_name.clone());
                    candidates.push(tree);
                }
                Err(e) => self.reject(&entry.tree_name, e.to_string()),
            }
        }

        // A tree waiting on a rejected tree can never be satisfied; drop until stable
        loop {
            let accepted: HashSet<String> = candidates.iter().map(|t| t.tree_name.clone()).collect();
            let (valid, invalid): (Vec<TreeContext>, Vec<TreeContext>) = candidates
                .into_iter()
                .partition(|t| t.dependent_on.iter().all(|d| accepted.contains(d) && *d != t.tree_name));
            candidates = valid;
            if invalid.is_empty() {
                break;
            }
            for tree in invalid {
                self.reject(&tree.tree_name, format!("unknown dependency in {:?}", tree.dependent_on));
            }
        }

        self.trees = candidates;
    }

    fn tree_from_entry(&self, entry: &TreeEntry, claimed: &HashSet<String>, names: &HashSet<String>) -> Result<TreeContext> {
        if entry.tree_name.is_empty() {
            return Err(SchedulerError::InvalidConfig("tree without a name".to_string()));
        }
        if names.contains(&entry.tree_name) {
            return Err(SchedulerError::InvalidConfig("duplicate tree name".to_string()));
        }

        let mut levels = Vec::with_capacity(entry.process_hierarchy.len());
        for process_name in &entry.process_hierarchy {
            let context = self.processes.get(process_name).ok_or_else(|| {
                SchedulerError::InvalidConfig(format!("process {} is not registered", process_name))
            })?;
            if claimed.contains(process_name) {
                return Err(SchedulerError::InvalidConfig(format!(
                    "process {} already belongs to another tree",
                    process_name
                )));
            }
            levels.push((process_name.clone(), context.time_qualifier));
        }

        Ok(TreeContext {
            tree_name: entry.tree_name.clone(),
            hierarchy: ProcessHierarchy::new(levels)?,
            dependent_on: entry.dependent_on.clone(),
            mx_name: entry.mx_name.clone(),
            mx_page: entry.mx_page.clone(),
        })
    }

    fn reject(&mut self, name: &str, reason: String) {
        log::warn!("Rejected configuration entry {}: {}", name, reason);
        self.rejected.push(Rejection {
            name: name.to_string(),
            reason,
        });
    }

    pub fn start_timeperiod(&self) -> &str {
        &self.start_timeperiod
    }

    pub fn get(&self, process_name: &str) -> Result<&ProcessContext> {
        self.processes
            .get(process_name)
            .ok_or_else(|| SchedulerError::NotFound(format!("process {}", process_name)))
    }

    pub fn contains(&self, process_name: &str) -> bool {
        self.processes.contains_key(process_name)
    }

    pub fn processes(&self) -> impl Iterator<Item = &ProcessContext> {
        self.processes.values()
    }

    pub fn trees(&self) -> &[TreeContext] {
        &self.trees
    }

    pub fn freerun_entries(&self) -> impl Iterator<Item = &FreerunContext> {
        self.freerun.values()
    }

    pub fn get_freerun(&self, schedulable_name: &str) -> Result<&FreerunContext> {
        self.freerun
            .get(schedulable_name)
            .ok_or_else(|| SchedulerError::NotFound(format!("freerun entry {}", schedulable_name)))
    }

    pub fn rejected(&self) -> &[Rejection] {
        &self.rejected
    }

    /// Unknown processes answer false
    pub fn run_on_active_timeperiod(&self, process_name: &str) -> bool {
        self.processes
            .get(process_name)
            .is_some_and(|p| p.run_on_active_timeperiod)
    }
}
