//! Ordered process hierarchy of a tree, coarsest level first.

use serde::Serialize;

use crate::error::{Result, SchedulerError};
use crate::time::TimeQualifier;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HierarchyEntry {
    pub process_name: String,
    pub time_qualifier: TimeQualifier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessHierarchy {
    entries: Vec<HierarchyEntry>,
}

impl ProcessHierarchy {
    /// Sort processes coarsest to finest; qualifiers must be unique and managed
    pub fn new(processes: Vec<(String, TimeQualifier)>) -> Result<Self> {
        if processes.is_empty() {
            return Err(SchedulerError::InvalidConfig("empty process hierarchy".to_string()));
        }

        let mut entries: Vec<HierarchyEntry> = processes
            .into_iter()
            .map(|(process_name, time_qualifier)| HierarchyEntry {
                process_name,
                time_qualifier,
            })
            .collect();
        entries.sort_by(|a, b| b.time_qualifier.cmp(&a.time_qualifier));

        for pair in entries.windows(2) {
            if pair[0].time_qualifier == pair[1].time_qualifier {
                return Err(SchedulerError::InvalidConfig(format!(
                    "processes {} and {} share the {} level",
                    pair[0].process_name, pair[1].process_name, pair[0].time_qualifier
                )));
            }
        }
        if let Some(entry) = entries.iter().find(|e| e.time_qualifier == TimeQualifier::RealTime) {
            return Err(SchedulerError::InvalidConfig(format!(
                "process {} is real-time and cannot join a tree",
                entry.process_name
            )));
        }

        Ok(Self { entries })
    }

    pub fn get(&self, process_name: &str) -> Option<&HierarchyEntry> {
        self.entries.iter().find(|e| e.process_name == process_name)
    }

    pub fn get_by_qualifier(&self, qualifier: TimeQualifier) -> Option<&HierarchyEntry> {
        self.entries.iter().find(|e| e.time_qualifier == qualifier)
    }

    pub fn contains(&self, process_name: &str) -> bool {
        self.get(process_name).is_some()
    }

    /// Next coarser level
    pub fn parent_of(&self, process_name: &str) -> Option<&HierarchyEntry> {
        let idx = self.index_of(process_name)?;
        idx.checked_sub(1).and_then(|i| self.entries.get(i))
    }

    /// Next finer level
    pub fn child_of(&self, process_name: &str) -> Option<&HierarchyEntry> {
        let idx = self.index_of(process_name)?;
        self.entries.get(idx + 1)
    }

    pub fn top(&self) -> &HierarchyEntry {
        &self.entries[0]
    }

    pub fn bottom(&self) -> &HierarchyEntry {
        &self.entries[self.entries.len() - 1]
    }

    pub fn iter(&self) -> impl Iterator<Item = &HierarchyEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn index_of(&self, process_name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.process_name == process_name)
    }
}
