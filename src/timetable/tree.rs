//! A timetable tree: one arena of nodes per hierarchy level.
//!
//! Parents are found by casting a timeperiod to the coarser level and looking the
//! key up; children are kept as a set of timeperiods on the parent node.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::hierarchy::ProcessHierarchy;
use super::node::TreeNode;
use crate::config::{ProcessRegistry, TreeContext};
use crate::domain::{Job, JobState, MAX_NUMBER_OF_FAILURES};
use crate::error::{Result, SchedulerError};
use crate::time::{TimeQualifier, actual_timeperiod_at, cast_to_time_qualifier, increment_timeperiod, is_grouping_aligned};

#[derive(Debug, Clone, Serialize)]
pub struct TimetableTree {
    pub tree_name: String,
    pub hierarchy: ProcessHierarchy,
    /// Trees this tree waits on
    pub dependent_on: Vec<String>,
    pub mx_name: String,
    pub mx_page: String,
    /// Last bottom-level timeperiod materialized by `build_tree`
    pub build_timeperiod: Option<String>,
    start_timeperiod: String,
    groupings: HashMap<String, u32>,
    levels: HashMap<String, BTreeMap<String, TreeNode>>,
}

impl TimetableTree {
    pub fn new(context: &TreeContext, registry: &ProcessRegistry) -> Result<Self> {
        let mut groupings = HashMap::new();
        let mut levels = HashMap::new();
        for entry in context.hierarchy.iter() {
            let process = registry.get(&entry.process_name)?;
            groupings.insert(entry.process_name.clone(), process.time_grouping);
            levels.insert(entry.process_name.clone(), BTreeMap::new());
        }

        Ok(Self {
            tree_name: context.tree_name.clone(),
            hierarchy: context.hierarchy.clone(),
            dependent_on: context.dependent_on.clone(),
            mx_name: context.mx_name.clone(),
            mx_page: context.mx_page.clone(),
            build_timeperiod: None,
            start_timeperiod: registry.start_timeperiod().to_string(),
            groupings,
            levels,
        })
    }

    pub fn contains_process(&self, process_name: &str) -> bool {
        self.hierarchy.contains(process_name)
    }

    pub fn qualifier_of(&self, process_name: &str) -> Result<TimeQualifier> {
        self.hierarchy
            .get(process_name)
            .map(|e| e.time_qualifier)
            .ok_or_else(|| SchedulerError::NotFound(format!("process {} in tree {}", process_name, self.tree_name)))
    }

    pub fn get_node(&self, process_name: &str, timeperiod: &str) -> Option<&TreeNode> {
        self.levels.get(process_name).and_then(|level| level.get(timeperiod))
    }

    pub fn get_node_mut(&mut self, process_name: &str, timeperiod: &str) -> Option<&mut TreeNode> {
        self.levels.get_mut(process_name).and_then(|level| level.get_mut(timeperiod))
    }

    /// Nodes of one level, oldest first
    pub fn nodes(&self, process_name: &str) -> impl Iterator<Item = &TreeNode> {
        self.levels.get(process_name).into_iter().flat_map(|level| level.values())
    }

    pub fn node_count(&self) -> usize {
        self.levels.values().map(BTreeMap::len).sum()
    }

    /// Key of the node one level up
    pub fn parent_key(&self, process_name: &str, timeperiod: &str) -> Result<Option<(String, String)>> {
        match self.hierarchy.parent_of(process_name) {
            Some(parent) => {
                let tp = cast_to_time_qualifier(parent.time_qualifier, timeperiod)?;
                Ok(Some((parent.process_name.clone(), tp)))
            }
            None => Ok(None),
        }
    }

    pub fn children_of(&self, node: &TreeNode) -> Vec<&TreeNode> {
        match self.hierarchy.child_of(&node.process_name) {
            Some(child) => node
                .children
                .iter()
                .filter_map(|tp| self.get_node(&child.process_name, tp))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Is a later node present under the same parent
    pub fn has_younger_sibling(&self, node: &TreeNode) -> Result<bool> {
        let next = increment_timeperiod(node.time_qualifier, &node.timeperiod, 1)?;
        if self.get_node(&node.process_name, &next).is_none() {
            return Ok(false);
        }
        Ok(self.parent_key(&node.process_name, &next)? == self.parent_key(&node.process_name, &node.timeperiod)?)
    }

    /// Noop nodes are grouped out and never dispatched
    pub fn is_aligned(&self, process_name: &str, timeperiod: &str) -> Result<bool> {
        let qualifier = self.qualifier_of(process_name)?;
        let grouping = self.groupings.get(process_name).copied().unwrap_or(1);
        let start = cast_to_time_qualifier(qualifier, &self.start_timeperiod)?;
        is_grouping_aligned(qualifier, grouping, &start, timeperiod)
    }

    /// Materialize the node and its ancestors; new jobs are appended to `created`
    fn ensure_node(&mut self, process_name: &str, timeperiod: &str, created: &mut Vec<Job>) -> Result<()> {
        if self.get_node(process_name, timeperiod).is_some() {
            return Ok(());
        }

        if let Some((parent_process, parent_tp)) = self.parent_key(process_name, timeperiod)? {
            self.ensure_node(&parent_process, &parent_tp, created)?;
            if let Some(parent) = self.get_node_mut(&parent_process, &parent_tp) {
                parent.children.insert(timeperiod.to_string());
            }
        }

        let qualifier = self.qualifier_of(process_name)?;
        let job = if self.is_aligned(process_name, timeperiod)? {
            Job::new(process_name, timeperiod)
        } else {
            Job::new_noop(process_name, timeperiod)
        };
        created.push(job.clone());
        self.levels
            .entry(process_name.to_string())
            .or_default()
            .insert(timeperiod.to_string(), TreeNode::new(job, qualifier));
        Ok(())
    }

    /// Grow the tree from its frontier up to the period containing `now`.
    ///
    /// Returns the jobs created along the way; existing nodes are never touched.
    pub fn build_tree(&mut self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let bottom = self.hierarchy.bottom().clone();
        let mut timeperiod = match &self.build_timeperiod {
            Some(tp) => tp.clone(),
            None => cast_to_time_qualifier(bottom.time_qualifier, &self.start_timeperiod)?,
        };
        let actual = actual_timeperiod_at(bottom.time_qualifier, now);

        let mut created = Vec::new();
        while timeperiod <= actual {
            self.ensure_node(&bottom.process_name, &timeperiod, &mut created)?;
            timeperiod = increment_timeperiod(bottom.time_qualifier, &timeperiod, 1)?;
        }

        if self.build_timeperiod.as_deref().is_none_or(|tp| tp < actual.as_str()) {
            self.build_timeperiod = Some(actual);
        }
        if !created.is_empty() {
            log::debug!("Tree {} grew by {} nodes", self.tree_name, created.len());
        }
        Ok(created)
    }

    /// Replace the job of a node, materializing the node if needed
    pub fn update_node(&mut self, job: Job) -> Result<Vec<Job>> {
        if !self.contains_process(&job.process_name) {
            return Err(SchedulerError::InvalidRequest(format!(
                "tree {} does not manage process {}",
                self.tree_name, job.process_name
            )));
        }
        let mut created = Vec::new();
        self.ensure_node(&job.process_name, &job.timeperiod, &mut created)?;
        created.retain(|j| j.id != job.id);
        if let Some(node) = self.get_node_mut(&job.process_name, &job.timeperiod) {
            node.job = job;
        }
        Ok(created)
    }

    /// Finished nodes, leaves that failed too often and nodes whose children all failed
    pub fn should_skip_tree_node(&self, node: &TreeNode) -> bool {
        if node.job.is_finished() {
            return true;
        }

        let is_bottom = self.hierarchy.bottom().process_name == node.process_name;
        if is_bottom && node.is_leaf() {
            return node.job.number_of_failures > MAX_NUMBER_OF_FAILURES;
        }

        let children = self.children_of(node);
        !children.is_empty()
            && children.iter().all(|child| {
                child.job.number_of_failures > MAX_NUMBER_OF_FAILURES || child.job.state == JobState::Skipped
            })
    }

    /// Earliest node of a level that still needs work, or the newest node when all are done
    pub fn get_next_node(&self, process_name: &str) -> Result<&TreeNode> {
        self.qualifier_of(process_name)?;

        for node in self.nodes(process_name) {
            if self.should_skip_tree_node(node) || !node.job.is_active() {
                continue;
            }
            if self.ancestors_runnable(node)? {
                return Ok(node);
            }
        }

        self.nodes(process_name)
            .last()
            .ok_or_else(|| SchedulerError::NotFound(format!("no nodes for {} in tree {}", process_name, self.tree_name)))
    }

    fn ancestors_runnable(&self, node: &TreeNode) -> Result<bool> {
        let mut key = self.parent_key(&node.process_name, &node.timeperiod)?;
        while let Some((process, tp)) = key {
            match self.get_node(&process, &tp) {
                Some(parent) if !self.should_skip_tree_node(parent) => {}
                _ => return Ok(false),
            }
            key = self.parent_key(&process, &tp)?;
        }
        Ok(true)
    }

    /// Node in this tree at the same level and timeperiod as a node of another tree
    pub fn find_counterpart(&self, time_qualifier: TimeQualifier, timeperiod: &str) -> Result<Option<&TreeNode>> {
        match self.hierarchy.get_by_qualifier(time_qualifier) {
            Some(entry) => {
                let tp = cast_to_time_qualifier(time_qualifier, timeperiod)?;
                Ok(self.get_node(&entry.process_name, &tp))
            }
            None => Ok(None),
        }
    }
}
