//! Timetable: every registered tree behind one lock.
//!
//! All mutating entry points take the timetable lock for their whole duration and
//! mirror every job change to storage before returning. Read accessors hand out
//! cloned snapshots, so callers never observe a partially updated tree.

mod hierarchy;
mod node;
mod tree;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::config::ProcessRegistry;
use crate::domain::{Job, JobState, UowState, push_event};
use crate::error::{Result, SchedulerError};
use crate::storage::{JobDao, Storage, UowDao};
use crate::time::{TimeQualifier, cast_to_time_qualifier};

pub use hierarchy::{HierarchyEntry, ProcessHierarchy};
pub use node::{DependentOnSummary, TreeNode};
pub use tree::TimetableTree;

struct TimetableState {
    trees: BTreeMap<String, TimetableTree>,
    process_to_tree: HashMap<String, String>,
    /// Nodes queued for reprocessing: process name -> timeperiods
    reprocess: HashMap<String, BTreeSet<String>>,
}

impl TimetableState {
    fn tree_name_for(&self, process_name: &str) -> Result<&str> {
        self.process_to_tree
            .get(process_name)
            .map(String::as_str)
            .ok_or_else(|| SchedulerError::NotFound(format!("no tree manages process {}", process_name)))
    }

    fn tree_for(&self, process_name: &str) -> Result<&TimetableTree> {
        let name = self.tree_name_for(process_name)?;
        self.trees
            .get(name)
            .ok_or_else(|| SchedulerError::NotFound(format!("tree {}", name)))
    }

    fn tree_for_mut(&mut self, process_name: &str) -> Result<&mut TimetableTree> {
        let name = self.tree_name_for(process_name)?.to_string();
        self.trees
            .get_mut(&name)
            .ok_or_else(|| SchedulerError::NotFound(format!("tree {}", name)))
    }

    fn node(&self, process_name: &str, timeperiod: &str) -> Result<&TreeNode> {
        self.tree_for(process_name)?
            .get_node(process_name, timeperiod)
            .ok_or_else(|| SchedulerError::NotFound(format!("node {}@{}", process_name, timeperiod)))
    }

    fn node_mut(&mut self, process_name: &str, timeperiod: &str) -> Result<&mut TreeNode> {
        self.tree_for_mut(process_name)?
            .get_node_mut(process_name, timeperiod)
            .ok_or_else(|| SchedulerError::NotFound(format!("node {}@{}", process_name, timeperiod)))
    }

    fn is_queued_for_reprocess(&self, process_name: &str, timeperiod: &str) -> bool {
        self.reprocess
            .get(process_name)
            .is_some_and(|tps| tps.contains(timeperiod))
    }

    fn dequeue_reprocess(&mut self, process_name: &str, timeperiod: &str) {
        if let Some(tps) = self.reprocess.get_mut(process_name) {
            tps.remove(timeperiod);
        }
    }

    /// Trees listing `tree_name` in their `dependent_on`
    fn dependant_trees(&self, tree_name: &str) -> Vec<String> {
        self.trees
            .values()
            .filter(|t| t.dependent_on.iter().any(|d| d == tree_name))
            .map(|t| t.tree_name.clone())
            .collect()
    }

    /// (process, timeperiod) of every counterpart in trees depending on the node's tree
    fn dependant_node_keys(&self, process_name: &str, timeperiod: &str) -> Result<Vec<(String, String)>> {
        let tree = self.tree_for(process_name)?;
        let qualifier = tree.qualifier_of(process_name)?;
        let mut keys = Vec::new();
        for name in self.dependant_trees(&tree.tree_name) {
            if let Some(tree_b) = self.trees.get(&name)
                && let Some(node_b) = tree_b.find_counterpart(qualifier, timeperiod)?
            {
                keys.push((node_b.process_name.clone(), node_b.timeperiod.clone()));
            }
        }
        Ok(keys)
    }

    fn dependent_on_summary(&self, process_name: &str, timeperiod: &str) -> Result<DependentOnSummary> {
        let tree = self.tree_for(process_name)?;
        let qualifier = tree.qualifier_of(process_name)?;
        let mut summary = DependentOnSummary::default();
        for name in &tree.dependent_on {
            let tree_b = self
                .trees
                .get(name)
                .ok_or_else(|| SchedulerError::NotFound(format!("tree {}", name)))?;
            // No level or node to compare against: not blocked
            if let Some(node_b) = tree_b.find_counterpart(qualifier, timeperiod)? {
                summary.enlist(node_b);
            }
        }
        Ok(summary)
    }
}

pub struct Timetable {
    state: Mutex<TimetableState>,
    registry: Arc<ProcessRegistry>,
    uow_dao: UowDao,
    job_dao: JobDao,
}

impl Timetable {
    /// Construct every registered tree; call `load_trees` and `build_trees` to populate them
    pub fn new(registry: Arc<ProcessRegistry>, storage: Arc<dyn Storage>) -> Result<Self> {
        let mut trees = BTreeMap::new();
        let mut process_to_tree = HashMap::new();
        for context in registry.trees() {
            let tree = TimetableTree::new(context, &registry)?;
            for entry in tree.hierarchy.iter() {
                process_to_tree.insert(entry.process_name.clone(), tree.tree_name.clone());
            }
            trees.insert(tree.tree_name.clone(), tree);
        }
        log::info!("Timetable constructed with {} trees", trees.len());

        Ok(Self {
            state: Mutex::new(TimetableState {
                trees,
                process_to_tree,
                reprocess: HashMap::new(),
            }),
            registry,
            uow_dao: UowDao::new(storage.clone()),
            job_dao: JobDao::new(storage),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, TimetableState>> {
        self.state.lock().map_err(SchedulerError::poisoned)
    }

    fn persist(&self, state: &TimetableState, job: &Job) -> Result<()> {
        let qualifier = state.tree_for(&job.process_name)?.qualifier_of(&job.process_name)?;
        self.job_dao.update(qualifier, job)
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    //=== Tree lifecycle ===

    /// Restore persisted jobs at or after the start boundary
    pub fn load_trees(&self) -> Result<usize> {
        let mut state = self.lock()?;
        let start = self.registry.start_timeperiod().to_string();
        let mut loaded = 0;
        let mut created = Vec::new();

        // Coarsest first so restored parents are in place before their children
        for qualifier in TimeQualifier::MANAGED {
            let since = cast_to_time_qualifier(qualifier, &start)?;
            let processes: Vec<String> = state
                .trees
                .values()
                .filter_map(|t| t.hierarchy.get_by_qualifier(qualifier))
                .map(|e| e.process_name.clone())
                .collect();

            for process_name in processes {
                for job in self.job_dao.query_range(qualifier, &process_name, &since, None)? {
                    created.retain(|c: &Job| c.id != job.id);
                    created.extend(state.tree_for_mut(&process_name)?.update_node(job)?);
                    loaded += 1;
                }
            }
        }

        for job in &created {
            self.persist(&state, job)?;
        }
        log::info!("Loaded {} job records into the timetable", loaded);
        Ok(loaded)
    }

    /// Grow every tree up to `now`; returns the number of nodes created
    pub fn build_trees(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut state = self.lock()?;
        let mut created = Vec::new();
        for tree in state.trees.values_mut() {
            created.extend(tree.build_tree(now)?);
        }
        for job in &created {
            self.persist(&state, job)?;
        }
        if !created.is_empty() {
            log::info!("Materialized {} new job records", created.len());
        }
        Ok(created.len())
    }

    /// Reprocess finished nodes with unfinished children, skip nodes whose children all skipped
    pub fn validate(&self) -> Result<()> {
        let mut state = self.lock()?;
        let tree_names: Vec<String> = state.trees.keys().cloned().collect();

        for tree_name in tree_names {
            let levels: Vec<String> = match state.trees.get(&tree_name) {
                Some(tree) => tree.hierarchy.iter().map(|e| e.process_name.clone()).collect(),
                None => continue,
            };

            // Finest level first, so a parent sees the outcome of its children
            for process_name in levels.iter().rev() {
                let timeperiods: Vec<String> = match state.trees.get(&tree_name) {
                    Some(tree) => tree.nodes(process_name).map(|n| n.timeperiod.clone()).collect(),
                    None => continue,
                };

                for timeperiod in timeperiods {
                    let (reprocess, skip) = {
                        let tree = state.tree_for(process_name)?;
                        let node = state.node(process_name, &timeperiod)?;
                        let children = tree.children_of(node);
                        let all_finished = children.iter().all(|c| c.job.is_finished());
                        let all_skipped = children.iter().all(|c| c.job.state == JobState::Skipped);

                        let reprocess = !all_finished && node.job.is_finished() && node.job.state != JobState::Noop;
                        let skip = !reprocess
                            && !children.is_empty()
                            && all_skipped
                            && tree.build_timeperiod.is_some()
                            && node.job.state != JobState::Skipped
                            && tree.has_younger_sibling(node)?;
                        (reprocess, skip)
                    };

                    if reprocess {
                        let mut visited = HashSet::new();
                        self.reprocess_locked(&mut state, process_name, &timeperiod, &mut visited)?;
                    } else if skip {
                        self.skip_locked(&mut state, process_name, &timeperiod)?;
                    }
                }
            }
        }
        Ok(())
    }

    //=== Operator actions ===

    /// Send a node back for processing, cascading to its parent and to dependant trees
    pub fn reprocess_tree_node(&self, process_name: &str, timeperiod: &str) -> Result<()> {
        let mut state = self.lock()?;
        state.node(process_name, timeperiod)?;
        let mut visited = HashSet::new();
        self.reprocess_locked(&mut state, process_name, timeperiod, &mut visited)
    }

    fn reprocess_locked(
        &self,
        state: &mut TimetableState,
        process_name: &str,
        timeperiod: &str,
        visited: &mut HashSet<(String, String)>,
    ) -> Result<()> {
        if !visited.insert((process_name.to_string(), timeperiod.to_string())) {
            return Ok(());
        }

        let node = state.node(process_name, timeperiod)?;
        let untouched = node.job.state == JobState::Embryo && node.job.number_of_failures == 0;
        if !untouched && !state.is_queued_for_reprocess(process_name, timeperiod) {
            self.reprocess_single(state, process_name, timeperiod)?;
        }

        let mut cascade = state.dependant_node_keys(process_name, timeperiod)?;
        if let Some(parent) = state.tree_for(process_name)?.parent_key(process_name, timeperiod)? {
            cascade.push(parent);
        }
        for (p, tp) in cascade {
            if state.node(&p, &tp).is_ok() {
                self.reprocess_locked(state, &p, &tp, visited)?;
            }
        }
        Ok(())
    }

    fn reprocess_single(&self, state: &mut TimetableState, process_name: &str, timeperiod: &str) -> Result<()> {
        let now = Utc::now();
        let related = state.node(process_name, timeperiod)?.job.related_unit_of_work.clone();

        let msg = match related {
            Some(uow_id) => {
                let mut uow = self.uow_dao.get_one(&uow_id)?;
                uow.state = UowState::Invalid;
                uow.number_of_retries = 0;
                uow.created_at = now;
                self.uow_dao.update(&uow)?;

                state.node_mut(process_name, timeperiod)?.job.state = JobState::InProgress;
                state
                    .reprocess
                    .entry(process_name.to_string())
                    .or_default()
                    .insert(timeperiod.to_string());
                format!(
                    "Transferred job {}@{} to in_progress; unit of work {} to invalid",
                    process_name, timeperiod, uow_id
                )
            }
            None => {
                state.node_mut(process_name, timeperiod)?.job.state = JobState::Embryo;
                format!("Transferred job {}@{} to embryo", process_name, timeperiod)
            }
        };

        let node = state.node_mut(process_name, timeperiod)?;
        node.job.number_of_failures = 0;
        node.job.revision += 1;
        node.job.add_log_entry(format!("{} {}", now.format("%Y-%m-%d %H:%M:%S"), msg));
        let job = node.job.clone();
        self.persist(state, &job)?;
        log::warn!("{}", msg);
        Ok(())
    }

    /// Mark a node skipped, canceling its work, and cascade to its children
    pub fn skip_tree_node(&self, process_name: &str, timeperiod: &str) -> Result<()> {
        let mut state = self.lock()?;
        state.node(process_name, timeperiod)?;
        self.skip_locked(&mut state, process_name, timeperiod)
    }

    fn skip_locked(&self, state: &mut TimetableState, process_name: &str, timeperiod: &str) -> Result<()> {
        let now = Utc::now();
        let (related, children) = {
            let tree = state.tree_for(process_name)?;
            let node = state.node(process_name, timeperiod)?;
            let children: Vec<(String, String)> = tree
                .children_of(node)
                .into_iter()
                .map(|c| (c.process_name.clone(), c.timeperiod.clone()))
                .collect();
            (node.job.related_unit_of_work.clone(), children)
        };

        let mut msg = format!("Transferred job {}@{} to skipped", process_name, timeperiod);
        if let Some(uow_id) = related {
            let mut uow = self.uow_dao.get_one(&uow_id)?;
            if uow.is_active() {
                uow.state = UowState::Canceled;
                uow.finished_at = Some(now);
                self.uow_dao.update(&uow)?;
                msg.push_str(&format!("; unit of work {} to canceled", uow_id));
            }
        }

        let node = state.node_mut(process_name, timeperiod)?;
        node.job.state = JobState::Skipped;
        node.job.revision += 1;
        node.job.add_log_entry(format!("{} {}", now.format("%Y-%m-%d %H:%M:%S"), msg));
        let job = node.job.clone();
        self.persist(state, &job)?;
        state.dequeue_reprocess(process_name, timeperiod);
        log::warn!("{}", msg);

        for (p, tp) in children {
            if state.node(&p, &tp)?.job.state != JobState::Skipped {
                self.skip_locked(state, &p, &tp)?;
            }
        }
        Ok(())
    }

    //=== Job manipulation ===

    /// Store a new version of a job in both the tree and storage
    pub fn update_job_record(&self, job: &Job) -> Result<()> {
        let mut state = self.lock()?;
        self.update_locked(&mut state, job).map(|_| ())
    }

    /// Store `job` as the next revision of its node; returns that revision
    fn update_locked(&self, state: &mut TimetableState, job: &Job) -> Result<u64> {
        let mut job = job.clone();
        job.revision = state
            .node(&job.process_name, &job.timeperiod)
            .map(|n| n.job.revision + 1)
            .unwrap_or(0);
        let created = state.tree_for_mut(&job.process_name)?.update_node(job.clone())?;
        for extra in &created {
            self.persist(state, extra)?;
        }
        self.persist(state, &job)?;
        if job.is_finished() {
            state.dequeue_reprocess(&job.process_name, &job.timeperiod);
        }
        log::info!("Updated job {} as {}", job.id, job.state.as_str());
        Ok(job.revision)
    }

    /// Store a transition computed from an earlier snapshot of the job.
    ///
    /// `job.revision` must be the revision of that snapshot. Returns false, leaving the
    /// node untouched, when the node was changed since; otherwise `job.revision` is
    /// advanced to the stored one. Failures and event log entries recorded on the node
    /// since the snapshot are kept.
    pub fn transition_job_record(&self, job: &mut Job) -> Result<bool> {
        let mut state = self.lock()?;
        let current = &state.node(&job.process_name, &job.timeperiod)?.job;
        if current.revision != job.revision {
            log::warn!(
                "Job {} changed to {} while being handled; dropping the move to {}",
                job.id,
                current.state.as_str(),
                job.state.as_str()
            );
            return Ok(false);
        }

        let mut merged = job.clone();
        merged.number_of_failures = current.number_of_failures;
        merged.event_log = current.event_log.clone();
        for entry in job.event_log.iter().rev().filter(|e| !current.event_log.contains(*e)) {
            push_event(&mut merged.event_log, entry.clone());
        }
        job.revision = self.update_locked(&mut state, &merged)?;
        Ok(true)
    }

    /// Count a failed cycle; leaves over the failure limit are skipped
    pub fn failed_on_processing_job_record(&self, process_name: &str, timeperiod: &str) -> Result<()> {
        let mut state = self.lock()?;
        let node = state.node_mut(process_name, timeperiod)?;
        node.job.number_of_failures += 1;
        let failures = node.job.number_of_failures;
        let job = node.job.clone();

        let should_skip = {
            let tree = state.tree_for(process_name)?;
            tree.should_skip_tree_node(state.node(process_name, timeperiod)?)
        };
        if should_skip && !job.is_finished() {
            log::warn!("Job {} failed {} times, skipping", job.id, failures);
            self.skip_locked(&mut state, process_name, timeperiod)
        } else {
            self.persist(&state, &job)
        }
    }

    /// Next job to work on: queued reprocessing first, then the earliest open node
    pub fn get_next_job_record(&self, process_name: &str) -> Result<Job> {
        let mut state = self.lock()?;
        let queued = state
            .reprocess
            .get(process_name)
            .and_then(|tps| tps.iter().next().cloned());

        if let Some(timeperiod) = queued {
            state.dequeue_reprocess(process_name, &timeperiod);
            return Ok(state.node(process_name, &timeperiod)?.job.clone());
        }

        Ok(state.tree_for(process_name)?.get_next_node(process_name)?.job.clone())
    }

    /// Dependencies finished, children finished and the job itself still active
    pub fn is_job_record_finalizable(&self, job: &Job) -> Result<bool> {
        let state = self.lock()?;
        let summary = state.dependent_on_summary(&job.process_name, &job.timeperiod)?;
        if !summary.all_finished() {
            log::info!("{} is blocked by unfinished: {}", job.id, summary.unfinished.join(","));
            return Ok(false);
        }
        let tree = state.tree_for(&job.process_name)?;
        let node = state.node(&job.process_name, &job.timeperiod)?;
        let children_finished = tree.children_of(node).iter().all(|c| c.job.is_finished());
        Ok(children_finished && node.job.is_active())
    }

    pub fn dependent_on_composite_state(&self, job: &Job) -> Result<DependentOnSummary> {
        self.lock()?.dependent_on_summary(&job.process_name, &job.timeperiod)
    }

    /// Append to the node's event log; persisted with the next job update
    pub fn add_log_entry(&self, process_name: &str, timeperiod: &str, msg: &str) -> Result<()> {
        let mut state = self.lock()?;
        let node = state.node_mut(process_name, timeperiod)?;
        node.job
            .add_log_entry(format!("{} {}", Utc::now().format("%Y-%m-%d %H:%M:%S"), msg));
        Ok(())
    }

    //=== Dependencies ===

    /// Names of trees that depend on `tree_name`
    pub fn find_dependent_trees(&self, tree_name: &str) -> Result<Vec<String>> {
        let state = self.lock()?;
        if !state.trees.contains_key(tree_name) {
            return Err(SchedulerError::NotFound(format!("tree {}", tree_name)));
        }
        Ok(state.dependant_trees(tree_name))
    }

    /// Counterparts of a node in every tree that depends on its tree
    pub fn find_dependent_tree_nodes(&self, process_name: &str, timeperiod: &str) -> Result<Vec<TreeNode>> {
        let state = self.lock()?;
        state.node(process_name, timeperiod)?;
        state
            .dependant_node_keys(process_name, timeperiod)?
            .into_iter()
            .map(|(p, tp)| state.node(&p, &tp).cloned())
            .collect()
    }

    /// Counterpart of a node in another tree; None when that tree has no matching level or node
    pub fn find_counterpart_for(&self, process_name: &str, timeperiod: &str, tree_name: &str) -> Result<Option<TreeNode>> {
        let state = self.lock()?;
        let qualifier = state.tree_for(process_name)?.qualifier_of(process_name)?;
        let tree_b = state
            .trees
            .get(tree_name)
            .ok_or_else(|| SchedulerError::NotFound(format!("tree {}", tree_name)))?;
        Ok(tree_b.find_counterpart(qualifier, timeperiod)?.cloned())
    }

    //=== Snapshots ===

    pub fn tree_names(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.trees.keys().cloned().collect())
    }

    pub fn get_tree(&self, tree_name: &str) -> Result<TimetableTree> {
        self.lock()?
            .trees
            .get(tree_name)
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(format!("tree {}", tree_name)))
    }

    pub fn get_tree_for_process(&self, process_name: &str) -> Result<TimetableTree> {
        Ok(self.lock()?.tree_for(process_name)?.clone())
    }

    pub fn get_node(&self, process_name: &str, timeperiod: &str) -> Result<TreeNode> {
        Ok(self.lock()?.node(process_name, timeperiod)?.clone())
    }

    pub fn get_job(&self, process_name: &str, timeperiod: &str) -> Result<Job> {
        Ok(self.lock()?.node(process_name, timeperiod)?.job.clone())
    }

    /// False for timeperiods grouped out of a process's schedule
    pub fn is_aligned(&self, process_name: &str, timeperiod: &str) -> Result<bool> {
        self.lock()?.tree_for(process_name)?.is_aligned(process_name, timeperiod)
    }

    pub fn manages(&self, process_name: &str) -> bool {
        self.lock().is_ok_and(|s| s.process_to_tree.contains_key(process_name))
    }

    /// Reprocessing queue of a process, oldest first
    pub fn reprocess_queue(&self, process_name: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .reprocess
            .get(process_name)
            .map(|tps| tps.iter().cloned().collect())
            .unwrap_or_default())
    }
}
