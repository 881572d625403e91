//! Dependency broadcast on job completion.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::Result;
use crate::timetable::{Timetable, TreeNode};

/// Something that can wake a process's worker out of schedule
pub trait Trigger: Send + Sync {
    fn trigger(&self, process_name: &str) -> Result<()>;
}

pub struct Broadcaster {
    timetable: Arc<Timetable>,
    trigger: Arc<dyn Trigger>,
}

impl Broadcaster {
    pub fn new(timetable: Arc<Timetable>, trigger: Arc<dyn Trigger>) -> Self {
        Self { timetable, trigger }
    }

    /// Wake the processes owning the dependants of a finished node.
    ///
    /// Returns the processes that were triggered.
    pub fn broadcast(&self, process_name: &str, timeperiod: &str) -> Result<BTreeSet<String>> {
        let nodes = self.timetable.find_dependent_tree_nodes(process_name, timeperiod)?;
        let handlers = self.handlers_to_trigger(&nodes);

        for handler in &handlers {
            if let Err(e) = self.trigger.trigger(handler) {
                log::warn!("Could not trigger {} after {}@{}: {}", handler, process_name, timeperiod, e);
            }
        }
        if !handlers.is_empty() {
            log::info!(
                "{}@{} finished; triggered {}",
                process_name,
                timeperiod,
                handlers.iter().cloned().collect::<Vec<_>>().join(",")
            );
        }
        Ok(handlers)
    }

    /// One handler per owning process; self-triggering processes are left alone
    fn handlers_to_trigger(&self, nodes: &[TreeNode]) -> BTreeSet<String> {
        let registry = self.timetable.registry();
        nodes
            .iter()
            .filter(|node| !registry.run_on_active_timeperiod(&node.process_name))
            .map(|node| node.process_name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProcessEntry, ProcessRegistry, TimeslicerConfig, TreeEntry};
    use crate::domain::Job;
    use crate::storage::{MemoryStorage, Storage};
    use crate::time::TimeQualifier;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        fired: Mutex<Vec<String>>,
    }

    impl Trigger for Recorder {
        fn trigger(&self, process_name: &str) -> Result<()> {
            self.fired.lock().unwrap().push(process_name.to_string());
            Ok(())
        }
    }

    fn setup() -> (Broadcaster, Arc<Recorder>) {
        setup_with(vec![
            TreeEntry::new("site", &["daily_site"]),
            TreeEntry::new("client", &["daily_client"]).with_dependent_on(&["site"]),
            TreeEntry::new("alerts", &["daily_alerts"]).with_dependent_on(&["site"]),
            TreeEntry::new("live", &["daily_live"]).with_dependent_on(&["site"]),
        ])
    }

    fn setup_with(trees: Vec<TreeEntry>) -> (Broadcaster, Arc<Recorder>) {
        let registry = ProcessRegistry::from_config(&TimeslicerConfig {
            processes: vec![
                ProcessEntry::new("daily_site", "daily", "discrete"),
                ProcessEntry::new("daily_client", "daily", "discrete"),
                ProcessEntry::new("daily_alerts", "daily", "discrete"),
                ProcessEntry::new("daily_live", "daily", "continuous"),
            ],
            trees,
            ..Default::default()
        })
        .unwrap();
        assert!(registry.rejected().is_empty());
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let timetable = Arc::new(Timetable::new(Arc::new(registry), storage).unwrap());
        timetable
            .build_trees(Utc.with_ymd_and_hms(2020, 1, 2, 12, 0, 0).unwrap())
            .unwrap();

        let recorder = Arc::new(Recorder::default());
        let trigger: Arc<dyn Trigger> = recorder.clone();
        (Broadcaster::new(timetable, trigger), recorder)
    }

    #[test]
    fn test_run_on_active_dependants_are_not_triggered() {
        let (broadcaster, recorder) = setup();
        let triggered = broadcaster.broadcast("daily_site", "20200101").unwrap();

        assert_eq!(
            triggered.into_iter().collect::<Vec<_>>(),
            vec!["daily_alerts".to_string(), "daily_client".to_string()]
        );
        assert_eq!(recorder.fired.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_process_reached_twice_is_triggered_once() {
        let (broadcaster, _) = setup();
        let nodes = vec![
            TreeNode::new(Job::new("daily_client", "20200101"), TimeQualifier::Daily),
            TreeNode::new(Job::new("daily_client", "20200102"), TimeQualifier::Daily),
            TreeNode::new(Job::new("daily_live", "20200101"), TimeQualifier::Daily),
        ];
        let handlers = broadcaster.handlers_to_trigger(&nodes);
        assert_eq!(handlers.len(), 1);
        assert!(handlers.contains("daily_client"));
    }

    #[test]
    fn test_dependant_declared_through_two_edges_is_triggered_once() {
        let (broadcaster, recorder) = setup_with(vec![
            TreeEntry::new("site", &["daily_site"]),
            TreeEntry::new("client", &["daily_client"]).with_dependent_on(&["site", "site"]),
        ]);

        let triggered = broadcaster.broadcast("daily_site", "20200101").unwrap();
        assert_eq!(triggered.into_iter().collect::<Vec<_>>(), vec!["daily_client".to_string()]);
        assert_eq!(*recorder.fired.lock().unwrap(), vec!["daily_client".to_string()]);
    }

    #[test]
    fn test_unknown_node_is_lookup_error() {
        let (broadcaster, recorder) = setup();
        assert!(broadcaster.broadcast("daily_site", "20300101").unwrap_err().is_lookup());
        assert!(recorder.fired.lock().unwrap().is_empty());
    }
}
