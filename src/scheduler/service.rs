//! The scheduler service: owns every subsystem and the timers that drive them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::task::JoinHandle;

use super::timer::{Callback, RepeatTimer};
use crate::config::{ProcessRegistry, SchedulerSettings, TimeslicerConfig};
use crate::domain::Job;
use crate::error::{Result, SchedulerError};
use crate::gc::{CollectorEntry, GarbageCollector, GcStats};
use crate::notify::{Broadcaster, JobStatusListener, Trigger, UowStatusListener};
use crate::state_machine::{FreerunStateMachine, StateMachine};
use crate::storage::Storage;
use crate::time::{TimeQualifier, TriggerFrequency, increment_timeperiod, timeperiod_to_datetime};
use crate::timetable::Timetable;
use crate::transport::{MemoryTransport, Publisher, QUEUE_JOB_STATUS, QUEUE_UOW_STATUS};

/// Timer name of the garbage collector
pub const GC_HANDLER: &str = "gc";

pub struct Scheduler {
    settings: SchedulerSettings,
    registry: Arc<ProcessRegistry>,
    timetable: Arc<Timetable>,
    machine: Arc<StateMachine>,
    freerun: Arc<FreerunStateMachine>,
    gc: Arc<GarbageCollector>,
    storage: Arc<dyn Storage>,
    transport: Arc<MemoryTransport>,
    timers: Mutex<BTreeMap<String, RepeatTimer>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(config: &TimeslicerConfig, storage: Arc<dyn Storage>, transport: Arc<MemoryTransport>) -> Result<Self> {
        let registry = Arc::new(ProcessRegistry::from_config(config)?);
        for rejection in registry.rejected() {
            log::error!("Rejected {}: {}", rejection.name, rejection.reason);
        }
        let publisher: Arc<dyn Publisher> = transport.clone();
        let timetable = Arc::new(Timetable::new(registry.clone(), storage.clone())?);

        Ok(Self {
            settings: config.settings.clone(),
            machine: Arc::new(StateMachine::new(timetable.clone(), storage.clone(), publisher.clone())),
            freerun: Arc::new(FreerunStateMachine::new(registry.clone(), storage.clone(), publisher.clone())),
            gc: Arc::new(GarbageCollector::new(
                config.gc.clone(),
                registry.clone(),
                storage.clone(),
                publisher,
            )),
            registry,
            timetable,
            storage,
            transport,
            timers: Mutex::new(BTreeMap::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Restore persisted jobs, grow the trees up to `now` and validate them
    pub fn boot(&self, now: DateTime<Utc>) -> Result<()> {
        self.timetable.load_trees()?;
        self.timetable.build_trees(now)?;
        self.timetable.validate()
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn timetable(&self) -> &Arc<Timetable> {
        &self.timetable
    }

    pub fn freerun(&self) -> &Arc<FreerunStateMachine> {
        &self.freerun
    }

    pub fn gc(&self) -> &Arc<GarbageCollector> {
        &self.gc
    }

    //=== Workers ===

    /// One fire of a managed process's timer.
    ///
    /// Keeps working while the handled job became finished, so a backlog drains in one
    /// fire. Processes that do not run on the active timeperiod wait for the period to
    /// close plus the trigger lag.
    pub fn fire_managed_worker(&self, process_name: &str, now: DateTime<Utc>) -> Result<usize> {
        let context = self.registry.get(process_name)?;
        if !context.is_on {
            log::debug!("Process {} is off; skipping fire", process_name);
            return Ok(0);
        }

        let mut handled = 0;
        let mut last: Option<String> = None;
        loop {
            let job = self.timetable.get_next_job_record(process_name)?;
            if last.as_deref() == Some(job.id.as_str()) {
                break;
            }
            if !context.run_on_active_timeperiod && !self.is_due(context.time_qualifier, &job, now)? {
                log::info!("{} is not due until its timeperiod closes", job.id);
                break;
            }

            self.machine.dispatch(&job, now)?;
            handled += 1;

            let after = self.timetable.get_job(process_name, &job.timeperiod)?;
            if !after.is_finished() {
                break;
            }
            last = Some(job.id);
        }
        Ok(handled)
    }

    /// Past the end of the job's period plus the trigger lag
    fn is_due(&self, qualifier: TimeQualifier, job: &Job, now: DateTime<Utc>) -> Result<bool> {
        let end = timeperiod_to_datetime(&increment_timeperiod(qualifier, &job.timeperiod, 1)?)?;
        Ok(now > end + chrono::Duration::minutes(self.settings.trigger_lag_minutes))
    }

    pub fn fire_freerun_worker(&self, schedulable_name: &str, now: DateTime<Utc>) -> Result<()> {
        self.freerun.manage_schedulable(schedulable_name, now)
    }

    /// Collector pass followed by tree maintenance
    pub fn fire_garbage_collector(&self, now: DateTime<Utc>) -> Result<GcStats> {
        let stats = self.gc.run(now)?;
        self.timetable.build_trees(now)?;
        self.timetable.validate()?;
        Ok(stats)
    }

    //=== Lifecycle ===

    /// Spawn the listeners and one timer per handler; needs a tokio runtime
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let uow_listener = Arc::new(UowStatusListener::new(
            self.machine.clone(),
            self.freerun.clone(),
            self.storage.clone(),
        ));
        let trigger: Arc<dyn Trigger> = self.clone();
        let job_listener = Arc::new(JobStatusListener::new(Arc::new(Broadcaster::new(
            self.timetable.clone(),
            trigger,
        ))));

        let uow_rx = self.transport.subscribe(QUEUE_UOW_STATUS)?;
        let job_rx = self.transport.subscribe(QUEUE_JOB_STATUS)?;
        {
            let mut tasks = self.tasks()?;
            tasks.push(tokio::spawn(uow_listener.run(uow_rx)));
            tasks.push(tokio::spawn(job_listener.run(job_rx)));
        }

        let weak = Arc::downgrade(self);
        let mut timers = self.timers()?;

        for context in self.registry.processes() {
            if !self.timetable.manages(&context.process_name) {
                log::warn!("Process {} belongs to no tree; no timer started", context.process_name);
                continue;
            }
            let name = context.process_name.clone();
            let callback = managed_callback(weak.clone(), name.clone());
            let timer = self.spawn_timer(&name, context.trigger_frequency.clone(), callback)?;
            if !context.is_on {
                timer.deactivate()?;
            }
            timers.insert(name, timer);
        }

        for context in self.registry.freerun_entries() {
            let name = context.schedulable_name.clone();
            let callback = freerun_callback(weak.clone(), name.clone());
            let timer = self.spawn_timer(&name, context.trigger_frequency.clone(), callback)?;
            if !context.is_on {
                timer.deactivate()?;
            }
            timers.insert(name, timer);
        }

        let interval = TriggerFrequency::every_secs(self.gc.config().run_interval_secs);
        let timer = self.spawn_timer(GC_HANDLER, interval, gc_callback(weak))?;
        timers.insert(GC_HANDLER.to_string(), timer);

        log::info!("Scheduler started with {} timers", timers.len());
        Ok(())
    }

    fn spawn_timer(&self, name: &str, frequency: TriggerFrequency, callback: Callback) -> Result<RepeatTimer> {
        let (timer, handle) = RepeatTimer::spawn(name, frequency, callback);
        self.tasks()?.push(handle);
        Ok(timer)
    }

    /// Stop every timer and listener and wait for them to wind down
    pub async fn shutdown(&self) -> Result<()> {
        let handles: Vec<JoinHandle<()>> = {
            for timer in self.timers()?.values() {
                if let Err(e) = timer.shutdown() {
                    log::debug!("{}", e);
                }
            }
            self.timers()?.clear();
            self.tasks()?.drain(..).collect()
        };
        for handle in &handles {
            // Listeners never see their senders drop
            if !handle.is_finished() {
                handle.abort();
            }
        }
        let stopped = join_all(handles).await.len();
        log::info!("Scheduler stopped; {} tasks joined", stopped);
        Ok(())
    }

    fn timers(&self) -> Result<MutexGuard<'_, BTreeMap<String, RepeatTimer>>> {
        self.timers.lock().map_err(SchedulerError::poisoned)
    }

    fn tasks(&self) -> Result<MutexGuard<'_, Vec<JoinHandle<()>>>> {
        self.tasks.lock().map_err(SchedulerError::poisoned)
    }

    fn with_timer<T>(&self, handler: &str, f: impl FnOnce(&RepeatTimer) -> Result<T>) -> Result<T> {
        let timers = self.timers()?;
        let timer = timers
            .get(handler)
            .ok_or_else(|| SchedulerError::NotFound(format!("timer {}", handler)))?;
        f(timer)
    }

    //=== Timer control ===

    pub fn activate(&self, handler: &str) -> Result<()> {
        self.with_timer(handler, RepeatTimer::activate)
    }

    pub fn deactivate(&self, handler: &str) -> Result<()> {
        self.with_timer(handler, RepeatTimer::deactivate)
    }

    pub fn trigger_now(&self, handler: &str) -> Result<()> {
        self.with_timer(handler, RepeatTimer::trigger_now)
    }

    pub fn change_interval(&self, handler: &str, frequency: TriggerFrequency) -> Result<()> {
        self.with_timer(handler, |t| t.change_interval(frequency))
    }

    pub fn next_run_in(&self, handler: &str, now: DateTime<Utc>) -> Result<Option<Duration>> {
        self.with_timer(handler, |t| t.next_run_in(now))
    }

    pub fn handlers(&self) -> Result<Vec<String>> {
        Ok(self.timers()?.keys().cloned().collect())
    }

    //=== Management ===

    /// Timeperiod the next fire of a process will work on
    pub fn next_timeperiod(&self, process_name: &str) -> Result<String> {
        if let Some(tp) = self.timetable.reprocess_queue(process_name)?.into_iter().next() {
            return Ok(tp);
        }
        let tree = self.timetable.get_tree_for_process(process_name)?;
        Ok(tree.get_next_node(process_name)?.timeperiod.clone())
    }

    pub fn reprocess_tree_node(&self, process_name: &str, timeperiod: &str) -> Result<()> {
        self.timetable.reprocess_tree_node(process_name, timeperiod)
    }

    pub fn skip_tree_node(&self, process_name: &str, timeperiod: &str) -> Result<()> {
        self.timetable.skip_tree_node(process_name, timeperiod)
    }

    pub fn cancel_uow(&self, schedulable_name: &str, now: DateTime<Utc>) -> Result<()> {
        self.freerun.cancel_uow(schedulable_name, now)
    }

    pub fn flush_one(&self, process_name: &str, now: DateTime<Utc>) -> Result<usize> {
        self.gc.flush_one(process_name, now)
    }

    pub fn flush_all(&self, now: DateTime<Utc>) -> Result<usize> {
        self.gc.flush_all(now)
    }

    pub fn gc_queue(&self) -> Result<BTreeMap<String, Vec<CollectorEntry>>> {
        self.gc.queue_snapshot()
    }

    pub fn reprocessing_timeperiods(&self, process_name: &str) -> Result<Vec<String>> {
        self.gc.reprocessing_timeperiods(process_name)
    }
}

impl Trigger for Scheduler {
    fn trigger(&self, process_name: &str) -> Result<()> {
        self.trigger_now(process_name)
    }
}

fn managed_callback(scheduler: Weak<Scheduler>, process_name: String) -> Callback {
    Arc::new(move || {
        let Some(scheduler) = scheduler.upgrade() else { return };
        match scheduler.fire_managed_worker(&process_name, Utc::now()) {
            Ok(handled) => log::debug!("{}: handled {} jobs", process_name, handled),
            Err(e) => log::error!("Managed worker {} failed: {}", process_name, e),
        }
    })
}

fn freerun_callback(scheduler: Weak<Scheduler>, schedulable_name: String) -> Callback {
    Arc::new(move || {
        let Some(scheduler) = scheduler.upgrade() else { return };
        if let Err(e) = scheduler.fire_freerun_worker(&schedulable_name, Utc::now()) {
            log::error!("Freerun worker {} failed: {}", schedulable_name, e);
        }
    })
}

fn gc_callback(scheduler: Weak<Scheduler>) -> Callback {
    Arc::new(move || {
        let Some(scheduler) = scheduler.upgrade() else { return };
        if let Err(e) = scheduler.fire_garbage_collector(Utc::now()) {
            log::error!("Garbage collector failed: {}", e);
        }
    })
}
