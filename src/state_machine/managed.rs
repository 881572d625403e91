//! Executor for the managed state machines.
//!
//! Reads a fresh job snapshot from the timetable, asks [`decide`] for the next step
//! and applies it: unit of work persistence, publication and the job update.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::Level;

use super::transition::{Transition, TransitionInput, decide, decide_notification};
use crate::config::{BlockingType, ProcessContext};
use crate::domain::{Job, JobState, MqTransmission, UnitOfWork, UowType};
use crate::error::{Result, SchedulerError};
use crate::storage::{Storage, UowDao};
use crate::time::{actual_timeperiod_at, increment_timeperiod};
use crate::timetable::Timetable;
use crate::transport::{Publisher, QUEUE_JOB_STATUS, worker_queue};

fn stamped(now: DateTime<Utc>, msg: &str) -> String {
    format!("{} {}", now.format("%Y-%m-%d %H:%M:%S"), msg)
}

/// Drives timetable jobs for every managed process
pub struct StateMachine {
    timetable: Arc<Timetable>,
    uow_dao: UowDao,
    publisher: Arc<dyn Publisher>,
}

impl StateMachine {
    pub fn new(timetable: Arc<Timetable>, storage: Arc<dyn Storage>, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            timetable,
            uow_dao: UowDao::new(storage),
            publisher,
        }
    }

    pub fn timetable(&self) -> &Arc<Timetable> {
        &self.timetable
    }

    //=== Event log ===

    /// Log and record on the job copy that is about to be stored
    fn record(&self, job: &mut Job, level: Level, now: DateTime<Utc>, msg: String) {
        log::log!(level, "{}", msg);
        job.add_log_entry(stamped(now, &msg));
    }

    /// Log and record on the tree node when the job itself is left unchanged
    fn remark(&self, job: &Job, level: Level, msg: String) {
        log::log!(level, "{}", msg);
        if let Err(e) = self.timetable.add_log_entry(&job.process_name, &job.timeperiod, &msg) {
            log::debug!("Could not record event for {}: {}", job.id, e);
        }
    }

    //=== Entry points ===

    /// Run `manage_job` through the process's blocking policy
    pub fn dispatch(&self, job: &Job, now: DateTime<Utc>) -> Result<()> {
        let blocking_type = self.timetable.registry().get(&job.process_name)?.blocking_type;
        match blocking_type {
            BlockingType::BlockingNormal => self.manage_job(job, now),
            BlockingType::BlockingChildren => self.manage_job_with_blocking_children(job, now),
            BlockingType::BlockingDependencies => self.manage_job_with_blocking_dependencies(job, now),
        }
    }

    /// Proceed once children and dependencies are finished, or earlier for
    /// processes that run on the active timeperiod while everything is healthy
    pub fn manage_job_with_blocking_children(&self, job: &Job, now: DateTime<Utc>) -> Result<()> {
        let run_on_active = self.timetable.registry().run_on_active_timeperiod(&job.process_name);
        let is_finalizable = self.timetable.is_job_record_finalizable(job)?;
        let composite = self.timetable.dependent_on_composite_state(job)?;

        if is_finalizable || (composite.all_healthy() && run_on_active) {
            self.manage_job(job, now)
        } else {
            self.remark(
                job,
                Level::Info,
                format!(
                    "{} is blocked by unprocessed children or dependencies. Waiting another tick",
                    job.id
                ),
            );
            Ok(())
        }
    }

    /// Proceed once every dependency is processed; a skipped dependency skips the job
    pub fn manage_job_with_blocking_dependencies(&self, job: &Job, now: DateTime<Utc>) -> Result<()> {
        let run_on_active = self.timetable.registry().run_on_active_timeperiod(&job.process_name);
        let composite = self.timetable.dependent_on_composite_state(job)?;

        if composite.all_processed() || (composite.all_healthy() && run_on_active) {
            self.manage_job(job, now)
        } else if composite.skipped_present() {
            let mut job = self.timetable.get_job(&job.process_name, &job.timeperiod)?;
            let msg = format!(
                "{} is blocked by skipped dependencies {}. Transferred the job to skipped",
                job.id,
                composite.skipped.join(",")
            );
            self.record(&mut job, Level::Warn, now, msg);
            job.state = JobState::Skipped;
            self.timetable.transition_job_record(&mut job).map(|_| ())
        } else {
            self.remark(
                job,
                Level::Info,
                format!("{} is blocked by unprocessed dependencies. Waiting another tick", job.id),
            );
            Ok(())
        }
    }

    /// Advance a job by one step.
    ///
    /// Lookup failures are not propagated: they count against the job and the next
    /// trigger retries.
    pub fn manage_job(&self, job: &Job, now: DateTime<Utc>) -> Result<()> {
        match self.try_manage_job(job, now) {
            Err(e) if e.is_lookup() => {
                let msg = format!("Increasing fail counter for {}, because of: {}", job.id, e);
                self.timetable
                    .failed_on_processing_job_record(&job.process_name, &job.timeperiod)?;
                self.remark(job, Level::Warn, msg);
                Ok(())
            }
            other => other,
        }
    }

    fn try_manage_job(&self, job: &Job, now: DateTime<Utc>) -> Result<()> {
        let context = self.timetable.registry().get(&job.process_name)?;
        let mut job = self.timetable.get_job(&job.process_name, &job.timeperiod)?;
        let uow = match &job.related_unit_of_work {
            Some(id) => Some(self.uow_dao.get_one(id)?),
            None => None,
        };

        let actual = actual_timeperiod_at(context.time_qualifier, now);
        let is_finalizable = job.is_active() && self.timetable.is_job_record_finalizable(&job)?;
        let is_aligned = self.timetable.is_aligned(&job.process_name, &job.timeperiod)?;

        let transition = decide(
            context.state_machine.policy(),
            &TransitionInput {
                job_state: job.state,
                timeperiod: &job.timeperiod,
                actual_timeperiod: &actual,
                is_finalizable,
                is_aligned,
                uow: uow.as_ref(),
            },
        );
        log::debug!("{} ({}): {:?}", job.id, context.state_machine, transition);
        self.apply(context, &mut job, uow.as_ref(), transition, now)
    }

    /// Shallow state update on a completion message; never dispatches new work
    pub fn notify(&self, uow: &UnitOfWork, now: DateTime<Utc>) -> Result<()> {
        let context = self.timetable.registry().get(&uow.process_name)?;
        let mut job = self.timetable.get_job(&uow.process_name, &uow.timeperiod)?;

        let actual = actual_timeperiod_at(context.time_qualifier, now);
        let is_finalizable = job.is_active() && self.timetable.is_job_record_finalizable(&job)?;
        let step = decide_notification(
            context.state_machine.policy(),
            &TransitionInput {
                job_state: job.state,
                timeperiod: &job.timeperiod,
                actual_timeperiod: &actual,
                is_finalizable,
                is_aligned: true,
                uow: Some(uow),
            },
        );

        match step {
            Transition::Finalize(_) => self.apply(context, &mut job, Some(uow), step, now),
            Transition::Wait(reason) | Transition::Unsupported(reason) => {
                log::info!("Suppressing state change for {}: {}", job.id, reason);
                Ok(())
            }
            other => {
                log::debug!("Ignoring {:?} on notification for {}", other, job.id);
                Ok(())
            }
        }
    }

    //=== Applying transitions ===

    /// Apply a transition decided on a snapshot of `job`.
    ///
    /// The job write only lands if the node is still at the snapshot's revision;
    /// otherwise another writer got there first and this step is dropped.
    fn apply(
        &self,
        context: &ProcessContext,
        job: &mut Job,
        uow: Option<&UnitOfWork>,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match transition {
            Transition::MarkNoop => {
                let msg = format!("Transferred job {} to noop; the timeperiod is grouped out", job.id);
                self.record(job, Level::Info, now, msg);
                job.state = JobState::Noop;
                if !self.timetable.transition_job_record(job)? {
                    return Ok(());
                }
                self.publish_job_status(context, job)
            }
            Transition::Dispatch {
                start_id,
                end_id,
                job_state,
            } => {
                let (uow, is_duplicate) = self.insert_and_publish_uow(context, job, &start_id, &end_id, now)?;
                job.related_unit_of_work = Some(uow.id.clone());
                job.state = job_state;
                let msg = format!("Transferred job {} to {}", job.id, job_state.as_str());
                self.record(job, Level::Info, now, msg);
                if !self.timetable.transition_job_record(job)? {
                    return Ok(());
                }

                // A recovered final unit of work may already be complete
                if is_duplicate && job_state == JobState::FinalRun {
                    let step = decide(
                        context.state_machine.policy(),
                        &TransitionInput {
                            job_state,
                            timeperiod: &job.timeperiod,
                            actual_timeperiod: &job.timeperiod,
                            is_finalizable: true,
                            is_aligned: true,
                            uow: Some(&uow),
                        },
                    );
                    if let Transition::Finalize(_) = step {
                        return self.apply(context, job, Some(&uow), step, now);
                    }
                }
                Ok(())
            }
            Transition::Republish => {
                let uow = uow.ok_or_else(|| SchedulerError::NotFound(format!("unit of work for {}", job.id)))?;
                self.publish_uow(uow)?;
                self.remark(
                    job,
                    Level::Info,
                    format!("Republished: UOW {} for {} in state {}", uow.id, job.id, uow.state.as_str()),
                );
                Ok(())
            }
            Transition::RefreshScope => {
                let mut uow = uow
                    .cloned()
                    .ok_or_else(|| SchedulerError::NotFound(format!("unit of work for {}", job.id)))?;
                uow.submitted_at = Some(now);
                self.uow_dao.update(&uow)?;
                self.publish_uow(&uow)?;
                self.remark(job, Level::Info, format!("Refreshed: UOW {} for {}", uow.id, job.id));
                Ok(())
            }
            Transition::Finalize(state) => {
                let msg = format!("Transferred job {} to {}", job.id, state.as_str());
                self.record(job, Level::Info, now, msg);
                job.state = state;
                if !self.timetable.transition_job_record(job)? {
                    return Ok(());
                }
                self.publish_job_status(context, job)
            }
            Transition::Wait(msg) => {
                self.remark(job, Level::Info, format!("{}: {}", job.id, msg));
                Ok(())
            }
            Transition::Unsupported(msg) => {
                self.remark(job, Level::Error, format!("{}: {}", job.id, msg));
                Ok(())
            }
        }
    }

    /// Create a unit of work for the job's period and publish it.
    ///
    /// An existing unit of work with the same boundaries is recovered and reused;
    /// the flag tells whether that happened.
    fn insert_and_publish_uow(
        &self,
        context: &ProcessContext,
        job: &mut Job,
        start_id: &str,
        end_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(UnitOfWork, bool)> {
        let end_timeperiod = increment_timeperiod(context.time_qualifier, &job.timeperiod, 1)?;
        let candidate = UnitOfWork::new(
            &job.process_name,
            &job.timeperiod,
            &job.timeperiod,
            &end_timeperiod,
            start_id,
            end_id,
            UowType::Managed,
            now,
        )
        .with_source_sink(context.source.clone(), context.sink.clone())
        .with_arguments(context.arguments.clone());

        let (uow, is_duplicate) = match self.uow_dao.insert(&candidate) {
            Ok(()) => {
                let msg = format!(
                    "Created: UOW {} for {} in timeperiod [{}:{})",
                    candidate.id, job.process_name, candidate.start_timeperiod, candidate.end_timeperiod
                );
                self.record(job, Level::Info, now, msg);
                (candidate, false)
            }
            Err(SchedulerError::DuplicateKey { .. }) => {
                let msg = format!("Catching up with existing UOW {} for {}", candidate.id, job.id);
                self.record(job, Level::Warn, now, msg);
                (self.uow_dao.recover_from_duplicate(&candidate)?, true)
            }
            Err(e) => return Err(e),
        };

        self.publish_uow(&uow)?;
        let msg = format!("Published: UOW {} for {}", uow.id, job.id);
        self.record(job, Level::Info, now, msg);
        Ok((uow, is_duplicate))
    }

    fn publish_uow(&self, uow: &UnitOfWork) -> Result<()> {
        let message = MqTransmission::new(&uow.process_name, &uow.id);
        self.publisher.publish(&worker_queue(&uow.process_name), &message)
    }

    fn publish_job_status(&self, context: &ProcessContext, job: &Job) -> Result<()> {
        if !context.state_machine.policy().publish_job_status || !job.is_finished() {
            return Ok(());
        }
        self.publisher
            .publish(QUEUE_JOB_STATUS, &MqTransmission::new(&job.process_name, &job.id))
    }
}
