//! Single-consumer listeners on the status queues.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedReceiver;

use super::Broadcaster;
use crate::domain::MqTransmission;
use crate::error::{Result, SchedulerError};
use crate::id::split_job_id;
use crate::state_machine::{FreerunStateMachine, StateMachine};
use crate::storage::{Storage, UowDao};

/// What a listener did with one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to a state machine
    Notified,
    /// Freerun work, recorded on its schedulable
    Freerun,
    /// Not the node's current unit of work
    Outdated,
    /// Still pending; the garbage collector owns it
    Unfinished,
    /// Job completion fanned out to these processes
    Broadcast(Vec<String>),
}

/// Consumes `q_uow_status` and applies completions to the timetable
pub struct UowStatusListener {
    machine: Arc<StateMachine>,
    freerun: Arc<FreerunStateMachine>,
    uow_dao: UowDao,
}

impl UowStatusListener {
    pub fn new(machine: Arc<StateMachine>, freerun: Arc<FreerunStateMachine>, storage: Arc<dyn Storage>) -> Self {
        Self {
            machine,
            freerun,
            uow_dao: UowDao::new(storage),
        }
    }

    pub fn handle(&self, message: &MqTransmission, now: DateTime<Utc>) -> Result<Delivery> {
        let uow = self.uow_dao.get_one(&message.record_db_id)?;

        if !uow.is_managed() {
            if !uow.is_finished() {
                return Ok(Delivery::Unfinished);
            }
            self.freerun.notify(&uow, now)?;
            return Ok(Delivery::Freerun);
        }

        let job = self.machine.timetable().get_job(&uow.process_name, &uow.timeperiod)?;
        if job.related_unit_of_work.as_deref() != Some(uow.id.as_str()) {
            log::info!("Transmission for {} is likely outdated; ignoring it", uow.id);
            return Ok(Delivery::Outdated);
        }
        if !uow.is_finished() {
            log::info!(
                "Transmission from {}@{} in non-final state {}; ignoring it",
                uow.process_name,
                uow.timeperiod,
                uow.state.as_str()
            );
            return Ok(Delivery::Unfinished);
        }

        log::info!(
            "Notifying state machine with UOW from {}@{} in {}",
            uow.process_name,
            uow.timeperiod,
            uow.state.as_str()
        );
        self.machine.notify(&uow, now)?;
        Ok(Delivery::Notified)
    }

    /// Drain the queue in arrival order until every sender is gone
    pub async fn run(self: Arc<Self>, mut receiver: UnboundedReceiver<MqTransmission>) {
        log::info!("UowStatusListener: activated");
        while let Some(message) = receiver.recv().await {
            let this = self.clone();
            let id = message.record_db_id.clone();
            match tokio::task::spawn_blocking(move || this.handle(&message, Utc::now())).await {
                Ok(Ok(delivery)) => log::debug!("UOW status {}: {:?}", id, delivery),
                Ok(Err(e)) => log::error!("Error during notify for {}: {}", id, e),
                Err(e) => log::error!("UOW status handler for {} panicked: {}", id, e),
            }
        }
        log::info!("UowStatusListener: shut down");
    }
}

/// Consumes `q_job_status` and hands completions to the broadcaster
pub struct JobStatusListener {
    broadcaster: Arc<Broadcaster>,
}

impl JobStatusListener {
    pub fn new(broadcaster: Arc<Broadcaster>) -> Self {
        Self { broadcaster }
    }

    pub fn handle(&self, message: &MqTransmission) -> Result<Delivery> {
        let (process_name, timeperiod) = split_job_id(&message.record_db_id)
            .ok_or_else(|| SchedulerError::InvalidRequest(format!("malformed job id {}", message.record_db_id)))?;
        let triggered = self.broadcaster.broadcast(process_name, timeperiod)?;
        Ok(Delivery::Broadcast(triggered.into_iter().collect()))
    }

    pub async fn run(self: Arc<Self>, mut receiver: UnboundedReceiver<MqTransmission>) {
        log::info!("JobStatusListener: activated");
        while let Some(message) = receiver.recv().await {
            let this = self.clone();
            let id = message.record_db_id.clone();
            match tokio::task::spawn_blocking(move || this.handle(&message)).await {
                Ok(Ok(delivery)) => log::debug!("Job status {}: {:?}", id, delivery),
                Ok(Err(e)) => log::error!("Error during broadcast for {}: {}", id, e),
                Err(e) => log::error!("Job status handler for {} panicked: {}", id, e),
            }
        }
        log::info!("JobStatusListener: shut down");
    }
}
