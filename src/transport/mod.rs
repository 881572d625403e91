//! Message transport between the scheduler and its workers.
//!
//! The core only publishes references (`MqTransmission`) and consumes completion
//! events. `MemoryTransport` implements both sides in-process over tokio channels:
//! each queue has exactly one consumer and delivery order is publish order.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::domain::MqTransmission;
use crate::error::{Result, SchedulerError};

/// Completion events for units of work
pub const QUEUE_UOW_STATUS: &str = "q_uow_status";

/// Completion events for jobs
pub const QUEUE_JOB_STATUS: &str = "q_job_status";

/// Units of work canceled by the garbage collector
pub const QUEUE_UOW_REPORT: &str = "q_uow_report";

/// Worker queue for a process
pub fn worker_queue(process_name: &str) -> String {
    format!("q_{}", process_name)
}

/// Outbound side of the transport
pub trait Publisher: Send + Sync {
    /// Fire-and-forget publish; delivery is at-least-once
    fn publish(&self, queue: &str, message: &MqTransmission) -> Result<()>;
}

struct Queue {
    sender: UnboundedSender<MqTransmission>,
    /// Taken by the single consumer
    receiver: Option<UnboundedReceiver<MqTransmission>>,
}

impl Queue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Some(receiver),
        }
    }
}

/// In-process transport; messages wait in the queue until a consumer subscribes.
///
/// Receipt is the acknowledgement: a consumed message is never redelivered.
#[derive(Default)]
pub struct MemoryTransport {
    queues: Mutex<HashMap<String, Queue>>,
    history: Mutex<Vec<(String, MqTransmission)>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the consumer end of a queue
    pub fn subscribe(&self, queue: &str) -> Result<UnboundedReceiver<MqTransmission>> {
        let mut queues = self.queues.lock().map_err(SchedulerError::poisoned)?;
        queues
            .entry(queue.to_string())
            .or_insert_with(Queue::new)
            .receiver
            .take()
            .ok_or_else(|| SchedulerError::Transport(format!("queue {} already has a consumer", queue)))
    }

    /// Every message published so far, oldest first
    pub fn history(&self) -> Result<Vec<(String, MqTransmission)>> {
        Ok(self.history.lock().map_err(SchedulerError::poisoned)?.clone())
    }

    /// Messages published to one queue, oldest first
    pub fn published_to(&self, queue: &str) -> Result<Vec<MqTransmission>> {
        Ok(self
            .history
            .lock()
            .map_err(SchedulerError::poisoned)?
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, m)| m.clone())
            .collect())
    }
}

impl Publisher for MemoryTransport {
    fn publish(&self, queue: &str, message: &MqTransmission) -> Result<()> {
        {
            let mut queues = self.queues.lock().map_err(SchedulerError::poisoned)?;
            let slot = queues.entry(queue.to_string()).or_insert_with(Queue::new);
            if slot.sender.send(message.clone()).is_err() {
                // Consumer dropped; keep the queue usable for the next subscriber
                log::warn!("Consumer of {} is gone, recreating queue", queue);
                let fresh = Queue::new();
                fresh
                    .sender
                    .send(message.clone())
                    .map_err(|e| SchedulerError::Transport(e.to_string()))?;
                *slot = fresh;
            }
        }
        log::debug!("Published {} to {}", message.record_db_id, queue);
        self.history
            .lock()
            .map_err(SchedulerError::poisoned)?
            .push((queue.to_string(), message.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_then_subscribe_keeps_order() {
        let transport = MemoryTransport::new();
        transport.publish("q_a", &MqTransmission::new("a", "1")).unwrap();
        transport.publish("q_a", &MqTransmission::new("a", "2")).unwrap();

        let mut rx = transport.subscribe("q_a").unwrap();
        assert_eq!(rx.recv().await.unwrap().record_db_id, "1");
        assert_eq!(rx.recv().await.unwrap().record_db_id, "2");
    }

    #[test]
    fn test_single_consumer_per_queue() {
        let transport = MemoryTransport::new();
        let _rx = transport.subscribe(QUEUE_UOW_STATUS).unwrap();
        assert!(transport.subscribe(QUEUE_UOW_STATUS).is_err());
    }

    #[test]
    fn test_publish_after_consumer_dropped() {
        let transport = MemoryTransport::new();
        drop(transport.subscribe("q_a").unwrap());
        assert!(transport.publish("q_a", &MqTransmission::new("a", "1")).is_ok());
        assert_eq!(transport.published_to("q_a").unwrap().len(), 1);
    }

    #[test]
    fn test_worker_queue_name() {
        assert_eq!(worker_queue("hourly_site"), "q_hourly_site");
    }
}
