//! Job event types and the broadcast bus they travel on
//!
//! Mirrors the progress registry's state but as a push channel: useful for
//! auxiliary observers (logging, metrics, a future multi-job dashboard) that
//! don't want to poll. The per-job WebSocket contract in the boundary surface
//! still polls the registry directly; it does not depend on this bus.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events emitted as a job moves through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// A new job was admitted to the registry
    JobCreated { job_id: Uuid, message: String },

    /// A stage boundary was crossed (start or end of a named stage)
    Progress {
        job_id: Uuid,
        progress: u8,
        message: String,
        is_step_start: bool,
        step_name: Option<String>,
    },

    /// Job reached a terminal success state
    Completed { job_id: Uuid },

    /// Job reached a terminal failure state
    Failed { job_id: Uuid, stage: String, message: String },

    /// Job was cancelled by request
    Cancelled { job_id: Uuid },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::JobCreated { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Completed { job_id }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Cancelled { job_id } => *job_id,
        }
    }
}

/// Broadcast bus for [`JobEvent`]s
///
/// Cloneable handle; every clone shares the same underlying channel.
/// Subscribers that lag behind the buffer simply miss events (a snapshot
/// read from the progress registry is always available as a fallback).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity (events buffered
    /// before the slowest subscriber starts dropping them).
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all current subscribers; returns the number
    /// reached, or 0 if there were none (never an error condition here).
    pub fn publish(&self, event: JobEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(8);
        assert_eq!(bus.publish(JobEvent::Cancelled { job_id: Uuid::nil() }), 0);
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let job_id = Uuid::new_v4();
        bus.publish(JobEvent::JobCreated {
            job_id,
            message: "queued".into(),
        });
        let received = rx.recv().await.unwrap();
        assert_eq!(received.job_id(), job_id);
    }

    #[tokio::test]
    async fn independent_subscribers_each_get_a_copy() {
        let bus = EventBus::new(8);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        let job_id = Uuid::new_v4();
        bus.publish(JobEvent::Completed { job_id });
        assert_eq!(rx1.recv().await.unwrap().job_id(), job_id);
        assert_eq!(rx2.recv().await.unwrap().job_id(), job_id);
    }
}
