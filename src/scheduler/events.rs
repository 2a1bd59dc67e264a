use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::scheduler::job::JobStatus;

/// Something observable happened on the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    JobSubmitted { job_id: Uuid },
    JobAssigned { job_id: Uuid, node: String },
    JobRejected { job_id: Uuid, node: String, reason: String },
    JobStatusChanged { job_id: Uuid, status: JobStatus },
    JobRequeued { job_id: Uuid, node: String },
    NodeRegistered { node: String },
    NodeDied { node: String },
}

/// Fan-out of manager events to any number of observers.
///
/// Publishing never blocks; slow observers lag and miss events rather than
/// back-pressuring the dispatcher.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ManagerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: ManagerEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.tx.subscribe()
    }
}

/// Wakes the dispatcher. Triggers coalesce: any number of `notify` calls
/// made while a wake-up is pending result in a single dispatch pass.
#[derive(Debug, Clone)]
pub struct DispatchTrigger {
    tx: mpsc::Sender<()>,
}

impl DispatchTrigger {
    pub fn new() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    pub fn notify(&self) {
        // Full means a wake-up is already pending.
        let _ = self.tx.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_coalesces_pending_notifications() {
        let (trigger, mut rx) = DispatchTrigger::new();
        trigger.notify();
        trigger.notify();
        trigger.notify();

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn bus_delivers_to_every_subscriber() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(ManagerEvent::NodeDied {
            node: "http://n1/".to_string(),
        });

        assert!(matches!(a.recv().await.unwrap(), ManagerEvent::NodeDied { .. }));
        assert!(matches!(b.recv().await.unwrap(), ManagerEvent::NodeDied { .. }));
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(ManagerEvent::JobSubmitted {
            job_id: Uuid::new_v4(),
        });
    }
}
