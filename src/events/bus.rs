//! In-process broadcast of pipeline milestones.
//!
//! Observers subscribe for audit logging or test synchronisation; the
//! webhook publisher is not a bus listener, the pipeline invokes it
//! directly.

use tokio::sync::broadcast;
use tracing::{info, trace};

/// Milestones emitted by the composer, pipeline and importer.
#[derive(Debug, Clone)]
pub enum VaultEvent {
    BatchComposed { batch_id: i64, user_id: i64 },
    BatchSubmitted { batch_id: i64, handle: String },
    BatchCompleted { batch_id: i64 },
    BatchDeclined { batch_id: i64 },
    CertificatesImported { user_id: i64, count: usize },
}

pub struct EventBus {
    sender: broadcast::Sender<VaultEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit to all subscribers. Send errors (no subscribers) are
    /// ignored.
    pub fn emit(&self, event: VaultEvent) {
        trace!(event = ?event, "Emitting vault event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VaultEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Log every bus event at info level until the bus is dropped.
pub fn spawn_logging_listener(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut receiver = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = receiver.recv().await {
            match event {
                VaultEvent::BatchComposed { batch_id, user_id } => {
                    info!(batch_id, user_id, "batch composed");
                }
                VaultEvent::BatchSubmitted { batch_id, handle } => {
                    info!(batch_id, handle = %handle, "batch submitted");
                }
                VaultEvent::BatchCompleted { batch_id } => {
                    info!(batch_id, "batch completed");
                }
                VaultEvent::BatchDeclined { batch_id } => {
                    info!(batch_id, "batch declined");
                }
                VaultEvent::CertificatesImported { user_id, count } => {
                    info!(user_id, count, "certificates imported");
                }
            }
        }
    })
}
