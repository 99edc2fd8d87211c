//! In-process broadcast channel for same-process observers.
//!
//! Uses a tokio broadcast channel for pub/sub within a single process.
//! Observers subscribe for a receiver and are expected to be idempotent on
//! `event_id`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use super::{NotificationChannel, Result};
use crate::model::NotificationEvent;

/// In-process notification channel backed by a tokio broadcast channel.
pub struct InProcessChannel {
    sender: broadcast::Sender<Arc<NotificationEvent>>,
}

impl InProcessChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe for events published after this call.
    ///
    /// Slow receivers that lag past the channel capacity skip the missed
    /// events; observers needing full history poll the persisted marker.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<NotificationEvent>> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl NotificationChannel for InProcessChannel {
    fn name(&self) -> &'static str {
        "in_process"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<()> {
        // Send to channel (no receivers is fine for publish-only scenarios).
        match self.sender.send(Arc::new(event.clone())) {
            Ok(receiver_count) => {
                debug!(
                    event_id = %event.event_id,
                    receivers = receiver_count,
                    "event broadcast in-process"
                );
            }
            Err(_) => {
                debug!(event_id = %event.event_id, "event broadcast (no receivers)");
            }
        }
        Ok(())
    }
}
