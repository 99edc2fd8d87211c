//! Notification fan-out for balance-changed events.
//!
//! Delivery is at-least-once and best-effort: failures are logged, never
//! propagated to the credit caller. A bounded recent-events cache keyed by
//! `event_id` suppresses redundant deliveries when an idempotent credit
//! retry publishes the same event again. Channels are independent; one
//! failing channel never blocks the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::model::NotificationEvent;
use crate::storage::StorageError;

mod channel;
mod marker;
mod webhook;

pub use channel::InProcessChannel;
pub use marker::MarkerChannel;
pub use webhook::WebhookChannel;

/// Result type for channel delivery.
pub type Result<T> = std::result::Result<T, FanoutError>;

/// Errors a delivery channel can report.
#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// One delivery channel for balance-changed events.
///
/// Implementations:
/// - `InProcessChannel`: tokio broadcast for same-process observers
/// - `MarkerChannel`: persisted last-event marker for late joiners
/// - `WebhookChannel`: JSON POST broadcast for multi-instance deployments
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Deliver one event. Within a channel, calls for the same card arrive
    /// in `publish` order.
    async fn deliver(&self, event: &NotificationEvent) -> Result<()>;
}

/// Bounded TTL cache of recently published event ids.
///
/// Cleanup runs every `cleanup_interval` checks; when the cache is full
/// after a sweep, the oldest entry is evicted so memory stays bounded even
/// for high-cardinality event id spaces.
struct DeliveryDedup {
    seen: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
    capacity: usize,
    ops_since_cleanup: AtomicU32,
    cleanup_interval: u32,
}

impl DeliveryDedup {
    fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
            ops_since_cleanup: AtomicU32::new(0),
            cleanup_interval: 1000,
        }
    }

    /// Returns true if this is a NEW event id (not seen within the TTL).
    fn check(&self, id: &str) -> bool {
        let now = Instant::now();

        let ops = self.ops_since_cleanup.fetch_add(1, Ordering::Relaxed);
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if ops >= self.cleanup_interval {
            self.ops_since_cleanup.store(0, Ordering::Relaxed);
            seen.retain(|_, last| now.duration_since(*last) < self.ttl);
        }

        if let Some(last) = seen.get(id) {
            if now.duration_since(*last) < self.ttl {
                return false;
            }
        }

        if seen.len() >= self.capacity {
            seen.retain(|_, last| now.duration_since(*last) < self.ttl);
            if seen.len() >= self.capacity {
                if let Some(oldest) = seen
                    .iter()
                    .min_by_key(|(_, last)| **last)
                    .map(|(k, _)| k.clone())
                {
                    seen.remove(&oldest);
                }
            }
        }

        seen.insert(id.to_string(), now);
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        match self.seen.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

/// Publishes balance-changed events through all configured channels.
pub struct NotificationFanout {
    channels: Vec<Arc<dyn NotificationChannel>>,
    dedup: DeliveryDedup,
}

impl NotificationFanout {
    pub fn new(dedup_ttl: Duration, dedup_capacity: usize) -> Self {
        Self {
            channels: Vec::new(),
            dedup: DeliveryDedup::new(dedup_ttl, dedup_capacity),
        }
    }

    /// Register a delivery channel. Channels are attempted in registration
    /// order on every publish.
    pub fn with_channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Fire-and-forget publication.
    ///
    /// Duplicates (same `event_id` within the retention window) are dropped
    /// before any channel sees them. Per-channel failures are logged and
    /// isolated.
    #[tracing::instrument(name = "fanout.publish", skip_all, fields(event_id = %event.event_id))]
    pub async fn publish(&self, event: &NotificationEvent) {
        if !self.dedup.check(&event.event_id) {
            debug!(
                event_id = %event.event_id,
                card_id = %event.card_id,
                "duplicate notification suppressed"
            );
            return;
        }

        for channel in &self.channels {
            if let Err(e) = channel.deliver(event).await {
                warn!(
                    channel = channel.name(),
                    event_id = %event.event_id,
                    card_id = %event.card_id,
                    error = %e,
                    "notification delivery failed"
                );
            } else {
                debug!(
                    channel = channel.name(),
                    event_id = %event.event_id,
                    "notification delivered"
                );
            }
        }
    }
}
