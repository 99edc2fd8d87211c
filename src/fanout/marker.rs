//! Persisted last-event marker channel.
//!
//! Writes the most recent event for each (customer, program) through the
//! store so late-joining observers can poll `last_notification` instead of
//! depending on having been subscribed at publish time.

use std::sync::Arc;

use async_trait::async_trait;

use super::{NotificationChannel, Result};
use crate::model::NotificationEvent;
use crate::storage::LoyaltyStore;

/// Notification channel that upserts a per-key marker row.
pub struct MarkerChannel {
    store: Arc<dyn LoyaltyStore>,
}

impl MarkerChannel {
    pub fn new(store: Arc<dyn LoyaltyStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl NotificationChannel for MarkerChannel {
    fn name(&self) -> &'static str {
        "marker"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<()> {
        self.store.put_notification_marker(event).await?;
        Ok(())
    }
}
