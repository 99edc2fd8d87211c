//! Webhook broadcast channel for multi-instance deployments.
//!
//! POSTs the event as JSON to each configured peer endpoint. Endpoints are
//! independent: every one is attempted, and the channel reports failure
//! only with the per-endpoint detail collected along the way.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{FanoutError, NotificationChannel, Result};
use crate::model::NotificationEvent;

/// Notification channel that broadcasts events over HTTP.
pub struct WebhookChannel {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl WebhookChannel {
    pub fn new(endpoints: Vec<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoints })
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<()> {
        let mut failures = Vec::new();

        for endpoint in &self.endpoints {
            let result = self.client.post(endpoint).json(event).send().await;
            match result {
                Ok(response) if response.status().is_success() => {
                    debug!(
                        endpoint = %endpoint,
                        event_id = %event.event_id,
                        "webhook delivered"
                    );
                }
                Ok(response) => {
                    failures.push(format!("{endpoint}: status {}", response.status()));
                }
                Err(e) => {
                    failures.push(format!("{endpoint}: {e}"));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(FanoutError::Delivery(failures.join("; ")))
        }
    }
}
