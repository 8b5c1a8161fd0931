//! Outbound status notifications
//!
//! One webhook POST at the start of a run and one with the summary. A
//! failed post is logged by the caller and never alters the outcome.

use async_trait::async_trait;
use serde::Serialize;

use crate::{Error, Result};

/// Outbound notification channel
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a status message
    async fn post(&self, text: &str) -> Result<()>;
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
}

/// [`Notifier`] posting to a Slack-compatible incoming webhook
pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    /// Create a notifier for the given webhook URL
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn post(&self, text: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&WebhookPayload { text })
            .send()
            .await
            .map_err(|e| Error::notifier(format!("webhook POST failed: {e}")))?;

        response
            .error_for_status()
            .map_err(|e| Error::notifier(format!("webhook rejected the post: {e}")))?;
        Ok(())
    }
}
