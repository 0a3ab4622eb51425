//! External webhook collaborator.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use crate::history::HistoryPaginator;

/// Platform limit on plain message content.
pub const MAX_CONTENT_CHARS: usize = 2000;

/// Characters of the text compared against the webhook channel history.
const DEDUP_PREFIX_CHARS: usize = 80;

/// Receives a flat text blob per novel alert.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Forward `text`. Returns `false` when the sink judged it a duplicate.
    async fn forward(&self, text: &str) -> Result<bool>;
}

/// Posts `{"content": ...}` to an incoming webhook URL.
///
/// When the channel behind the webhook is known, its history is checked first and
/// text whose prefix already appears there is not sent again.
pub struct WebhookForwarder {
    client: reqwest::Client,
    url: String,
    history: Option<(HistoryPaginator, String)>,
}

impl WebhookForwarder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            history: None,
        }
    }

    /// Deduplicate against the history of `channel_id`.
    pub fn with_history(mut self, paginator: HistoryPaginator, channel_id: impl Into<String>) -> Self {
        self.history = Some((paginator, channel_id.into()));
        self
    }

    async fn already_posted(&self, text: &str) -> bool {
        let Some((paginator, channel_id)) = &self.history else {
            return false;
        };
        let prefix: String = text.chars().take(DEDUP_PREFIX_CHARS).collect();
        paginator
            .fetch_all(channel_id)
            .await
            .iter()
            .any(|m| m.digest().contains(&prefix))
    }
}

#[async_trait]
impl AlertSink for WebhookForwarder {
    async fn forward(&self, text: &str) -> Result<bool> {
        let content: String = text.chars().take(MAX_CONTENT_CHARS).collect();
        if self.already_posted(&content).await {
            debug!("Webhook alert already posted, skipping");
            return Ok(false);
        }

        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "content": content }))
            .send()
            .await
            .context("Failed to send webhook request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Webhook error: {status} - {body}"));
        }

        info!(chars = content.chars().count(), "Forwarded alert to webhook");
        Ok(true)
    }
}
