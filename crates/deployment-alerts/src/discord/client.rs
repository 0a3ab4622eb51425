//! Discord REST client.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{ChannelMessage, ChatApi, MessagePayload};
use crate::error::{ChatError, ARCHIVED_THREAD_CODE};

/// Default Discord API base URL.
pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// Fallback wait when a 429 carries no usable `retry-after` header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Threads auto-archive after a week of inactivity.
const THREAD_AUTO_ARCHIVE_MINUTES: u32 = 10_080;

/// Discord bot client.
#[derive(Debug, Clone)]
pub struct DiscordClient {
    client: reqwest::Client,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct ThreadChannel {
    id: String,
}

impl DiscordClient {
    /// Create a client authenticated with a bot token.
    pub fn new(token: &str, api_base: &str) -> Result<Self, ChatError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ChatError::NotConfigured("DISCORD_BOT_TOKEN".to_string()));
        }

        let mut auth = HeaderValue::from_str(&format!("Bot {token}"))
            .map_err(|_| ChatError::NotConfigured("DISCORD_BOT_TOKEN is not a valid header".to_string()))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("deployment-alerts/", env!("CARGO_PKG_VERSION"))),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    fn messages_url(&self, channel_id: &str) -> String {
        format!("{}/channels/{channel_id}/messages", self.api_base)
    }

    /// Map a non-success response onto the error taxonomy.
    async fn check(
        channel_id: &str,
        response: Response,
        request_body: Option<String>,
    ) -> Result<Response, ChatError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<f64>().ok())
                .map_or(DEFAULT_RETRY_AFTER_SECS, |secs| secs.ceil().max(0.0) as u64);

            warn!(
                channel_id = %channel_id,
                retry_after_secs,
                "Rate limited by Discord"
            );

            return Err(ChatError::RateLimited {
                retry_after_secs,
                request_body,
            });
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() && error_code(&body) == Some(ARCHIVED_THREAD_CODE) {
            debug!(channel_id = %channel_id, "Target thread is archived");
            return Err(ChatError::ArchivedThread {
                channel_id: channel_id.to_string(),
            });
        }

        warn!(
            channel_id = %channel_id,
            status = %status,
            body = %body,
            "Discord request failed"
        );

        Err(ChatError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

fn error_code(body: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("code").and_then(serde_json::Value::as_u64))
}

#[async_trait]
impl ChatApi for DiscordClient {
    async fn fetch_messages(
        &self,
        channel_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ChannelMessage>, ChatError> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(before) = before {
            query.push(("before", before.to_string()));
        }

        let response = self
            .client
            .get(self.messages_url(channel_id))
            .query(&query)
            .send()
            .await?;
        let response = Self::check(channel_id, response, None).await?;

        Ok(response.json().await?)
    }

    async fn post_message(
        &self,
        channel_id: &str,
        payload: &MessagePayload,
    ) -> Result<ChannelMessage, ChatError> {
        let body = serde_json::to_string(payload)?;

        let response = self
            .client
            .post(self.messages_url(channel_id))
            .header(CONTENT_TYPE, "application/json")
            .body(body.clone())
            .send()
            .await?;
        let response = Self::check(channel_id, response, Some(body)).await?;

        Ok(response.json().await?)
    }

    async fn bulk_delete(&self, channel_id: &str, message_ids: &[String]) -> Result<(), ChatError> {
        let response = self
            .client
            .post(format!("{}/bulk-delete", self.messages_url(channel_id)))
            .json(&json!({ "messages": message_ids }))
            .send()
            .await?;
        Self::check(channel_id, response, None).await?;
        Ok(())
    }

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<(), ChatError> {
        let response = self
            .client
            .delete(format!("{}/{message_id}", self.messages_url(channel_id)))
            .send()
            .await?;
        Self::check(channel_id, response, None).await?;
        Ok(())
    }

    async fn start_thread(
        &self,
        channel_id: &str,
        message_id: &str,
        name: &str,
    ) -> Result<String, ChatError> {
        let response = self
            .client
            .post(format!("{}/{message_id}/threads", self.messages_url(channel_id)))
            .json(&json!({
                "name": name,
                "auto_archive_duration": THREAD_AUTO_ARCHIVE_MINUTES,
            }))
            .send()
            .await?;
        let response = Self::check(channel_id, response, None).await?;
        let thread: ThreadChannel = response.json().await?;
        Ok(thread.id)
    }
}
