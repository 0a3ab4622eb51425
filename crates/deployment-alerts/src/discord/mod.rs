//! Chat platform model and client.
//!
//! The chat channel is the system of record for the alerting engine: everything
//! the engine knows about prior alerts is read back from here. [`ChatApi`] is the
//! seam every engine component talks through; [`DiscordClient`] implements it over
//! the Discord REST API.

pub mod client;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChatError;

pub use client::DiscordClient;

/// Maximum number of messages per history page and per bulk delete.
pub const MAX_PAGE_SIZE: usize = 100;

/// Bulk delete rejects the whole request if any message is older than this.
pub const BULK_DELETE_MAX_AGE_DAYS: i64 = 14;

/// A message as stored by the chat platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub id: String,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub embeds: Vec<Embed>,
    pub timestamp: DateTime<Utc>,
    /// Thread started from this message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<ThreadRef>,
}

impl ChannelMessage {
    /// Text used for duplicate detection, see [`digest`].
    pub fn digest(&self) -> String {
        digest(&self.content, &self.embeds)
    }
}

/// Reference to a thread channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRef {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Structured sub-content of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Embed {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
}

impl Embed {
    /// Find a field by exact name.
    pub fn field(&self, name: &str) -> Option<&EmbedField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Approximate serialized size as counted by the platform's embed limit.
    pub fn text_len(&self) -> usize {
        self.title.chars().count()
            + self.description.as_deref().map_or(0, |d| d.chars().count())
            + self
                .footer
                .as_ref()
                .map_or(0, |f| f.text.chars().count())
            + self
                .fields
                .iter()
                .map(|f| f.name.chars().count() + f.value.chars().count())
                .sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

impl EmbedField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            inline: false,
        }
    }

    pub fn inline(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            inline: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedFooter {
    pub text: String,
}

/// Body of an outbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

impl MessagePayload {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            embeds: Vec::new(),
        }
    }

    pub fn embed(embed: Embed) -> Self {
        Self {
            content: String::new(),
            embeds: vec![embed],
        }
    }

    /// Text used for duplicate detection, see [`digest`].
    pub fn digest(&self) -> String {
        digest(&self.content, &self.embeds)
    }
}

/// Flatten a message into comparable text.
///
/// Content first, then for each embed its title, description and every field as
/// `name: value`, all joined by newlines. Outbound payloads and fetched messages
/// produce the same digest for the same rendered alert.
pub fn digest(content: &str, embeds: &[Embed]) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !content.is_empty() {
        parts.push(content.to_string());
    }
    for embed in embeds {
        if !embed.title.is_empty() {
            parts.push(embed.title.clone());
        }
        if let Some(description) = embed.description.as_deref().filter(|d| !d.is_empty()) {
            parts.push(description.to_string());
        }
        for field in &embed.fields {
            parts.push(format!("{}: {}", field.name, field.value));
        }
    }
    parts.join("\n")
}

/// Operations the engine needs from the chat platform.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Fetch one page of messages, newest first, strictly older than `before`.
    async fn fetch_messages(
        &self,
        channel_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ChannelMessage>, ChatError>;

    /// Post a message and return it as stored.
    async fn post_message(
        &self,
        channel_id: &str,
        payload: &MessagePayload,
    ) -> Result<ChannelMessage, ChatError>;

    /// Delete between 2 and 100 messages in one call.
    async fn bulk_delete(&self, channel_id: &str, message_ids: &[String]) -> Result<(), ChatError>;

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<(), ChatError>;

    /// Start a thread from an existing message and return the thread channel id.
    async fn start_thread(
        &self,
        channel_id: &str,
        message_id: &str,
        name: &str,
    ) -> Result<String, ChatError>;
}
