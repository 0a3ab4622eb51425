//! Error types for the chat platform client.

use thiserror::Error;

/// Discord JSON error code returned when the target thread is archived.
pub const ARCHIVED_THREAD_CODE: u64 = 50083;

/// Errors that can occur when talking to the chat platform.
#[derive(Debug, Error)]
pub enum ChatError {
    /// HTTP request failed before a response was received
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Rate limited by the platform (HTTP 429).
    ///
    /// `request_body` is the serialized body of the rejected request, kept so the
    /// caller can requeue the exact payload.
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        retry_after_secs: u64,
        request_body: Option<String>,
    },

    /// The target thread is archived and rejects writes until it sees activity
    #[error("Thread {channel_id} is archived")]
    ArchivedThread { channel_id: String },

    /// Any other non-success response
    #[error("Discord returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Client is missing required configuration
    #[error("Chat client not configured: {0}")]
    NotConfigured(String),
}

impl ChatError {
    /// Whether this error is a throttle signal.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Whether this error means the target thread must be unarchived first.
    pub fn is_archived_thread(&self) -> bool {
        matches!(self, Self::ArchivedThread { .. })
    }
}
