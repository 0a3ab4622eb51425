//! Rebuilds "what has already been alerted" from channel history.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::discord::ChannelMessage;
use crate::findings::IssueLevel;
use crate::format;

/// How level findings are matched against earlier alerts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SuppressionMode {
    /// Suppress once the issue type was flagged for the chain, whatever its value.
    #[default]
    IssueType,
    /// Suppress only while the rendered value is unchanged.
    IssueValue,
}

impl FromStr for SuppressionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "issue-type" | "type" => Ok(Self::IssueType),
            "issue-value" | "value" => Ok(Self::IssueValue),
            other => Err(format!("unknown suppression mode: {other}")),
        }
    }
}

/// Identity of a level finding for suppression purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlertKey {
    pub chain: String,
    pub level: IssueLevel,
    pub issue_type: String,
}

impl AlertKey {
    pub fn new(chain: impl Into<String>, level: IssueLevel, issue_type: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            level,
            issue_type: issue_type.into(),
        }
    }
}

/// An indexing failure that was already posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexingRecord {
    pub chain: String,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
}

/// Alert state of one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelAlertState {
    /// Already-alerted level issues, with the value text of the newest post.
    pub alerted: BTreeMap<AlertKey, String>,
    pub indexing_failures: Vec<IndexingRecord>,
}

impl ChannelAlertState {
    pub fn is_issue_alerted(&self, key: &AlertKey, rendered_value: &str, mode: SuppressionMode) -> bool {
        match (self.alerted.get(key), mode) {
            (None, _) => false,
            (Some(_), SuppressionMode::IssueType) => true,
            (Some(previous), SuppressionMode::IssueValue) => previous == rendered_value,
        }
    }

    /// Whether the same failure was posted within `window` before `now`.
    pub fn is_indexing_alerted(
        &self,
        chain: &str,
        block_number: u64,
        now: DateTime<Utc>,
        window: Duration,
    ) -> bool {
        self.indexing_failures.iter().any(|record| {
            record.chain == chain
                && record.block_number == block_number
                && now.signed_duration_since(record.timestamp) < window
        })
    }
}

/// Per-channel alert state for one cycle. Rebuilt from scratch every cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertIndex {
    channels: HashMap<String, ChannelAlertState>,
}

impl AlertIndex {
    pub fn insert(&mut self, channel_id: impl Into<String>, state: ChannelAlertState) {
        self.channels.insert(channel_id.into(), state);
    }

    pub fn get(&self, channel_id: &str) -> Option<&ChannelAlertState> {
        self.channels.get(channel_id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Parse previously delivered alerts of a channel.
///
/// `messages` are newest first, as returned by the history paginator. Embeds that
/// do not follow the render grammar contribute nothing, so unreadable history
/// leads to re-alerting, never to silent suppression.
pub fn reconstruct(channel_id: &str, messages: &[ChannelMessage]) -> ChannelAlertState {
    let mut state = ChannelAlertState::default();

    for message in messages {
        for embed in message.embeds.iter().filter(|e| format::is_supported(e)) {
            if let Some((level, chain)) = format::parse_level_title(&embed.title) {
                for (issue_type, value) in format::issue_rows(embed) {
                    state
                        .alerted
                        .entry(AlertKey::new(chain.clone(), level, issue_type))
                        .or_insert_with(|| value.to_string());
                }
            } else if format::is_indexing_title(&embed.title) {
                state.indexing_failures.extend(
                    format::parse_indexing_rows(embed)
                        .into_iter()
                        .filter_map(|row| {
                            Some(IndexingRecord {
                                block_number: row.block_number()?,
                                chain: row.chain,
                                timestamp: message.timestamp,
                            })
                        }),
                );
            }
        }
    }

    debug!(
        channel_id = %channel_id,
        messages = messages.len(),
        alerted = state.alerted.len(),
        indexing_failures = state.indexing_failures.len(),
        "Reconstructed alert state"
    );
    state
}
