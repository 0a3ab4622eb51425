//! Engine configuration.

use std::env;

use crate::discord::client::DEFAULT_API_BASE;
use crate::dispatch::DispatchConfig;
use crate::history::PaginationConfig;
use crate::reconstruct::SuppressionMode;

/// Retention applied by `prune` when `ALERT_RETENTION_DAYS` is unset.
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

/// Alert engine configuration.
#[derive(Clone)]
pub struct EngineConfig {
    /// Discord bot token.
    pub discord_token: Option<String>,
    /// Root alert channel; one thread per protocol hangs off it.
    pub root_channel_id: Option<String>,
    /// Aggregate summary channel for production-tier deployments.
    pub prod_channel_id: Option<String>,
    pub api_base: String,
    /// Incoming webhook that receives novel aggregate rows.
    pub webhook_url: Option<String>,
    /// Channel behind the webhook, used to skip text it already carries.
    pub webhook_channel_id: Option<String>,
    pub github_token: Option<String>,
    /// Repository (`owner/name`) that receives alert issues.
    pub issues_repo: Option<String>,
    pub retention_days: i64,
    pub suppression_mode: SuppressionMode,
    pub dispatch: DispatchConfig,
    pub aggregate_dispatch: DispatchConfig,
    pub pagination: PaginationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }
}

impl EngineConfig {
    /// Build from a key lookup; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Self {
            discord_token: get("DISCORD_BOT_TOKEN"),
            root_channel_id: get("DISCORD_CHANNEL_ID"),
            prod_channel_id: get("DISCORD_PROD_CHANNEL_ID"),
            api_base: get("DISCORD_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            webhook_url: get("ALERT_WEBHOOK_URL"),
            webhook_channel_id: get("ALERT_WEBHOOK_CHANNEL_ID"),
            github_token: get("GITHUB_TOKEN"),
            issues_repo: get("ALERT_ISSUES_REPO"),
            retention_days: get("ALERT_RETENTION_DAYS")
                .and_then(|s| s.parse().ok())
                .filter(|days: &i64| *days > 0)
                .unwrap_or(DEFAULT_RETENTION_DAYS),
            suppression_mode: get("ALERT_SUPPRESSION_MODE")
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            dispatch: DispatchConfig::default(),
            aggregate_dispatch: DispatchConfig::aggregate(),
            pagination: PaginationConfig::default(),
        }
    }
}
