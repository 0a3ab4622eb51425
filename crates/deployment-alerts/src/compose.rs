//! Turns fresh findings into the messages that still need to be announced.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};

use crate::discord::{Embed, EmbedField, MessagePayload};
use crate::findings::{DeploymentFindings, IssueLevel};
use crate::format::{self, IndexingRow};
use crate::reconstruct::{AlertKey, ChannelAlertState, SuppressionMode};

/// Embed colors, rotated per protocol within a cycle.
pub const PALETTE: [u32; 6] = [
    0x00e7_4c3c, // red
    0x00e6_7e22, // orange
    0x00f1_c40f, // yellow
    0x009b_59b6, // purple
    0x0034_98db, // blue
    0x001a_bc9c, // teal
];

/// Inputs that are fixed for one compose call.
#[derive(Debug, Clone)]
pub struct ComposeOptions {
    pub mode: SuppressionMode,
    pub now: DateTime<Utc>,
    /// How long a posted indexing failure suppresses an identical one.
    pub indexing_window: Duration,
    pub color: u32,
}

impl ComposeOptions {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            mode: SuppressionMode::default(),
            now,
            indexing_window: Duration::hours(24),
            color: PALETTE[0],
        }
    }
}

/// Output of composing one protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposedAlerts {
    /// Messages to post into the protocol thread.
    pub messages: Vec<MessagePayload>,
    /// Current indexing failures of production deployments, unsuppressed, for the
    /// aggregate summary.
    pub aggregate_rows: Vec<IndexingRow>,
}

/// Compose the novel alerts of one protocol against its reconstructed state.
///
/// Ordering follows the input: deployments in the given order, issue types in
/// validator insertion order. Nothing is sorted.
pub fn compose(
    protocol: &str,
    deployments: &[DeploymentFindings],
    state: &ChannelAlertState,
    options: &ComposeOptions,
) -> ComposedAlerts {
    let mut composed = ComposedAlerts::default();

    let mut indexing_rows: Vec<IndexingRow> = Vec::new();
    let mut first_error_message: Option<String> = None;
    for deployment in deployments {
        let Some(block) = deployment.indexing_error else {
            continue;
        };
        if deployment.is_governance() {
            continue;
        }

        let row = IndexingRow {
            deployment: deployment.deployment.clone(),
            chain: deployment.chain_label(),
            block,
        };
        if deployment.prod {
            composed.aggregate_rows.push(row.clone());
        }
        if state.is_indexing_alerted(&row.chain, block, options.now, options.indexing_window) {
            continue;
        }
        if first_error_message.is_none() {
            first_error_message = deployment
                .indexing_error_message
                .clone()
                .filter(|m| !m.trim().is_empty());
        }
        indexing_rows.push(row);
    }

    for chunk in format::chunk_indexing_rows(&indexing_rows) {
        let mut embed = format::indexing_embed(
            format::indexing_title(protocol),
            &chunk,
            first_error_message.clone(),
        );
        embed.color = Some(options.color);
        composed.messages.push(MessagePayload::embed(embed));
    }

    let mut seen: HashSet<AlertKey> = HashSet::new();
    for deployment in deployments {
        for level in [IssueLevel::Protocol, IssueLevel::Pool] {
            let errors = match level {
                IssueLevel::Protocol => &deployment.protocol_errors,
                IssueLevel::Pool => &deployment.pool_errors,
            };
            let chain = deployment.chain_label();

            let mut rows: Vec<EmbedField> = Vec::new();
            for (issue_type, values) in errors {
                if values.is_empty() {
                    continue;
                }
                let key = AlertKey::new(chain.clone(), level, issue_type.clone());
                let rendered = format::render_values(values);
                if state.is_issue_alerted(&key, &rendered, options.mode) || !seen.insert(key) {
                    continue;
                }
                rows.push(EmbedField::new(issue_type.clone(), rendered));
            }

            composed.messages.extend(
                level_embeds(deployment, level, &chain, rows, options.color)
                    .into_iter()
                    .map(MessagePayload::embed),
            );
        }
    }

    composed
}

/// Pack issue rows into as many embeds as the platform limits require.
fn level_embeds(
    deployment: &DeploymentFindings,
    level: IssueLevel,
    chain: &str,
    rows: Vec<EmbedField>,
    color: u32,
) -> Vec<Embed> {
    let blank = || Embed {
        title: format::level_title(level, chain),
        url: Some(deployment.url.clone()).filter(|u| !u.is_empty()),
        color: Some(color),
        fields: vec![
            EmbedField::new(format::COLUMN_DEPLOYMENT, deployment.deployment.clone()),
            EmbedField::new(format::COLUMN_CHAIN, chain),
        ],
        footer: Some(format::format_footer()),
        ..Embed::default()
    };

    let mut embeds: Vec<Embed> = Vec::new();
    let mut current = blank();
    for row in rows {
        let row_len = row.name.chars().count() + row.value.chars().count();
        let full = current.fields.len() >= format::MAX_EMBED_FIELDS
            || current.text_len() + row_len > format::MAX_EMBED_CHARS;
        if full && current.fields.len() > format::HEADER_ROWS {
            embeds.push(std::mem::replace(&mut current, blank()));
        }
        current.fields.push(row);
    }
    embeds.push(current);

    embeds
        .into_iter()
        .filter(|e| e.fields.len() >= format::MIN_EMBED_ROWS)
        .collect()
}
