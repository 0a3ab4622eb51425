//! Batched, statically paced delivery with throttle recovery.
//!
//! The platform's rate limit is undocumented, so pacing is blind: a fixed number
//! of concurrent sends per batch and a fixed pause between batches. Throttled
//! sends come back as [`RetryUnit`]s for a second pass that first checks fresh
//! history, since a 429 does not guarantee the message was rejected.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::delay::Delay;
use crate::discord::{ChatApi, MessagePayload};
use crate::error::ChatError;
use crate::history::HistoryPaginator;

/// Dispatcher pacing.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Concurrent sends per batch.
    pub batch_size: usize,
    /// Pause between consecutive batches.
    pub batch_delay: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            batch_delay: Duration::from_secs(5),
        }
    }
}

impl DispatchConfig {
    /// Faster pacing used for the aggregate thread.
    pub fn aggregate() -> Self {
        Self {
            batch_delay: Duration::from_millis(1500),
            ..Self::default()
        }
    }
}

/// A message bound for a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub channel_id: String,
    pub protocol: String,
    pub payload: MessagePayload,
}

/// A message deferred after a throttle response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryUnit {
    pub payload: MessagePayload,
    pub target_channel_id: String,
    pub protocol: String,
}

impl From<RetryUnit> for OutboundMessage {
    fn from(unit: RetryUnit) -> Self {
        Self {
            channel_id: unit.target_channel_id,
            protocol: unit.protocol,
            payload: unit.payload,
        }
    }
}

/// Result of one dispatch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub delivered: usize,
    /// Sends that failed for reasons other than throttling.
    pub dropped: usize,
    pub batches: usize,
    pub retry: Vec<RetryUnit>,
}

/// Result of the retry pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryOutcome {
    /// Units found in fresh history and not resent.
    pub already_delivered: usize,
    pub dispatch: DispatchOutcome,
}

pub struct Dispatcher {
    api: Arc<dyn ChatApi>,
    delay: Arc<dyn Delay>,
    paginator: HistoryPaginator,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        api: Arc<dyn ChatApi>,
        delay: Arc<dyn Delay>,
        paginator: HistoryPaginator,
        config: DispatchConfig,
    ) -> Self {
        let config = DispatchConfig {
            batch_size: config.batch_size.max(1),
            ..config
        };
        Self {
            api,
            delay,
            paginator,
            config,
        }
    }

    /// Send `messages` in paced batches and return what must be retried.
    ///
    /// Batch N+1 starts only after batch N settled and the pause elapsed. No pause
    /// follows the final batch.
    pub async fn dispatch(&self, messages: Vec<OutboundMessage>) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        for (index, batch) in messages.chunks(self.config.batch_size).enumerate() {
            if index > 0 {
                self.delay.sleep(self.config.batch_delay).await;
            }
            outcome.batches += 1;

            let results = join_all(
                batch
                    .iter()
                    .map(|m| self.api.post_message(&m.channel_id, &m.payload)),
            )
            .await;

            for (message, result) in batch.iter().zip(results) {
                match result {
                    Ok(_) => outcome.delivered += 1,
                    Err(ChatError::RateLimited { request_body, .. }) => {
                        outcome.retry.push(recover(message, request_body.as_deref()));
                    }
                    Err(e) => {
                        error!(
                            channel_id = %message.channel_id,
                            protocol = %message.protocol,
                            error = %e,
                            "Failed to deliver alert, dropping until next cycle"
                        );
                        outcome.dropped += 1;
                    }
                }
            }
        }

        debug!(
            delivered = outcome.delivered,
            retry = outcome.retry.len(),
            dropped = outcome.dropped,
            batches = outcome.batches,
            "Dispatch pass finished"
        );
        outcome
    }

    /// Resend throttled units that fresh history does not already contain.
    pub async fn resend(&self, units: Vec<RetryUnit>) -> RetryOutcome {
        let mut outcome = RetryOutcome::default();
        if units.is_empty() {
            return outcome;
        }

        let mut histories: HashMap<String, HashSet<String>> = HashMap::new();
        for unit in &units {
            if !histories.contains_key(&unit.target_channel_id) {
                let digests = self
                    .paginator
                    .fetch_all(&unit.target_channel_id)
                    .await
                    .iter()
                    .map(|m| m.digest())
                    .collect();
                histories.insert(unit.target_channel_id.clone(), digests);
            }
        }

        let mut pending: Vec<OutboundMessage> = Vec::new();
        for unit in units {
            // Whole digest: titles and header rows repeat across alerts for the
            // same deployment, only the issue rows tell two alerts apart.
            let digest = unit.payload.digest();
            let delivered = histories
                .get(&unit.target_channel_id)
                .is_some_and(|digests| digests.contains(&digest));

            if delivered {
                debug!(
                    channel_id = %unit.target_channel_id,
                    protocol = %unit.protocol,
                    "Throttled alert already present in history, not resending"
                );
                outcome.already_delivered += 1;
            } else {
                pending.push(unit.into());
            }
        }

        if !pending.is_empty() {
            info!(count = pending.len(), "Resending throttled alerts");
            outcome.dispatch = self.dispatch(pending).await;
        }
        if !outcome.dispatch.retry.is_empty() {
            warn!(
                count = outcome.dispatch.retry.len(),
                "Alerts throttled twice, dropping until next cycle"
            );
        }
        outcome
    }
}

/// Rebuild the retry unit from the rejected request body, falling back to the
/// payload that was handed in.
fn recover(message: &OutboundMessage, request_body: Option<&str>) -> RetryUnit {
    let payload = request_body
        .and_then(|body| serde_json::from_str::<MessagePayload>(body).ok())
        .unwrap_or_else(|| message.payload.clone());

    RetryUnit {
        payload,
        target_channel_id: message.channel_id.clone(),
        protocol: message.protocol.clone(),
    }
}
