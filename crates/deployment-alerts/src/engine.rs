//! One alert cycle from findings to delivered messages.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::aggregate::{AggregateBuffer, AggregateReconciler, FlushReport};
use crate::compose::{compose, ComposeOptions, PALETTE};
use crate::config::EngineConfig;
use crate::delay::Delay;
use crate::discord::ChatApi;
use crate::dispatch::{Dispatcher, OutboundMessage};
use crate::error::ChatError;
use crate::findings::DeploymentFindings;
use crate::history::HistoryPaginator;
use crate::issues::IssueTracker;
use crate::reconstruct::{reconstruct, AlertIndex, SuppressionMode};
use crate::threads::{PruneReport, ThreadManager};
use crate::webhook::AlertSink;

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub protocols: usize,
    /// Protocols skipped because their thread could not be resolved.
    pub skipped_protocols: usize,
    pub findings: usize,
    pub composed: usize,
    pub delivered: usize,
    /// Messages throttled in the first pass.
    pub retried: usize,
    /// Throttled messages found in fresh history and not resent.
    pub already_delivered: usize,
    pub dropped: usize,
    pub aggregate: FlushReport,
}

/// Alert engine.
///
/// Holds the state that lives across the steps of a cycle: the color rotation and
/// the aggregate buffer. Both are reset at the end of every cycle. The thread
/// mapping is kept for the lifetime of the engine.
pub struct AlertEngine {
    root_channel_id: String,
    prod_channel_id: Option<String>,
    mode: SuppressionMode,
    retention: Duration,
    paginator: HistoryPaginator,
    dispatcher: Dispatcher,
    threads: ThreadManager,
    aggregate: AggregateReconciler,
    threads_loaded: bool,
    color_index: usize,
    buffer: AggregateBuffer,
}

impl AlertEngine {
    pub fn new(
        api: Arc<dyn ChatApi>,
        delay: Arc<dyn Delay>,
        config: &EngineConfig,
    ) -> Result<Self, ChatError> {
        let root_channel_id = config
            .root_channel_id
            .clone()
            .ok_or_else(|| ChatError::NotConfigured("DISCORD_CHANNEL_ID".to_string()))?;

        let paginator = HistoryPaginator::new(api.clone(), delay.clone(), config.pagination.clone());
        let dispatcher = Dispatcher::new(
            api.clone(),
            delay.clone(),
            paginator.clone(),
            config.dispatch.clone(),
        );
        let aggregate = AggregateReconciler::new(
            paginator.clone(),
            Dispatcher::new(
                api.clone(),
                delay,
                paginator.clone(),
                config.aggregate_dispatch.clone(),
            ),
        );

        Ok(Self {
            root_channel_id,
            prod_channel_id: config.prod_channel_id.clone(),
            mode: config.suppression_mode,
            retention: Duration::days(config.retention_days),
            threads: ThreadManager::new(api, paginator.clone()),
            paginator,
            dispatcher,
            aggregate,
            threads_loaded: false,
            color_index: 0,
            buffer: AggregateBuffer::default(),
        })
    }

    pub fn with_issue_tracker(mut self, issues: Arc<dyn IssueTracker>) -> Self {
        self.aggregate = self.aggregate.with_issue_tracker(issues);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.aggregate = self.aggregate.with_sink(sink);
        self
    }

    /// Run one full cycle over the current findings.
    ///
    /// Never fails: every error is logged and degrades to skipping the affected
    /// protocol or message. Whatever was skipped shows up again next cycle.
    pub async fn run_cycle(
        &mut self,
        deployments: &[DeploymentFindings],
        now: DateTime<Utc>,
    ) -> CycleReport {
        let mut report = CycleReport::default();
        self.load_threads().await;

        let mut by_protocol: IndexMap<&str, Vec<DeploymentFindings>> = IndexMap::new();
        for deployment in deployments {
            by_protocol
                .entry(deployment.protocol.as_str())
                .or_default()
                .push(deployment.clone());
        }
        report.protocols = by_protocol.len();

        let mut index = AlertIndex::default();
        let mut outbound: Vec<OutboundMessage> = Vec::new();

        for (protocol, group) in &by_protocol {
            report.findings += group.iter().map(|d| d.findings().len()).sum::<usize>();

            let thread_id = match self.threads.ensure_thread(protocol, &self.root_channel_id).await {
                Ok(id) => id,
                Err(e) => {
                    warn!(protocol = %protocol, error = %e, "Skipping protocol, no thread");
                    report.skipped_protocols += 1;
                    continue;
                }
            };

            let history = self.paginator.fetch_all(&thread_id).await;
            index.insert(thread_id.clone(), reconstruct(&thread_id, &history));
            let Some(state) = index.get(&thread_id) else {
                continue;
            };

            let options = ComposeOptions {
                mode: self.mode,
                color: self.next_color(),
                ..ComposeOptions::new(now)
            };
            let composed = compose(protocol, group, state, &options);
            if self.prod_channel_id.is_some() {
                self.buffer.merge(protocol, composed.aggregate_rows);
            }

            debug!(
                protocol = %protocol,
                thread_id = %thread_id,
                messages = composed.messages.len(),
                "Composed alerts"
            );
            report.composed += composed.messages.len();

            outbound.extend(composed.messages.into_iter().map(|payload| OutboundMessage {
                channel_id: thread_id.clone(),
                protocol: (*protocol).to_string(),
                payload,
            }));
        }

        // One queue for the whole cycle so batch pacing spans protocols.
        let outcome = self.dispatcher.dispatch(outbound).await;
        report.delivered += outcome.delivered;
        report.dropped += outcome.dropped;

        report.retried = outcome.retry.len();
        let second = self.dispatcher.resend(outcome.retry).await;
        report.already_delivered = second.already_delivered;
        report.delivered += second.dispatch.delivered;
        report.dropped += second.dispatch.dropped + second.dispatch.retry.len();

        if let Some(prod) = self.prod_channel_id.clone() {
            report.aggregate = self.aggregate.flush(&mut self.buffer, &prod, now).await;
        }

        info!(
            protocols = report.protocols,
            channels = index.len(),
            composed = report.composed,
            delivered = report.delivered,
            retried = report.retried,
            dropped = report.dropped,
            "Alert cycle finished"
        );
        self.reset();
        report
    }

    /// Prune alerts older than the retention from the root channel and every
    /// protocol thread.
    pub async fn cleanup(&mut self, now: DateTime<Utc>) -> PruneReport {
        let report = self
            .threads
            .cleanup_root(&self.root_channel_id, now - self.retention)
            .await;
        self.threads_loaded = true;
        info!(
            channels = report.channels,
            deleted = report.deleted,
            failed = report.failed,
            "Retention cleanup finished"
        );
        report
    }

    /// Clear cycle-scoped state.
    pub fn reset(&mut self) {
        self.color_index = 0;
        self.buffer.clear();
    }

    fn next_color(&mut self) -> u32 {
        let color = PALETTE[self.color_index % PALETTE.len()];
        self.color_index += 1;
        color
    }

    async fn load_threads(&mut self) {
        if self.threads_loaded {
            return;
        }
        let root_messages = self.paginator.fetch_all(&self.root_channel_id).await;
        self.threads.load_from_history(&root_messages);
        self.threads_loaded = true;
    }
}
