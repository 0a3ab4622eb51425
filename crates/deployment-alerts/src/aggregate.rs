//! Rolling cross-deployment summary for production-tier indexing failures.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::discord::{ChannelMessage, Embed, MessagePayload};
use crate::dispatch::{Dispatcher, OutboundMessage};
use crate::format::{self, IndexingRow};
use crate::history::HistoryPaginator;
use crate::issues::{IssueOutcome, IssueReport, IssueTitle, IssueTracker};
use crate::webhook::AlertSink;

/// Issue type used for aggregate forwarding.
pub const INDEXING_ISSUE_TYPE: &str = "Indexing Error";

/// Chunks of one summary land within this many seconds of each other.
const SUMMARY_POSTING_SPAN_SECS: i64 = 60;

/// One protocol's current production indexing failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateEntry {
    pub protocol: String,
    pub rows: Vec<IndexingRow>,
}

/// Entries collected during a cycle, in protocol processing order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateBuffer {
    entries: IndexMap<String, Vec<IndexingRow>>,
}

impl AggregateBuffer {
    /// Add rows for `protocol`. Identical rows are kept once.
    pub fn merge(&mut self, protocol: &str, rows: Vec<IndexingRow>) {
        if rows.is_empty() {
            return;
        }
        let entry = self.entries.entry(protocol.to_string()).or_default();
        for row in rows {
            if !entry.contains(&row) {
                entry.push(row);
            }
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = AggregateEntry> + '_ {
        self.entries.iter().map(|(protocol, rows)| AggregateEntry {
            protocol: protocol.clone(),
            rows: rows.clone(),
        })
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Summaries posted, after the retry pass.
    pub posted: usize,
    /// Entries whose rows all match the latest summary.
    pub unchanged: usize,
    pub novel_rows: usize,
    pub issues_created: usize,
    pub forwarded: usize,
    pub retried: usize,
    pub dropped: usize,
}

pub struct AggregateReconciler {
    paginator: HistoryPaginator,
    dispatcher: Dispatcher,
    issues: Option<Arc<dyn IssueTracker>>,
    sink: Option<Arc<dyn AlertSink>>,
    window: Duration,
}

impl AggregateReconciler {
    /// `dispatcher` should use the aggregate pacing.
    pub fn new(paginator: HistoryPaginator, dispatcher: Dispatcher) -> Self {
        Self {
            paginator,
            dispatcher,
            issues: None,
            sink: None,
            window: Duration::hours(24),
        }
    }

    pub fn with_issue_tracker(mut self, issues: Arc<dyn IssueTracker>) -> Self {
        self.issues = Some(issues);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Post what changed since the latest summaries, then empty the buffer.
    ///
    /// An entry is diffed against the newest summary with the protocol's title
    /// posted within the window, row by row on the `(chain, block)` text. When any
    /// row is novel, the full current row set is posted as a new summary and the
    /// novel rows are forwarded to the collaborators.
    pub async fn flush(
        &self,
        buffer: &mut AggregateBuffer,
        channel_id: &str,
        now: DateTime<Utc>,
    ) -> FlushReport {
        let mut report = FlushReport::default();
        if buffer.is_empty() {
            return report;
        }

        let history = self.paginator.fetch_all(channel_id).await;
        let mut outbound: Vec<OutboundMessage> = Vec::new();

        for entry in buffer.entries() {
            let existing = latest_summary_rows(&history, &entry.protocol, now - self.window);
            let novel: Vec<IndexingRow> = entry
                .rows
                .iter()
                .filter(|row| !existing.contains(&(row.chain.clone(), row.block.to_string())))
                .cloned()
                .collect();

            if novel.is_empty() {
                debug!(protocol = %entry.protocol, "Aggregate summary unchanged");
                report.unchanged += 1;
                continue;
            }
            report.novel_rows += novel.len();

            for chunk in format::chunk_indexing_rows(&entry.rows) {
                outbound.push(OutboundMessage {
                    channel_id: channel_id.to_string(),
                    protocol: entry.protocol.clone(),
                    payload: MessagePayload::embed(format::indexing_embed(
                        entry.protocol.clone(),
                        &chunk,
                        None,
                    )),
                });
            }
            self.forward(&entry.protocol, &novel, &mut report).await;
        }

        let first = self.dispatcher.dispatch(outbound).await;
        report.retried = first.retry.len();
        let second = self.dispatcher.resend(first.retry).await;
        report.posted = first.delivered + second.dispatch.delivered;
        report.dropped = first.dropped + second.dispatch.dropped + second.dispatch.retry.len();

        info!(
            channel_id = %channel_id,
            protocols = buffer.len(),
            posted = report.posted,
            novel_rows = report.novel_rows,
            "Flushed aggregate summaries"
        );
        buffer.clear();
        report
    }

    async fn forward(&self, protocol: &str, novel: &[IndexingRow], report: &mut FlushReport) {
        let body = render_rows(protocol, novel);

        if let Some(issues) = &self.issues {
            let mut chains: Vec<String> = Vec::new();
            for row in novel {
                if !chains.contains(&row.chain) {
                    chains.push(row.chain.clone());
                }
            }
            let issue = IssueReport {
                title: IssueTitle {
                    protocol: protocol.to_string(),
                    issue_type: INDEXING_ISSUE_TYPE.to_string(),
                    chains,
                },
                body: body.clone(),
            };
            match issues.report(&issue).await {
                Ok(IssueOutcome::Created { .. }) => report.issues_created += 1,
                Ok(IssueOutcome::Duplicate) => {}
                Err(e) => warn!(protocol = %protocol, error = %e, "Failed to file alert issue"),
            }
        }

        if let Some(sink) = &self.sink {
            match sink.forward(&body).await {
                Ok(true) => report.forwarded += 1,
                Ok(false) => {}
                Err(e) => warn!(protocol = %protocol, error = %e, "Failed to forward alert to webhook"),
            }
        }
    }
}

/// `(chain, block text)` rows of the newest summary for `protocol` posted after
/// `since`. Empty when there is none.
///
/// A summary split into several messages is read back whole: every chunk posted
/// within [`SUMMARY_POSTING_SPAN_SECS`] of the newest one counts.
fn latest_summary_rows(
    history: &[ChannelMessage],
    protocol: &str,
    since: DateTime<Utc>,
) -> HashSet<(String, String)> {
    let is_summary = |e: &&Embed| e.title == protocol && format::is_supported(e);

    let summaries: Vec<(DateTime<Utc>, &Embed)> = history
        .iter()
        .filter(|m| m.timestamp >= since)
        .filter_map(|m| m.embeds.iter().find(is_summary).map(|e| (m.timestamp, e)))
        .collect();
    let Some(newest) = summaries.iter().map(|(at, _)| *at).max() else {
        return HashSet::new();
    };

    summaries
        .into_iter()
        .filter(|(at, _)| *at >= newest - Duration::seconds(SUMMARY_POSTING_SPAN_SECS))
        .flat_map(|(_, embed)| format::parse_indexing_rows(embed))
        .map(|row| (row.chain, row.block_text))
        .collect()
}

/// Flat text for collaborators: a header line, then one line per row.
fn render_rows(protocol: &str, rows: &[IndexingRow]) -> String {
    let mut lines = vec![format!("{} - {INDEXING_ISSUE_TYPE}", protocol.to_uppercase())];
    lines.extend(
        rows.iter()
            .map(|r| format!("{} | {} | failed at block {}", r.deployment, r.chain, r.block)),
    );
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::dispatch::DispatchConfig;
    use crate::history::PaginationConfig;
    use crate::testing::{embed_message, FakeChat, RecordingDelay};

    #[derive(Default)]
    struct RecordingTracker {
        reports: Mutex<Vec<IssueReport>>,
    }

    #[async_trait]
    impl IssueTracker for RecordingTracker {
        async fn report(&self, issue: &IssueReport) -> anyhow::Result<IssueOutcome> {
            self.reports.lock().unwrap().push(issue.clone());
            Ok(IssueOutcome::Created { number: 1 })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        texts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn forward(&self, text: &str) -> anyhow::Result<bool> {
            self.texts.lock().unwrap().push(text.to_string());
            Ok(true)
        }
    }

    fn row(deployment: &str, chain: &str, block: u64) -> IndexingRow {
        IndexingRow {
            deployment: deployment.to_string(),
            chain: chain.to_string(),
            block,
        }
    }

    struct Harness {
        chat: Arc<FakeChat>,
        delay: Arc<RecordingDelay>,
        tracker: Arc<RecordingTracker>,
        sink: Arc<RecordingSink>,
        reconciler: AggregateReconciler,
    }

    fn harness() -> Harness {
        let chat = Arc::new(FakeChat::new());
        let delay = Arc::new(RecordingDelay::default());
        let tracker = Arc::new(RecordingTracker::default());
        let sink = Arc::new(RecordingSink::default());
        let paginator = HistoryPaginator::new(chat.clone(), delay.clone(), PaginationConfig::default());
        let dispatcher = Dispatcher::new(
            chat.clone(),
            delay.clone(),
            paginator.clone(),
            DispatchConfig::aggregate(),
        );
        let reconciler = AggregateReconciler::new(paginator, dispatcher)
            .with_issue_tracker(tracker.clone())
            .with_sink(sink.clone());
        Harness {
            chat,
            delay,
            tracker,
            sink,
            reconciler,
        }
    }

    #[test]
    fn test_buffer_merges_per_protocol_in_order() {
        let mut buffer = AggregateBuffer::default();
        buffer.merge("uniswap-v3", vec![row("uni-eth", "ethereum", 1)]);
        buffer.merge("aave-v3", vec![row("aave-eth", "ethereum", 2)]);
        buffer.merge("uniswap-v3", vec![row("uni-eth", "ethereum", 1), row("uni-arb", "arbitrum", 3)]);
        buffer.merge("compound-v2", Vec::new());

        let entries: Vec<AggregateEntry> = buffer.entries().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].protocol, "uniswap-v3");
        assert_eq!(entries[0].rows.len(), 2);
        assert_eq!(entries[1].protocol, "aave-v3");
    }

    #[tokio::test]
    async fn test_flush_posts_new_summary_and_forwards() {
        let h = harness();
        let mut buffer = AggregateBuffer::default();
        buffer.merge("aave-v3", vec![row("aave-v3-ethereum", "ethereum", 12345)]);

        let report = h.reconciler.flush(&mut buffer, "prod", Utc::now()).await;

        assert_eq!(report.posted, 1);
        assert_eq!(report.novel_rows, 1);
        assert_eq!(report.issues_created, 1);
        assert_eq!(report.forwarded, 1);
        assert!(buffer.is_empty());

        let posted = h.chat.posts_to("prod");
        assert_eq!(posted[0].embeds[0].title, "aave-v3");
        assert!(h.sink.texts.lock().unwrap()[0].contains("failed at block 12345"));
        let reports = h.tracker.reports.lock().unwrap();
        assert_eq!(reports[0].title.chains, vec!["ethereum".to_string()]);
    }

    #[tokio::test]
    async fn test_flush_skips_unchanged_and_forwards_only_novel_rows() {
        let h = harness();
        let now = Utc::now();
        let existing = format::indexing_embed(
            "aave-v3".to_string(),
            &[row("aave-v3-ethereum", "ethereum", 12345)],
            None,
        );
        h.chat.seed("prod", vec![embed_message("1", vec![existing], now - Duration::hours(3))]);

        let mut unchanged = AggregateBuffer::default();
        unchanged.merge("aave-v3", vec![row("aave-v3-ethereum", "ethereum", 12345)]);
        let report = h.reconciler.flush(&mut unchanged, "prod", now).await;
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.posted, 0);
        assert!(h.chat.posts().is_empty());

        let mut grown = AggregateBuffer::default();
        grown.merge(
            "aave-v3",
            vec![
                row("aave-v3-ethereum", "ethereum", 12345),
                row("aave-v3-polygon", "polygon", 999),
            ],
        );
        let report = h.reconciler.flush(&mut grown, "prod", now).await;
        assert_eq!(report.posted, 1);
        assert_eq!(report.novel_rows, 1);

        let text = h.sink.texts.lock().unwrap()[0].clone();
        assert!(text.contains("polygon"));
        assert!(!text.contains("12345"));
    }

    #[tokio::test]
    async fn test_split_summary_is_read_back_whole() {
        let h = harness();
        let now = Utc::now();
        let posted_at = now - Duration::hours(2);
        let summary = |rows: &[IndexingRow]| format::indexing_embed("aave-v3".to_string(), rows, None);
        h.chat.seed(
            "prod",
            vec![
                embed_message(
                    "1",
                    vec![summary(&[row("aave-v3-arbitrum", "arbitrum-one", 7)])],
                    now - Duration::hours(6),
                ),
                embed_message(
                    "2",
                    vec![summary(&[row("aave-v3-ethereum", "ethereum", 12345)])],
                    posted_at,
                ),
                embed_message(
                    "3",
                    vec![summary(&[row("aave-v3-polygon", "polygon", 999)])],
                    posted_at + Duration::seconds(2),
                ),
            ],
        );

        let mut same = AggregateBuffer::default();
        same.merge(
            "aave-v3",
            vec![
                row("aave-v3-ethereum", "ethereum", 12345),
                row("aave-v3-polygon", "polygon", 999),
            ],
        );
        let report = h.reconciler.flush(&mut same, "prod", now).await;
        assert_eq!(report.unchanged, 1);
        assert!(h.sink.texts.lock().unwrap().is_empty());

        let mut recurring = AggregateBuffer::default();
        recurring.merge(
            "aave-v3",
            vec![
                row("aave-v3-ethereum", "ethereum", 12345),
                row("aave-v3-arbitrum", "arbitrum-one", 7),
            ],
        );
        let report = h.reconciler.flush(&mut recurring, "prod", now).await;
        assert_eq!(report.novel_rows, 1);
        let text = h.sink.texts.lock().unwrap()[0].clone();
        assert!(text.contains("arbitrum-one"));
        assert!(!text.contains("12345"));
    }

    #[tokio::test]
    async fn test_summary_older_than_window_is_ignored() {
        let h = harness();
        let now = Utc::now();
        let stale = format::indexing_embed(
            "aave-v3".to_string(),
            &[row("aave-v3-ethereum", "ethereum", 12345)],
            None,
        );
        h.chat.seed("prod", vec![embed_message("1", vec![stale], now - Duration::hours(30))]);

        let mut buffer = AggregateBuffer::default();
        buffer.merge("aave-v3", vec![row("aave-v3-ethereum", "ethereum", 12345)]);
        let report = h.reconciler.flush(&mut buffer, "prod", now).await;

        assert_eq!(report.posted, 1);
    }

    #[tokio::test]
    async fn test_flush_uses_aggregate_pacing() {
        let h = harness();
        let mut buffer = AggregateBuffer::default();
        for i in 0..6 {
            buffer.merge(&format!("protocol-{i}"), vec![row("d", "ethereum", i)]);
        }

        let report = h.reconciler.flush(&mut buffer, "prod", Utc::now()).await;

        assert_eq!(report.posted, 6);
        assert_eq!(h.delay.calls(), vec![std::time::Duration::from_millis(1500)]);
    }
}
