//! One thread per protocol under the root alert channel, plus retention pruning.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::discord::{ChannelMessage, ChatApi, MessagePayload, BULK_DELETE_MAX_AGE_DAYS, MAX_PAGE_SIZE};
use crate::error::ChatError;
use crate::history::HistoryPaginator;

/// Content of the throwaway message that wakes an archived thread.
const UNARCHIVE_NUDGE: &str = "unarchiving for cleanup";

/// Protocol name to thread channel id.
pub type ThreadMapping = HashMap<String, String>;

/// Outcome of pruning one or more channels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub channels: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl PruneReport {
    fn absorb(&mut self, other: &Self) {
        self.channels += other.channels;
        self.deleted += other.deleted;
        self.failed += other.failed;
    }
}

pub struct ThreadManager {
    api: Arc<dyn ChatApi>,
    paginator: HistoryPaginator,
    threads: ThreadMapping,
}

impl ThreadManager {
    pub fn new(api: Arc<dyn ChatApi>, paginator: HistoryPaginator) -> Self {
        Self {
            api,
            paginator,
            threads: ThreadMapping::new(),
        }
    }

    /// Recover the mapping from root channel history.
    ///
    /// A root message whose content names a protocol and which anchors a thread
    /// maps that protocol to the thread. The newest anchor wins. Returns the number
    /// of mappings learned.
    pub fn load_from_history(&mut self, root_messages: &[ChannelMessage]) -> usize {
        let mut learned = 0;
        // Newest first, so the first anchor seen for a protocol is kept.
        for message in root_messages {
            let Some(thread) = &message.thread else {
                continue;
            };
            let protocol = message.content.trim();
            if protocol.is_empty() || self.threads.contains_key(protocol) {
                continue;
            }
            self.threads.insert(protocol.to_string(), thread.id.clone());
            learned += 1;
        }
        debug!(learned, total = self.threads.len(), "Loaded thread mapping");
        learned
    }

    pub fn thread_id(&self, protocol: &str) -> Option<&str> {
        self.threads.get(protocol).map(String::as_str)
    }

    pub fn threads(&self) -> &ThreadMapping {
        &self.threads
    }

    /// Return the thread of `protocol`, creating it under `base` if needed.
    ///
    /// Creation posts a head message and turns it into a thread. When the thread
    /// cannot be started the head message is removed again.
    pub async fn ensure_thread(&mut self, protocol: &str, base: &str) -> Result<String, ChatError> {
        if let Some(id) = self.threads.get(protocol) {
            return Ok(id.clone());
        }

        let head = self
            .api
            .post_message(base, &MessagePayload::text(protocol))
            .await?;

        match self.api.start_thread(base, &head.id, protocol).await {
            Ok(thread_id) => {
                info!(protocol = %protocol, thread_id = %thread_id, "Created protocol thread");
                self.threads.insert(protocol.to_string(), thread_id.clone());
                Ok(thread_id)
            }
            Err(e) => {
                warn!(protocol = %protocol, error = %e, "Failed to start thread, removing head message");
                if let Err(delete_err) = self.api.delete_message(base, &head.id).await {
                    warn!(
                        channel_id = %base,
                        message_id = %head.id,
                        error = %delete_err,
                        "Failed to remove orphaned head message"
                    );
                }
                Err(e)
            }
        }
    }

    /// Delete messages of `channel_id` posted before `older_than`.
    ///
    /// Thread anchors are kept so the mapping stays recoverable. Messages too old
    /// for bulk delete go one by one.
    pub async fn prune(&self, channel_id: &str, older_than: DateTime<Utc>) -> PruneReport {
        let mut report = PruneReport {
            channels: 1,
            ..PruneReport::default()
        };

        let bulk_cutoff = Utc::now() - Duration::days(BULK_DELETE_MAX_AGE_DAYS);
        let (bulk, single): (Vec<ChannelMessage>, Vec<ChannelMessage>) = self
            .paginator
            .fetch_all(channel_id)
            .await
            .into_iter()
            .filter(|m| m.timestamp < older_than && m.thread.is_none())
            .partition(|m| m.timestamp > bulk_cutoff);

        let bulk: Vec<String> = bulk.into_iter().map(|m| m.id).collect();
        let single: Vec<String> = single.into_iter().map(|m| m.id).collect();
        for chunk in bulk.chunks(MAX_PAGE_SIZE).chain(single.chunks(1)) {
            match self.delete_chunk(channel_id, chunk).await {
                Ok(()) => report.deleted += chunk.len(),
                Err(e) => {
                    warn!(channel_id = %channel_id, count = chunk.len(), error = %e, "Failed to prune messages");
                    report.failed += chunk.len();
                }
            }
        }

        if report.deleted > 0 || report.failed > 0 {
            info!(
                channel_id = %channel_id,
                deleted = report.deleted,
                failed = report.failed,
                "Pruned channel"
            );
        }
        report
    }

    /// Prune the root channel and every known protocol thread.
    pub async fn cleanup_root(&mut self, root: &str, older_than: DateTime<Utc>) -> PruneReport {
        let root_messages = self.paginator.fetch_all(root).await;
        self.load_from_history(&root_messages);

        let mut channels: Vec<String> = self.threads.values().cloned().collect();
        channels.sort();
        channels.push(root.to_string());

        let mut report = PruneReport::default();
        for channel in &channels {
            report.absorb(&self.prune(channel, older_than).await);
        }
        report
    }

    /// Delete one chunk, waking the thread once if it is archived.
    async fn delete_chunk(&self, channel_id: &str, ids: &[String]) -> Result<(), ChatError> {
        match self.delete_once(channel_id, ids).await {
            Err(e) if e.is_archived_thread() => {
                debug!(channel_id = %channel_id, "Thread archived, unarchiving before retry");
                let nudge = self
                    .api
                    .post_message(channel_id, &MessagePayload::text(UNARCHIVE_NUDGE))
                    .await?;
                let retried = self.delete_once(channel_id, ids).await;
                if let Err(e) = self.api.delete_message(channel_id, &nudge.id).await {
                    warn!(channel_id = %channel_id, error = %e, "Failed to remove unarchive message");
                }
                retried
            }
            other => other,
        }
    }

    async fn delete_once(&self, channel_id: &str, ids: &[String]) -> Result<(), ChatError> {
        match ids {
            [] => Ok(()),
            [id] => self.api.delete_message(channel_id, id).await,
            _ => self.api.bulk_delete(channel_id, ids).await,
        }
    }
}
