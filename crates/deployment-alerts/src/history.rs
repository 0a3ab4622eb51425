//! Full channel history retrieval.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::delay::Delay;
use crate::discord::{ChannelMessage, ChatApi, MAX_PAGE_SIZE};

/// Pagination pacing.
#[derive(Debug, Clone)]
pub struct PaginationConfig {
    /// Messages requested per page (platform maximum is 100).
    pub page_size: usize,
    /// Wait between consecutive page fetches.
    pub page_delay: Duration,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            page_delay: Duration::from_millis(500),
        }
    }
}

/// Walks a channel's history backwards, newest first.
#[derive(Clone)]
pub struct HistoryPaginator {
    api: Arc<dyn ChatApi>,
    delay: Arc<dyn Delay>,
    config: PaginationConfig,
}

impl HistoryPaginator {
    pub fn new(api: Arc<dyn ChatApi>, delay: Arc<dyn Delay>, config: PaginationConfig) -> Self {
        let config = PaginationConfig {
            page_size: config.page_size.clamp(1, MAX_PAGE_SIZE),
            ..config
        };
        Self { api, delay, config }
    }

    /// Fetch every message in the channel.
    ///
    /// Stops on an empty or partial page. A transport failure ends pagination and
    /// returns whatever was collected so far; partial history only weakens
    /// deduplication for this cycle.
    pub async fn fetch_all(&self, channel_id: &str) -> Vec<ChannelMessage> {
        let mut messages: Vec<ChannelMessage> = Vec::new();
        let mut before: Option<String> = None;
        let mut pages = 0usize;

        loop {
            if pages > 0 {
                self.delay.sleep(self.config.page_delay).await;
            }

            let page = match self
                .api
                .fetch_messages(channel_id, before.as_deref(), self.config.page_size)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(
                        channel_id = %channel_id,
                        collected = messages.len(),
                        error = %e,
                        "History fetch failed, continuing with partial history"
                    );
                    break;
                }
            };
            pages += 1;

            let page_len = page.len();
            before = page.last().map(|m| m.id.clone());
            messages.extend(page);

            if page_len < self.config.page_size || before.is_none() {
                break;
            }
        }

        debug!(
            channel_id = %channel_id,
            pages,
            count = messages.len(),
            "Fetched channel history"
        );
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{message, FakeChat, RecordingDelay};

    fn page(start: usize, len: usize) -> Vec<ChannelMessage> {
        (start..start + len)
            .map(|i| message(&format!("{}", 10_000 - i), "c1", &format!("m{i}")))
            .collect()
    }

    #[tokio::test]
    async fn test_fetch_all_follows_cursor_until_partial_page() {
        let chat = Arc::new(FakeChat::new());
        chat.push_page("c1", page(0, 100));
        chat.push_page("c1", page(100, 100));
        chat.push_page("c1", page(200, 40));
        let delay = Arc::new(RecordingDelay::default());

        let paginator = HistoryPaginator::new(chat.clone(), delay.clone(), PaginationConfig::default());
        let messages = paginator.fetch_all("c1").await;

        assert_eq!(messages.len(), 240);
        let cursors = chat.fetch_cursors("c1");
        assert_eq!(cursors.len(), 3);
        assert_eq!(cursors[0], None);
        assert_eq!(cursors[1].as_deref(), Some("9901"));
        assert_eq!(cursors[2].as_deref(), Some("9801"));
        // No wait before the first page.
        assert_eq!(delay.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_all_stops_on_empty_page() {
        let chat = Arc::new(FakeChat::new());
        chat.push_page("c1", page(0, 100));
        chat.push_page("c1", Vec::new());

        let paginator =
            HistoryPaginator::new(chat.clone(), Arc::new(RecordingDelay::default()), PaginationConfig::default());
        let messages = paginator.fetch_all("c1").await;

        assert_eq!(messages.len(), 100);
        assert_eq!(chat.fetch_cursors("c1").len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_all_returns_partial_history_on_failure() {
        let chat = Arc::new(FakeChat::new());
        chat.push_page("c1", page(0, 100));
        chat.fail_next_fetch("c1");

        let paginator =
            HistoryPaginator::new(chat.clone(), Arc::new(RecordingDelay::default()), PaginationConfig::default());
        let messages = paginator.fetch_all("c1").await;

        assert_eq!(messages.len(), 100);
    }
}
