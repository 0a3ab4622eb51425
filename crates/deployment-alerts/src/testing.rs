//! In-memory fakes for the chat platform and pacing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::delay::Delay;
use crate::discord::{
    ChannelMessage, ChatApi, Embed, MessagePayload, ThreadRef, BULK_DELETE_MAX_AGE_DAYS,
};
use crate::error::ChatError;

pub fn message(id: &str, channel_id: &str, content: &str) -> ChannelMessage {
    ChannelMessage {
        id: id.to_string(),
        channel_id: channel_id.to_string(),
        content: content.to_string(),
        embeds: Vec::new(),
        timestamp: Utc::now(),
        thread: None,
    }
}

pub fn embed_message(id: &str, embeds: Vec<Embed>, timestamp: DateTime<Utc>) -> ChannelMessage {
    ChannelMessage {
        id: id.to_string(),
        channel_id: "c1".to_string(),
        content: String::new(),
        embeds,
        timestamp,
        thread: None,
    }
}

/// Records requested sleeps instead of sleeping.
#[derive(Debug, Default)]
pub struct RecordingDelay {
    calls: Mutex<Vec<Duration>>,
}

impl RecordingDelay {
    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Delay for RecordingDelay {
    async fn sleep(&self, duration: Duration) {
        self.calls.lock().unwrap().push(duration);
    }
}

enum ScriptedPage {
    Page(Vec<ChannelMessage>),
    Fail,
}

/// Rate limit rule: posts whose digest contains `needle` get a 429.
struct ThrottleRule {
    needle: String,
    remaining: usize,
    /// The platform stores the message even though it answered 429.
    stored_anyway: bool,
}

#[derive(Default)]
struct State {
    scripted: HashMap<String, VecDeque<ScriptedPage>>,
    /// Stored messages per channel, newest first.
    stored: HashMap<String, Vec<ChannelMessage>>,
    fetch_cursors: HashMap<String, Vec<Option<String>>>,
    posts: Vec<(String, MessagePayload)>,
    deletes: Vec<(String, String)>,
    bulk_deletes: Vec<(String, Vec<String>)>,
    threads: Vec<(String, String, String)>,
    throttles: Vec<ThrottleRule>,
    failing_posts: Vec<String>,
    archived: HashSet<String>,
    /// Archived channels that posting does not wake.
    stuck_archived: HashSet<String>,
    fail_threads: bool,
}

/// Scriptable in-memory chat platform.
///
/// History comes from scripted pages first, then from stored messages (seeded or
/// posted) honoring the `before` cursor. Message ids increase monotonically so
/// newer messages sort first.
pub struct FakeChat {
    state: Mutex<State>,
    next_id: AtomicU64,
}

impl Default for FakeChat {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeChat {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            next_id: AtomicU64::new(1_000_000),
        }
    }

    fn next_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }

    pub fn push_page(&self, channel_id: &str, page: Vec<ChannelMessage>) {
        self.state
            .lock()
            .unwrap()
            .scripted
            .entry(channel_id.to_string())
            .or_default()
            .push_back(ScriptedPage::Page(page));
    }

    pub fn fail_next_fetch(&self, channel_id: &str) {
        self.state
            .lock()
            .unwrap()
            .scripted
            .entry(channel_id.to_string())
            .or_default()
            .push_back(ScriptedPage::Fail);
    }

    /// Seed stored history; `messages` are given oldest first.
    pub fn seed(&self, channel_id: &str, messages: Vec<ChannelMessage>) {
        let mut state = self.state.lock().unwrap();
        let stored = state.stored.entry(channel_id.to_string()).or_default();
        for mut message in messages {
            message.channel_id = channel_id.to_string();
            stored.insert(0, message);
        }
    }

    /// Answer 429 to the next `times` posts whose digest contains `needle`.
    pub fn throttle_posts_containing(&self, needle: &str, times: usize, stored_anyway: bool) {
        self.state.lock().unwrap().throttles.push(ThrottleRule {
            needle: needle.to_string(),
            remaining: times,
            stored_anyway,
        });
    }

    /// Answer 500 to posts whose digest contains `needle`.
    pub fn fail_posts_containing(&self, needle: &str) {
        self.state.lock().unwrap().failing_posts.push(needle.to_string());
    }

    pub fn archive(&self, channel_id: &str) {
        self.state.lock().unwrap().archived.insert(channel_id.to_string());
    }

    /// Archive a channel that stays archived even after a post.
    pub fn archive_permanently(&self, channel_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.archived.insert(channel_id.to_string());
        state.stuck_archived.insert(channel_id.to_string());
    }

    pub fn is_archived(&self, channel_id: &str) -> bool {
        self.state.lock().unwrap().archived.contains(channel_id)
    }

    pub fn fail_thread_creation(&self) {
        self.state.lock().unwrap().fail_threads = true;
    }

    pub fn fetch_cursors(&self, channel_id: &str) -> Vec<Option<String>> {
        self.state
            .lock()
            .unwrap()
            .fetch_cursors
            .get(channel_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn posts(&self) -> Vec<(String, MessagePayload)> {
        self.state.lock().unwrap().posts.clone()
    }

    pub fn posts_to(&self, channel_id: &str) -> Vec<MessagePayload> {
        self.posts()
            .into_iter()
            .filter(|(c, _)| c == channel_id)
            .map(|(_, p)| p)
            .collect()
    }

    pub fn deletes(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().deletes.clone()
    }

    pub fn bulk_deletes(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().unwrap().bulk_deletes.clone()
    }

    pub fn threads(&self) -> Vec<(String, String, String)> {
        self.state.lock().unwrap().threads.clone()
    }

    pub fn stored(&self, channel_id: &str) -> Vec<ChannelMessage> {
        self.state
            .lock()
            .unwrap()
            .stored
            .get(channel_id)
            .cloned()
            .unwrap_or_default()
    }

    fn store(&self, state: &mut State, channel_id: &str, payload: &MessagePayload) -> ChannelMessage {
        let message = ChannelMessage {
            id: self.next_id(),
            channel_id: channel_id.to_string(),
            content: payload.content.clone(),
            embeds: payload.embeds.clone(),
            timestamp: Utc::now(),
            thread: None,
        };
        state
            .stored
            .entry(channel_id.to_string())
            .or_default()
            .insert(0, message.clone());
        message
    }

    fn remove(state: &mut State, channel_id: &str, ids: &[String]) {
        if let Some(stored) = state.stored.get_mut(channel_id) {
            stored.retain(|m| !ids.contains(&m.id));
        }
    }
}

#[async_trait]
impl ChatApi for FakeChat {
    async fn fetch_messages(
        &self,
        channel_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ChannelMessage>, ChatError> {
        let mut state = self.state.lock().unwrap();
        state
            .fetch_cursors
            .entry(channel_id.to_string())
            .or_default()
            .push(before.map(str::to_string));

        if let Some(scripted) = state.scripted.get_mut(channel_id).and_then(VecDeque::pop_front) {
            return match scripted {
                ScriptedPage::Page(page) => Ok(page),
                ScriptedPage::Fail => Err(ChatError::Status {
                    status: 502,
                    body: "bad gateway".to_string(),
                }),
            };
        }

        let stored = state.stored.get(channel_id).cloned().unwrap_or_default();
        let start = before
            .and_then(|cursor| stored.iter().position(|m| m.id == cursor).map(|i| i + 1))
            .unwrap_or(0);
        Ok(stored.into_iter().skip(start).take(limit).collect())
    }

    async fn post_message(
        &self,
        channel_id: &str,
        payload: &MessagePayload,
    ) -> Result<ChannelMessage, ChatError> {
        let mut state = self.state.lock().unwrap();
        state.posts.push((channel_id.to_string(), payload.clone()));
        let digest = payload.digest();

        if state.failing_posts.iter().any(|n| digest.contains(n.as_str())) {
            return Err(ChatError::Status {
                status: 500,
                body: "internal error".to_string(),
            });
        }

        let mut throttled_stored = None;
        for rule in &mut state.throttles {
            if rule.remaining > 0 && digest.contains(rule.needle.as_str()) {
                rule.remaining -= 1;
                throttled_stored = Some(rule.stored_anyway);
                break;
            }
        }
        if let Some(stored_anyway) = throttled_stored {
            if stored_anyway {
                self.store(&mut state, channel_id, payload);
            }
            return Err(ChatError::RateLimited {
                retry_after_secs: 1,
                request_body: Some(serde_json::to_string(payload)?),
            });
        }

        // Any activity unarchives a thread.
        if !state.stuck_archived.contains(channel_id) {
            state.archived.remove(channel_id);
        }
        Ok(self.store(&mut state, channel_id, payload))
    }

    async fn bulk_delete(&self, channel_id: &str, message_ids: &[String]) -> Result<(), ChatError> {
        let mut state = self.state.lock().unwrap();
        if state.archived.contains(channel_id) {
            return Err(ChatError::ArchivedThread {
                channel_id: channel_id.to_string(),
            });
        }
        let cutoff = Utc::now() - chrono::Duration::days(BULK_DELETE_MAX_AGE_DAYS);
        let too_old = state.stored.get(channel_id).is_some_and(|stored| {
            stored
                .iter()
                .any(|m| message_ids.contains(&m.id) && m.timestamp < cutoff)
        });
        if too_old {
            return Err(ChatError::Status {
                status: 400,
                body: r#"{"message": "You can only bulk delete messages that are under 14 days old.", "code": 50034}"#.to_string(),
            });
        }
        state
            .bulk_deletes
            .push((channel_id.to_string(), message_ids.to_vec()));
        Self::remove(&mut state, channel_id, message_ids);
        Ok(())
    }

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<(), ChatError> {
        let mut state = self.state.lock().unwrap();
        if state.archived.contains(channel_id) {
            return Err(ChatError::ArchivedThread {
                channel_id: channel_id.to_string(),
            });
        }
        state
            .deletes
            .push((channel_id.to_string(), message_id.to_string()));
        Self::remove(&mut state, channel_id, &[message_id.to_string()]);
        Ok(())
    }

    async fn start_thread(
        &self,
        channel_id: &str,
        message_id: &str,
        name: &str,
    ) -> Result<String, ChatError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_threads {
            return Err(ChatError::Status {
                status: 403,
                body: "missing permissions".to_string(),
            });
        }
        let thread_id = self.next_id();
        state
            .threads
            .push((channel_id.to_string(), message_id.to_string(), name.to_string()));
        if let Some(head) = state
            .stored
            .get_mut(channel_id)
            .and_then(|s| s.iter_mut().find(|m| m.id == message_id))
        {
            head.thread = Some(ThreadRef {
                id: thread_id.clone(),
                name: name.to_string(),
            });
        }
        Ok(thread_id)
    }
}
