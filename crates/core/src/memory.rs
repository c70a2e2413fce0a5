//! In-process feed used by tests and the demo binary.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::TransportError;
use crate::id::{ChannelRef, MessageRef, PeerRef, RawMessage};
use crate::transport::Transport;

fn now_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone)]
struct Listing {
    peer: PeerRef,
    bio: String,
}

#[derive(Default)]
struct FeedState {
    channels: HashMap<ChannelRef, Vec<RawMessage>>,
    listings: Vec<Listing>,
    next_id: u64,
    fail_publishes: u32,
    rate_limited_publishes: u32,
    fail_lists: u32,
    ignore_since: bool,
    publish_attempts: usize,
    publish_count: usize,
}

impl FeedState {
    fn append(&mut self, channel: &ChannelRef, author: &PeerRef, text: &str) -> MessageRef {
        self.next_id += 1;
        let id = MessageRef::new(format!("m{:08}", self.next_id));
        self.channels
            .entry(channel.clone())
            .or_default()
            .push(RawMessage {
                id: id.clone(),
                author: author.clone(),
                text: text.to_string(),
                created_at: now_timestamp(),
            });
        id
    }
}

/// A shared, in-memory feed with one message list per channel.
///
/// Every agent in a scenario holds the same `Arc<MemoryTransport>`. Faults can be
/// injected per call kind, and raw messages can be injected to simulate replays,
/// out-of-order arrival and ordinary chatter.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<FeedState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an agent visible to `search`.
    pub fn register_agent(&self, peer: impl Into<PeerRef>, bio: impl Into<String>) {
        self.state.lock().listings.push(Listing {
            peer: peer.into(),
            bio: bio.into(),
        });
    }

    /// Append a raw message without going through `publish` or its counters.
    pub fn inject(&self, channel: &ChannelRef, author: &PeerRef, text: &str) -> MessageRef {
        self.state.lock().append(channel, author, text)
    }

    /// The next `n` publish calls fail with `Unavailable`.
    pub fn fail_next_publishes(&self, n: u32) {
        self.state.lock().fail_publishes = n;
    }

    /// The next `n` publish calls are rejected with `RateLimited`.
    pub fn rate_limit_next(&self, n: u32) {
        self.state.lock().rate_limited_publishes = n;
    }

    /// The next `n` list calls fail with `Unavailable`.
    pub fn fail_next_lists(&self, n: u32) {
        self.state.lock().fail_lists = n;
    }

    /// Serve full channel history on every list call, the way a feed without
    /// cursor support behaves.
    pub fn set_ignore_since(&self, ignore: bool) {
        self.state.lock().ignore_since = ignore;
    }

    /// Publish calls made so far, including rejected ones.
    pub fn publish_attempts(&self) -> usize {
        self.state.lock().publish_attempts
    }

    /// Successful publishes so far.
    pub fn publish_count(&self) -> usize {
        self.state.lock().publish_count
    }

    /// Number of messages currently on `channel`.
    pub fn published_to(&self, channel: &ChannelRef) -> usize {
        self.state
            .lock()
            .channels
            .get(channel)
            .map_or(0, |messages| messages.len())
    }

    /// Snapshot of every message on `channel`.
    pub fn messages(&self, channel: &ChannelRef) -> Vec<RawMessage> {
        self.state
            .lock()
            .channels
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(
        &self,
        channel: &ChannelRef,
        author: &PeerRef,
        text: &str,
    ) -> Result<MessageRef, TransportError> {
        let mut state = self.state.lock();
        state.publish_attempts += 1;

        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            return Err(TransportError::Unavailable("injected publish failure".into()));
        }
        if state.rate_limited_publishes > 0 {
            state.rate_limited_publishes -= 1;
            return Err(TransportError::RateLimited {
                retry_after_ms: None,
            });
        }

        state.publish_count += 1;
        let id = state.append(channel, author, text);
        tracing::debug!("MemoryTransport: {} published {} on {}", author, id, channel);
        Ok(id)
    }

    async fn list_messages(
        &self,
        channel: &ChannelRef,
        since: Option<&MessageRef>,
    ) -> Result<Vec<RawMessage>, TransportError> {
        let mut state = self.state.lock();

        if state.fail_lists > 0 {
            state.fail_lists -= 1;
            return Err(TransportError::Unavailable("injected list failure".into()));
        }

        let Some(messages) = state.channels.get(channel) else {
            return Ok(Vec::new());
        };

        let since = if state.ignore_since { None } else { since };
        let start = since
            .and_then(|since| messages.iter().position(|m| &m.id == since))
            .map_or(0, |pos| pos + 1);

        Ok(messages[start..].to_vec())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<PeerRef>, TransportError> {
        let query = query.trim().to_lowercase();
        let state = self.state.lock();

        Ok(state
            .listings
            .iter()
            .filter(|l| {
                query.is_empty()
                    || l.peer.as_str().to_lowercase().contains(&query)
                    || l.bio.to_lowercase().contains(&query)
            })
            .map(|l| l.peer.clone())
            .take(limit)
            .collect())
    }
}
