use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use moltlink_core::{ChannelRef, MessageRef, PeerRef, RawMessage, RetryConfig, SessionConfig, Transport};

use crate::codec::{decode, encode};
use crate::envelope::{Envelope, EnvelopeKind, SessionId};
use crate::error::{DecodeError, Result, SessionError};
use crate::reorder::ReorderBuffer;
use crate::retry::with_retry;
use crate::seen::SeenSet;

/// Outcome of waiting on a session.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    Envelope(Envelope),
    /// Nothing arrived before the deadline; a normal outcome, not an error
    TimedOut,
    /// The session was cancelled while waiting
    Cancelled,
}

impl Received {
    pub fn into_envelope(self) -> Option<Envelope> {
        match self {
            Received::Envelope(envelope) => Some(envelope),
            _ => None,
        }
    }
}

struct OpenSession {
    /// When the transport acknowledged the opening publish
    acknowledged_at: Instant,
    streams: HashMap<PeerRef, ReorderBuffer>,
    cancelled: bool,
}

impl OpenSession {
    fn new() -> Self {
        Self {
            acknowledged_at: Instant::now(),
            streams: HashMap::new(),
            cancelled: false,
        }
    }
}

struct EngineState {
    seen: SeenSet,
    cursors: HashMap<ChannelRef, MessageRef>,
    sessions: HashMap<SessionId, OpenSession>,
    inbound: VecDeque<(ChannelRef, Envelope)>,
}

/// Request/reply sessions emulated over the polled feed.
///
/// Every agent owns one engine. Replies of every kind are addressed to the
/// initiator's inbox, so `receive` only ever polls the local inbox.
pub struct SessionEngine {
    local: PeerRef,
    inbox: ChannelRef,
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    retry: RetryConfig,
    state: Mutex<EngineState>,
}

impl SessionEngine {
    pub fn new(
        local: PeerRef,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
        retry: RetryConfig,
    ) -> Self {
        let inbox = ChannelRef::inbox(&local);
        let state = EngineState {
            seen: SeenSet::new(config.seen_capacity),
            cursors: HashMap::new(),
            sessions: HashMap::new(),
            inbound: VecDeque::new(),
        };

        Self {
            local,
            inbox,
            transport,
            config,
            retry,
            state: Mutex::new(state),
        }
    }

    pub fn local(&self) -> &PeerRef {
        &self.local
    }

    pub fn inbox(&self) -> &ChannelRef {
        &self.inbox
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Peers the feed currently shows for `query`, excluding ourselves.
    pub async fn list_peers(&self, query: &str, limit: usize) -> Result<Vec<PeerRef>> {
        let peers = with_retry(&self.retry, "search", None, || {
            self.transport.search(query, limit)
        })
        .await?;

        Ok(peers.into_iter().filter(|p| p != &self.local).collect())
    }

    /// Open a session with a `Request` to `peer`. Does not wait for a reply.
    pub async fn send(&self, peer: &PeerRef, payload: Value) -> Result<SessionId> {
        self.open_session(peer, EnvelopeKind::Request, payload).await
    }

    /// Open a session on the public channel; any peer may answer.
    pub async fn broadcast(&self, payload: Value) -> Result<SessionId> {
        self.open(ChannelRef::Public, EnvelopeKind::Broadcast, payload)
            .await
    }

    /// Open a session of any initiating kind with `peer`.
    pub async fn open_session(
        &self,
        peer: &PeerRef,
        kind: EnvelopeKind,
        payload: Value,
    ) -> Result<SessionId> {
        self.open(ChannelRef::inbox(peer), kind, payload).await
    }

    async fn open(&self, channel: ChannelRef, kind: EnvelopeKind, payload: Value) -> Result<SessionId> {
        let session = SessionId::new();
        let envelope = Envelope::new(kind, self.local.clone(), session, 0, payload);
        let text = encode(&envelope)?;

        // Registered before publishing so a fast reply is never taken for a stranger's.
        self.state.lock().sessions.insert(session, OpenSession::new());

        let published = with_retry(&self.retry, "publish", None, || {
            self.transport.publish(&channel, &self.local, &text)
        })
        .await;

        match published {
            Ok(message) => {
                if let Some(open) = self.state.lock().sessions.get_mut(&session) {
                    open.acknowledged_at = Instant::now();
                }
                info!(
                    "Opened {} session {} on {} ({})",
                    kind.label(),
                    session.short(),
                    channel,
                    message
                );
                Ok(session)
            }
            Err(e) => {
                self.state.lock().sessions.remove(&session);
                Err(e)
            }
        }
    }

    /// Answer an inbound envelope inside its session.
    pub async fn reply(
        &self,
        request: &Envelope,
        kind: EnvelopeKind,
        sequence: u64,
        payload: Value,
    ) -> Result<MessageRef> {
        let envelope = Envelope::new(kind, self.local.clone(), request.session_id, sequence, payload);
        let text = encode(&envelope)?;
        let channel = ChannelRef::inbox(&request.sender);

        let message = with_retry(&self.retry, "publish", None, || {
            self.transport.publish(&channel, &self.local, &text)
        })
        .await?;

        debug!(
            "Replied {} #{} in session {} to {}",
            kind.label(),
            sequence,
            request.session_id.short(),
            request.sender
        );
        Ok(message)
    }

    /// Wait for the next envelope of `session`.
    ///
    /// The deadline is `timeout` after the transport acknowledged the opening
    /// publish. Each envelope is handed out at most once, in sequence order per
    /// sender.
    pub async fn receive(&self, session: SessionId, timeout: Duration) -> Result<Received> {
        let deadline = {
            let state = self.state.lock();
            let open = state
                .sessions
                .get(&session)
                .ok_or(SessionError::UnknownSession(session))?;
            open.acknowledged_at + timeout
        };

        loop {
            if let Some(received) = self.take_ready(session, false)? {
                return Ok(received);
            }

            self.poll_channel(&self.inbox, Some(deadline)).await?;

            if let Some(received) = self.take_ready(session, false)? {
                return Ok(received);
            }

            let now = Instant::now();
            if now >= deadline {
                if let Some(received) = self.take_ready(session, true)? {
                    return Ok(received);
                }
                debug!("Session {} timed out", session.short());
                return Ok(Received::TimedOut);
            }

            let pause = self.next_poll_delay().min(deadline - now);
            tokio::time::sleep(pause).await;
        }
    }

    /// Poll `channel` and return new inbound traffic (requests, capability
    /// queries, broadcasts) from other peers, oldest first.
    pub async fn fetch_inbound(&self, channel: &ChannelRef) -> Result<Vec<Envelope>> {
        self.poll_channel(channel, None).await?;

        let mut state = self.state.lock();
        let (mine, rest): (VecDeque<_>, VecDeque<_>) =
            state.inbound.drain(..).partition(|(from, _)| from == channel);
        state.inbound = rest;
        Ok(mine.into_iter().map(|(_, envelope)| envelope).collect())
    }

    /// Stop waiting on `session`. Published envelopes stay published.
    pub fn cancel(&self, session: SessionId) {
        if let Some(open) = self.state.lock().sessions.get_mut(&session) {
            open.cancelled = true;
            open.streams.clear();
            info!("Cancelled session {}", session.short());
        }
    }

    /// Forget `session` entirely; later replies to it are dropped.
    pub fn close(&self, session: SessionId) {
        self.state.lock().sessions.remove(&session);
    }

    pub fn is_open(&self, session: SessionId) -> bool {
        self.state
            .lock()
            .sessions
            .get(&session)
            .is_some_and(|open| !open.cancelled)
    }

    /// Number of raw messages currently remembered as consumed.
    pub fn seen_count(&self) -> usize {
        self.state.lock().seen.len()
    }

    fn next_poll_delay(&self) -> Duration {
        let base = self.config.poll_interval_ms as i64;
        let jitter = self.config.poll_jitter_ms as i64;
        let offset = if jitter > 0 {
            rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            0
        };
        Duration::from_millis((base + offset).max(1) as u64)
    }

    async fn poll_channel(&self, channel: &ChannelRef, deadline: Option<Instant>) -> Result<()> {
        let since = self.state.lock().cursors.get(channel).cloned();

        let batch = with_retry(&self.retry, "list_messages", deadline, || {
            self.transport.list_messages(channel, since.as_ref())
        })
        .await?;

        if batch.is_empty() {
            return Ok(());
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        if let Some(last) = batch.last() {
            state.cursors.insert(channel.clone(), last.id.clone());
        }
        for raw in batch {
            self.route(&mut state, channel, raw, now);
        }
        Ok(())
    }

    /// Decode one raw message and hand it to its session or the inbound queue.
    /// Runs under the state lock: seen-check, decode and routing are one step.
    fn route(&self, state: &mut EngineState, channel: &ChannelRef, raw: RawMessage, now: Instant) {
        if !state.seen.insert(channel, &raw.id) {
            return;
        }
        if raw.author == self.local {
            return;
        }

        let envelope = match decode(&raw.text) {
            Ok(envelope) => envelope,
            Err(DecodeError::NotAnEnvelope) => {
                trace!("Skipping chatter {} on {}", raw.id, channel);
                return;
            }
            Err(DecodeError::Malformed(reason)) => {
                debug!("Dropping malformed envelope {} from {}: {}", raw.id, raw.author, reason);
                return;
            }
        };

        if envelope.sender != raw.author {
            debug!(
                "Dropping envelope {} claiming sender {} but posted by {}",
                raw.id, envelope.sender, raw.author
            );
            return;
        }

        if envelope.kind.is_reply() {
            let Some(open) = state.sessions.get_mut(&envelope.session_id) else {
                debug!(
                    "Dropping {} for unknown session {}",
                    envelope.kind.label(),
                    envelope.session_id.short()
                );
                return;
            };
            if open.cancelled {
                return;
            }
            let session = envelope.session_id;
            let sequence = envelope.sequence;
            let stream = open
                .streams
                .entry(envelope.sender.clone())
                .or_insert_with(ReorderBuffer::new);
            if !stream.offer(envelope, now) {
                debug!("Dropping duplicate #{} in session {}", sequence, session.short());
            }
            return;
        }

        state.inbound.push_back((channel.clone(), envelope));
        if state.inbound.len() > self.config.inbound_capacity {
            if let Some((_, dropped)) = state.inbound.pop_front() {
                warn!(
                    "Inbound queue full, dropping {} from {}",
                    dropped.kind.label(),
                    dropped.sender
                );
            }
        }
    }

    /// Next deliverable envelope of `session`, flushing a stalled gap when it
    /// has waited past the reorder timeout or `force` is set.
    fn take_ready(&self, session: SessionId, force: bool) -> Result<Option<Received>> {
        let mut state = self.state.lock();
        let open = state
            .sessions
            .get_mut(&session)
            .ok_or(SessionError::UnknownSession(session))?;

        if open.cancelled {
            return Ok(Some(Received::Cancelled));
        }

        for stream in open.streams.values_mut() {
            if let Some(envelope) = stream.pop_ready() {
                return Ok(Some(Received::Envelope(envelope)));
            }
        }

        let reorder_timeout = self.config.reorder_timeout();
        for (sender, stream) in open.streams.iter_mut() {
            let stalled = stream
                .blocked_since()
                .is_some_and(|since| force || since.elapsed() >= reorder_timeout);
            if !stalled {
                continue;
            }
            let expected = stream.next_expected();
            if let Some(envelope) = stream.force_flush() {
                warn!(
                    "Ordering violation in session {}: expected #{} from {}, delivering #{}",
                    session.short(),
                    expected,
                    sender,
                    envelope.sequence
                );
                return Ok(Some(Received::Envelope(envelope)));
            }
        }

        Ok(None)
    }
}
