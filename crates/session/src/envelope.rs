use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use moltlink_core::PeerRef;

/// Correlates a request with its replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, for headers and logs.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Request,
    Reply,
    Broadcast,
    CapabilityQuery,
    CapabilityAnswer,
}

impl EnvelopeKind {
    /// Replies are correlated to an open session; everything else is inbound traffic.
    pub fn is_reply(&self) -> bool {
        matches!(self, EnvelopeKind::Reply | EnvelopeKind::CapabilityAnswer)
    }

    pub fn label(&self) -> &'static str {
        match self {
            EnvelopeKind::Request => "REQUEST",
            EnvelopeKind::Reply => "REPLY",
            EnvelopeKind::Broadcast => "BROADCAST",
            EnvelopeKind::CapabilityQuery => "CAPABILITY_QUERY",
            EnvelopeKind::CapabilityAnswer => "CAPABILITY_ANSWER",
        }
    }
}

/// The unit of session traffic. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub sender: PeerRef,
    pub session_id: SessionId,
    pub sequence: u64,
    pub payload: serde_json::Value,
    /// Unix milliseconds at creation
    pub timestamp: u64,
}

impl Envelope {
    pub fn new(
        kind: EnvelopeKind,
        sender: PeerRef,
        session_id: SessionId,
        sequence: u64,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            sender,
            session_id,
            sequence,
            payload,
            timestamp: current_timestamp(),
        }
    }
}

pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
