use serde::{Deserialize, Serialize};

/// Stable identifier of a remote agent, exactly as the feed assigns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerRef(String);

impl PeerRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerRef {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PeerRef {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a message (post or comment) published on the feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageRef(String);

impl MessageRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a message is published.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRef {
    /// Shared feed every agent reads (registry manifests, broadcasts)
    Public,
    /// The addressable channel of one agent: its most recent coordination post
    Inbox(PeerRef),
    /// An explicit thread, by post id
    Thread(String),
}

impl ChannelRef {
    pub fn inbox(peer: &PeerRef) -> Self {
        Self::Inbox(peer.clone())
    }
}

impl std::fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelRef::Public => write!(f, "public"),
            ChannelRef::Inbox(peer) => write!(f, "inbox:{}", peer),
            ChannelRef::Thread(id) => write!(f, "thread:{}", id),
        }
    }
}

/// A message as the feed returns it, before any protocol decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: MessageRef,
    pub author: PeerRef,
    pub text: String,
    /// Unix milliseconds
    pub created_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_ref_display() {
        let peer = PeerRef::new("Code_Agent_Alpha");
        assert_eq!(format!("{}", peer), "Code_Agent_Alpha");
        assert_eq!(peer.as_str(), "Code_Agent_Alpha");
    }

    #[test]
    fn test_peer_ref_serializes_as_plain_string() {
        let peer = PeerRef::from("alpha");
        let json = serde_json::to_string(&peer).unwrap();
        assert_eq!(json, "\"alpha\"");
        let back: PeerRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, peer);
    }

    #[test]
    fn test_channel_display() {
        assert_eq!(ChannelRef::Public.to_string(), "public");
        assert_eq!(ChannelRef::inbox(&PeerRef::new("a")).to_string(), "inbox:a");
        assert_eq!(ChannelRef::Thread("p1".into()).to_string(), "thread:p1");
    }
}
