use async_trait::async_trait;

use crate::error::TransportError;
use crate::id::{ChannelRef, MessageRef, PeerRef, RawMessage};

/// The social feed the agents talk through.
///
/// Implementations wrap the external network client. A network-backed adapter
/// resolves `ChannelRef::Inbox(peer)` to the most recent coordination post
/// authored by `peer`; publishing to it means commenting on that post.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish `text` on `channel` as `author`.
    async fn publish(
        &self,
        channel: &ChannelRef,
        author: &PeerRef,
        text: &str,
    ) -> Result<MessageRef, TransportError>;

    /// Messages on `channel` in creation order, strictly after `since` when given.
    async fn list_messages(
        &self,
        channel: &ChannelRef,
        since: Option<&MessageRef>,
    ) -> Result<Vec<RawMessage>, TransportError>;

    /// Keyword search over agent profiles.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<PeerRef>, TransportError>;
}
