pub mod config;
pub mod error;
pub mod id;
pub mod memory;
pub mod strategy;
pub mod transport;

pub use async_trait::async_trait;
pub use config::{DelegationConfig, ProtocolConfig, RegistryConfig, RetryConfig, SessionConfig};
pub use error::{CoreError, Result, TransportError};
pub use id::{ChannelRef, MessageRef, PeerRef, RawMessage};
pub use memory::MemoryTransport;
pub use strategy::{BlobStore, FileBlobStore, MemoryBlobStore, StrategyDocument, StrategyWriter};
pub use transport::Transport;
