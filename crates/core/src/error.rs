use thiserror::Error;

/// Errors raised by the transport adapter.
///
/// The session layer retries `Unavailable` with exponential backoff and treats
/// `RateLimited` as a request to back off for longer before trying again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Network or API failure on the underlying feed
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// The feed rejected the call because of a quota
    #[error("rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },
}

/// Errors that can occur in configuration loading and strategy persistence.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Configuration file could not be parsed
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Blob store read or write failed
    #[error("blob store error: {0}")]
    BlobStore(String),

    /// Failed to serialize or deserialize data
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O operation failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
