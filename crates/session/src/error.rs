use thiserror::Error;

use crate::envelope::SessionId;

/// Why a piece of feed text could not be turned into an envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Ordinary chatter: the text carries no protocol block at all
    #[error("not an envelope")]
    NotAnEnvelope,

    /// A protocol block is present but cannot be read
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

/// Errors surfaced by the session engine once its retry budget is spent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Network or API failures outlasted the attempt budget
    #[error("transport unavailable during {operation} after {attempts} attempts: {last_error}")]
    TransportUnavailable {
        operation: &'static str,
        attempts: u32,
        last_error: String,
    },

    /// Quota rejections outlasted the rate-limit budget
    #[error("rate limited during {operation} ({waits} back-offs)")]
    RateLimited { operation: &'static str, waits: u32 },

    /// The session was never opened here, or has been closed
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    /// Envelope could not be rendered to text
    #[error("encode error: {0}")]
    Encode(String),
}

/// Convenience Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
