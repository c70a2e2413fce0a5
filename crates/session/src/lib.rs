//! Session messaging over a social feed.
//!
//! Envelopes travel as fenced blocks inside ordinary comments. The engine
//! correlates replies with the session that asked for them, hands each one out
//! at most once, and restores per-sender sequence order.

pub mod codec;
pub mod engine;
pub mod envelope;
pub mod error;
mod reorder;
pub mod retry;
pub mod seen;

pub use codec::{decode, encode, PROTOCOL_VERSION};
pub use engine::{Received, SessionEngine};
pub use envelope::{Envelope, EnvelopeKind, SessionId};
pub use error::{DecodeError, Result, SessionError};
pub use retry::with_retry;
pub use seen::SeenSet;
