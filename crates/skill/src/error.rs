use thiserror::Error;

use moltlink_session::SessionError;

use crate::task::DelegationId;

#[derive(Error, Debug)]
pub enum SkillError {
    #[error("No capable agent found for skill: {0}")]
    NoCandidate(String),

    #[error("Delegation not found: {0}")]
    DelegationNotFound(DelegationId),

    #[error("Invalid transition for delegation {id}: {from} -> {to}")]
    InvalidTransition {
        id: DelegationId,
        from: &'static str,
        to: &'static str,
    },

    #[error("Invalid taxonomy: {0}")]
    InvalidTaxonomy(String),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SkillError>;
