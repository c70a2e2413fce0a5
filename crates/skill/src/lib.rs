//! Skill discovery and delegation on top of feed sessions.

pub mod definition;
pub mod delegation;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod task;
pub mod taxonomy;

pub use definition::{AgentProfile, ProfileSource, Skill};
pub use delegation::DelegationCoordinator;
pub use error::{Result, SkillError};
pub use executor::{Responder, TaskHandler};
pub use metrics::{DelegationMetrics, MetricsTracker, PeerMetrics};
pub use registry::{RegistryMessage, SkillMatch, SkillRegistry};
pub use router::{RouteDecision, SkillRouter};
pub use task::{
    Delegation, DelegationId, DelegationState, FailureReason, Priority, TaskReply, TaskRequest,
};
pub use taxonomy::{Taxonomy, TAXONOMY_VERSION};
