use std::sync::Arc;
use tracing::info;

use moltlink_core::PeerRef;

use crate::definition::Skill;
use crate::error::{Result, SkillError};
use crate::registry::SkillRegistry;

/// Decision on where to send a delegation
#[derive(Debug, Clone)]
pub struct RouteDecision {
    /// Selected peer
    pub peer: PeerRef,
    /// The peer's skill that matched
    pub skill: Skill,
    /// Remaining candidates, in order of preference
    pub alternatives: Vec<PeerRef>,
}

/// Picks the single best assignee for a required skill.
///
/// Ranking comes from the registry: highest confidence, then most recently seen.
pub struct SkillRouter {
    registry: Arc<SkillRegistry>,
}

impl SkillRouter {
    pub fn new(registry: Arc<SkillRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SkillRegistry> {
        &self.registry
    }

    /// Find the best peer for `skill`.
    pub fn route(&self, skill: &str) -> Result<RouteDecision> {
        let mut candidates = self.registry.match_skill(skill).into_iter();
        let best = candidates
            .next()
            .ok_or_else(|| SkillError::NoCandidate(skill.to_string()))?;
        let alternatives: Vec<PeerRef> = candidates.map(|m| m.profile.peer).collect();

        info!(
            "Routed '{}' to {} (skill: {}, confidence: {:.2}, {} alternatives)",
            skill,
            best.profile.peer,
            best.skill.name,
            best.skill.confidence,
            alternatives.len()
        );

        Ok(RouteDecision {
            peer: best.profile.peer,
            skill: best.skill,
            alternatives,
        })
    }
}
