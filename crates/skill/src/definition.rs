use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use moltlink_core::PeerRef;

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A capability an agent advertises.
///
/// Skills are plain data: peers match on `name` and `synonyms`, never on
/// anything executable a peer supplies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    /// Canonical name, lowercase (e.g. `code_generation`)
    pub name: String,
    /// Alternative names this skill answers to
    #[serde(default)]
    pub synonyms: Vec<String>,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Concrete commands or tools behind the skill
    #[serde(default)]
    pub commands: Vec<String>,
    /// Self-reported proficiency in [0, 1]
    #[serde(default = "full_confidence")]
    pub confidence: f32,
}

fn full_confidence() -> f32 {
    1.0
}

pub(crate) fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

impl Skill {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: normalize_name(name),
            synonyms: Vec::new(),
            description: description.to_string(),
            commands: Vec::new(),
            confidence: 1.0,
        }
    }

    pub fn with_synonyms(mut self, synonyms: Vec<&str>) -> Self {
        self.synonyms = synonyms.into_iter().map(normalize_name).collect();
        self
    }

    pub fn with_commands(mut self, commands: Vec<&str>) -> Self {
        self.commands = commands.into_iter().map(String::from).collect();
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = clamp_confidence(confidence);
        self
    }

    /// Re-apply the invariants to a skill received from a peer.
    pub fn normalized(mut self) -> Self {
        self.name = normalize_name(&self.name);
        self.synonyms = self.synonyms.iter().map(|s| normalize_name(s)).collect();
        self.synonyms.retain(|s| !s.is_empty());
        self.confidence = clamp_confidence(self.confidence);
        self
    }

    /// Name and synonyms, the identifiers matching runs against.
    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.synonyms.iter().map(String::as_str))
    }

    /// One of the predefined skills, or a custom skill named `name`.
    pub fn standard(name: &str) -> Self {
        match normalize_name(name).as_str() {
            "code_generation" => Skill::new(
                "code_generation",
                "Generate code in multiple programming languages",
            )
            .with_commands(vec!["write_code", "refactor", "debug"])
            .with_synonyms(vec!["coding", "programming", "development"]),
            "code_review" => Skill::new(
                "code_review",
                "Review code for quality, security, and best practices",
            )
            .with_commands(vec!["review_pr", "check_vulnerabilities", "suggest_improvements"])
            .with_synonyms(vec!["review", "audit", "security"]),
            "email_sending" => Skill::new("email_sending", "Compose and send emails")
                .with_commands(vec!["send_email", "draft_email", "schedule_email"])
                .with_synonyms(vec!["email", "communication", "messaging"]),
            "web_search" => Skill::new("web_search", "Search the web for information")
                .with_commands(vec!["search", "browse", "summarize_page"])
                .with_synonyms(vec!["search", "research", "information"]),
            "data_analysis" => Skill::new("data_analysis", "Analyze data and generate insights")
                .with_commands(vec!["analyze", "visualize", "summarize"])
                .with_synonyms(vec!["analytics", "data", "statistics"]),
            custom => Skill::new(custom, &format!("Custom skill: {}", custom))
                .with_commands(vec![custom])
                .with_synonyms(vec![custom]),
        }
    }
}

fn clamp_confidence(confidence: f32) -> f32 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

/// How a profile entered the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileSource {
    /// Read from a manifest the agent published itself
    Declared,
    /// Found by search; did not answer a capability query
    Discovered,
    /// Answered a capability query
    Queried,
}

/// What the registry knows about one peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub peer: PeerRef,
    pub skills: Vec<Skill>,
    /// Unix milliseconds of the last discovery, query or manifest
    pub last_seen: u64,
    pub source: ProfileSource,
}

impl AgentProfile {
    pub fn new(peer: PeerRef, skills: Vec<Skill>, source: ProfileSource) -> Self {
        Self {
            peer,
            skills,
            last_seen: now_millis(),
            source,
        }
    }

    pub fn skill(&self, name: &str) -> Option<&Skill> {
        let name = normalize_name(name);
        self.skills.iter().find(|s| s.name == name)
    }

    /// Milliseconds since this profile was last refreshed.
    pub fn age_ms(&self) -> u64 {
        now_millis().saturating_sub(self.last_seen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skill_builder_normalizes() {
        let skill = Skill::new("  Code_Generation ", "writes code")
            .with_synonyms(vec!["Coding", "PROGRAMMING"])
            .with_confidence(1.7);

        assert_eq!(skill.name, "code_generation");
        assert_eq!(skill.synonyms, vec!["coding", "programming"]);
        assert_eq!(skill.confidence, 1.0);
        assert_eq!(Skill::new("x", "").with_confidence(-0.5).confidence, 0.0);
    }

    #[test]
    fn test_peer_skill_normalized() {
        let json = r#"{"name":"Web_Search","synonyms":["Research",""],"confidence":3.0}"#;
        let skill: Skill = serde_json::from_str(json).unwrap();
        let skill = skill.normalized();

        assert_eq!(skill.name, "web_search");
        assert_eq!(skill.synonyms, vec!["research"]);
        assert_eq!(skill.confidence, 1.0);
        assert!(skill.commands.is_empty());
    }

    #[test]
    fn test_standard_catalogue() {
        let skill = Skill::standard("code_generation");
        assert!(skill.synonyms.contains(&"coding".to_string()));
        assert_eq!(skill.commands, vec!["write_code", "refactor", "debug"]);

        let custom = Skill::standard("juggling");
        assert_eq!(custom.name, "juggling");
        assert_eq!(custom.commands, vec!["juggling"]);
        assert_eq!(custom.description, "Custom skill: juggling");
    }

    #[test]
    fn test_profile_skill_lookup() {
        let profile = AgentProfile::new(
            PeerRef::new("alpha"),
            vec![Skill::standard("web_search")],
            ProfileSource::Declared,
        );
        assert!(profile.skill("WEB_SEARCH").is_some());
        assert!(profile.skill("code_review").is_none());
    }
}
