use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use moltlink_core::{ChannelRef, MessageRef, PeerRef, RegistryConfig};
use moltlink_session::{Envelope, EnvelopeKind, Received, SessionEngine, SessionId};

use crate::definition::{normalize_name, now_millis, AgentProfile, ProfileSource, Skill};
use crate::error::Result;
use crate::taxonomy::Taxonomy;

/// Payloads the registry exchanges with peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryMessage {
    /// Ask a peer for its declared skills
    CapabilityQuery {
        #[serde(default)]
        query: Option<String>,
    },
    /// A peer's declared skills, as an answer or a public advertisement
    SkillManifest { agent: PeerRef, skills: Vec<Skill> },
}

/// A profile together with the skill that matched a lookup
#[derive(Debug, Clone, PartialEq)]
pub struct SkillMatch {
    pub profile: AgentProfile,
    pub skill: Skill,
}

/// Who can do what, as far as this agent knows.
///
/// Holds the local agent's own skills and at most one profile per remote peer.
pub struct SkillRegistry {
    engine: Arc<SessionEngine>,
    taxonomy: Taxonomy,
    config: RegistryConfig,
    local_skills: RwLock<Vec<Skill>>,
    profiles: DashMap<PeerRef, AgentProfile>,
}

impl SkillRegistry {
    pub fn new(engine: Arc<SessionEngine>, taxonomy: Taxonomy, config: RegistryConfig) -> Self {
        Self {
            engine,
            taxonomy,
            config,
            local_skills: RwLock::new(Vec::new()),
            profiles: DashMap::new(),
        }
    }

    pub fn local(&self) -> &PeerRef {
        self.engine.local()
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    pub fn engine(&self) -> &Arc<SessionEngine> {
        &self.engine
    }

    /// Add a skill to the local agent's advertised set, replacing any skill
    /// with the same name.
    pub fn register_skill(&self, skill: Skill) {
        let skill = skill.normalized();
        let mut skills = self.local_skills.write();
        match skills.iter_mut().find(|s| s.name == skill.name) {
            Some(existing) => *existing = skill,
            None => {
                info!("Registered local skill: {}", skill.name);
                skills.push(skill);
            }
        }
    }

    pub fn local_skills(&self) -> Vec<Skill> {
        self.local_skills.read().clone()
    }

    fn manifest(&self) -> RegistryMessage {
        RegistryMessage::SkillManifest {
            agent: self.local().clone(),
            skills: self.local_skills(),
        }
    }

    /// Insert or refresh the profile of `peer`.
    pub fn upsert_profile(&self, peer: PeerRef, skills: Vec<Skill>, source: ProfileSource) {
        if &peer == self.local() {
            return;
        }
        let skills: Vec<Skill> = skills.into_iter().map(Skill::normalized).collect();

        match self.profiles.entry(peer.clone()) {
            Entry::Occupied(mut entry) => {
                let profile = entry.get_mut();
                profile.skills = skills;
                profile.source = source;
                profile.last_seen = now_millis();
                debug!("Refreshed profile of {} ({:?})", peer, source);
            }
            Entry::Vacant(entry) => {
                debug!("New profile for {} ({:?}, {} skills)", peer, source, skills.len());
                entry.insert(AgentProfile::new(peer, skills, source));
            }
        }
    }

    pub fn profile(&self, peer: &PeerRef) -> Option<AgentProfile> {
        self.profiles.get(peer).map(|p| p.clone())
    }

    pub fn profiles(&self) -> Vec<AgentProfile> {
        let mut profiles: Vec<_> = self.profiles.iter().map(|p| p.value().clone()).collect();
        profiles.sort_by(|a, b| a.peer.cmp(&b.peer));
        profiles
    }

    /// Drop profiles not refreshed within the staleness threshold.
    pub fn evict_stale(&self) -> usize {
        let threshold = self.config.staleness_secs.saturating_mul(1000);
        let before = self.profiles.len();
        self.profiles.retain(|_, profile| profile.age_ms() <= threshold);
        let evicted = before.saturating_sub(self.profiles.len());
        if evicted > 0 {
            info!("Evicted {} stale profiles", evicted);
        }
        evicted
    }

    /// A profile is fresh when it carries an answer or manifest younger than
    /// the freshness window. Peers that never answered are always re-queried.
    fn is_fresh(&self, peer: &PeerRef) -> bool {
        self.profiles.get(peer).is_some_and(|profile| {
            profile.source != ProfileSource::Discovered
                && profile.age_ms() < self.config.freshness_secs.saturating_mul(1000)
        })
    }

    /// Find peers through transport search and query the ones lacking a fresh
    /// profile for their skills.
    pub async fn discover_agents(&self, query: Option<&str>) -> Result<Vec<AgentProfile>> {
        let query = query.unwrap_or(&self.config.default_query);
        let peers = self
            .engine
            .list_peers(query, self.config.search_limit)
            .await?;

        let stale: Vec<&PeerRef> = peers.iter().filter(|p| !self.is_fresh(p)).collect();
        debug!(
            "Search '{}' found {} peers, querying {}",
            query,
            peers.len(),
            stale.len()
        );

        join_all(stale.into_iter().map(|peer| self.query_peer(peer))).await;

        let found: Vec<AgentProfile> = peers.iter().filter_map(|p| self.profile(p)).collect();
        info!(
            "Discovered {} agents ({} with skills) for '{}'",
            found.len(),
            found.iter().filter(|p| !p.skills.is_empty()).count(),
            query
        );
        Ok(found)
    }

    async fn query_peer(&self, peer: &PeerRef) {
        match self.ask_for_skills(peer).await {
            Ok(Some(skills)) => self.upsert_profile(peer.clone(), skills, ProfileSource::Queried),
            Ok(None) => {
                debug!("{} did not answer the capability query", peer);
                self.record_unanswered(peer);
            }
            Err(e) => {
                warn!("Capability query to {} failed: {}", peer, e);
                self.record_unanswered(peer);
            }
        }
    }

    /// Unanswered peers are kept with no skills so a later discovery can
    /// upgrade them. An existing profile is left as it is.
    fn record_unanswered(&self, peer: &PeerRef) {
        if peer == self.local() {
            return;
        }
        self.profiles
            .entry(peer.clone())
            .or_insert_with(|| AgentProfile::new(peer.clone(), Vec::new(), ProfileSource::Discovered));
    }

    async fn ask_for_skills(&self, peer: &PeerRef) -> Result<Option<Vec<Skill>>> {
        let query = serde_json::to_value(RegistryMessage::CapabilityQuery { query: None })?;
        let session = self
            .engine
            .open_session(peer, EnvelopeKind::CapabilityQuery, query)
            .await?;

        let answer = self.await_answer(session, peer).await;
        self.engine.close(session);
        answer
    }

    async fn await_answer(&self, session: SessionId, peer: &PeerRef) -> Result<Option<Vec<Skill>>> {
        let timeout = self.config.capability_timeout();
        loop {
            let envelope = match self.engine.receive(session, timeout).await? {
                Received::Envelope(envelope) => envelope,
                Received::TimedOut | Received::Cancelled => return Ok(None),
            };
            if &envelope.sender != peer || envelope.kind != EnvelopeKind::CapabilityAnswer {
                debug!("Ignoring {} from {} in capability session", envelope.kind.label(), envelope.sender);
                continue;
            }
            match serde_json::from_value(envelope.payload) {
                Ok(RegistryMessage::SkillManifest { skills, .. }) => return Ok(Some(skills)),
                Ok(other) => debug!("Unexpected capability answer from {}: {:?}", peer, other),
                Err(e) => debug!("Unreadable capability answer from {}: {}", peer, e),
            }
        }
    }

    /// Known agents having `name`, best first. See [`SkillRegistry::match_skill`].
    pub fn find_agents_with_skill(&self, name: &str) -> Vec<AgentProfile> {
        self.match_skill(name).into_iter().map(|m| m.profile).collect()
    }

    /// Match `name` against known profiles.
    ///
    /// Exact skill names win; when nothing matches exactly, skills are matched
    /// case-insensitively against the taxonomy expansion of `name`, their
    /// synonyms, and substrings of their names. Results are ordered by
    /// descending confidence, then most recently seen.
    pub fn match_skill(&self, name: &str) -> Vec<SkillMatch> {
        let term = normalize_name(name);
        if term.is_empty() {
            return Vec::new();
        }

        let exact = self.collect_matches(|skill| skill.name == term);
        if !exact.is_empty() {
            return exact;
        }

        let terms = self.taxonomy.expand(&term);
        debug!("No exact match for '{}', trying {:?}", term, terms);
        self.collect_matches(|skill| fuzzy_matches(skill, &term, &terms))
    }

    fn collect_matches(&self, accepts: impl Fn(&Skill) -> bool) -> Vec<SkillMatch> {
        let local = self.local();
        let mut matches: Vec<SkillMatch> = self
            .profiles
            .iter()
            .filter(|entry| entry.key() != local)
            .filter_map(|entry| {
                let profile = entry.value();
                let best = profile
                    .skills
                    .iter()
                    .filter(|&skill| accepts(skill))
                    .max_by(|a, b| a.confidence.total_cmp(&b.confidence))?;
                Some(SkillMatch {
                    skill: best.clone(),
                    profile: profile.clone(),
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            b.skill
                .confidence
                .total_cmp(&a.skill.confidence)
                .then_with(|| b.profile.last_seen.cmp(&a.profile.last_seen))
                .then_with(|| a.profile.peer.cmp(&b.profile.peer))
        });
        matches
    }

    /// Answer a peer's `CapabilityQuery` with the local skills.
    pub async fn answer_query(&self, query: &Envelope) -> Result<MessageRef> {
        let answer = serde_json::to_value(self.manifest())?;
        let message = self
            .engine
            .reply(query, EnvelopeKind::CapabilityAnswer, 0, answer)
            .await?;
        debug!("Answered capability query from {}", query.sender);
        Ok(message)
    }

    /// Publish the local skills on the public channel.
    pub async fn advertise(&self) -> Result<SessionId> {
        let manifest = serde_json::to_value(self.manifest())?;
        let session = self.engine.broadcast(manifest).await?;
        // Nobody replies to a manifest.
        self.engine.close(session);
        info!(
            "Advertised {} skills on {}",
            self.local_skills.read().len(),
            ChannelRef::Public
        );
        Ok(session)
    }

    /// Read manifests other agents published and record them as declared
    /// profiles. Returns how many were ingested.
    pub async fn ingest_manifests(&self) -> Result<usize> {
        let inbound = self.engine.fetch_inbound(&ChannelRef::Public).await?;
        let mut ingested = 0;

        for envelope in inbound {
            if envelope.kind != EnvelopeKind::Broadcast {
                continue;
            }
            match serde_json::from_value::<RegistryMessage>(envelope.payload) {
                Ok(RegistryMessage::SkillManifest { skills, .. }) => {
                    self.upsert_profile(envelope.sender, skills, ProfileSource::Declared);
                    ingested += 1;
                }
                _ => debug!("Skipping public broadcast from {}", envelope.sender),
            }
        }

        if ingested > 0 {
            info!("Ingested {} skill manifests", ingested);
        }
        Ok(ingested)
    }

    /// Skill name to the agents known to have it.
    pub fn team_capabilities(&self) -> BTreeMap<String, Vec<PeerRef>> {
        let mut capabilities: BTreeMap<String, BTreeSet<PeerRef>> = BTreeMap::new();
        for entry in self.profiles.iter() {
            for skill in &entry.value().skills {
                capabilities
                    .entry(skill.name.clone())
                    .or_default()
                    .insert(entry.key().clone());
            }
        }
        capabilities
            .into_iter()
            .map(|(skill, peers)| (skill, peers.into_iter().collect()))
            .collect()
    }
}

fn fuzzy_matches(skill: &Skill, term: &str, terms: &BTreeSet<String>) -> bool {
    skill.identifiers().any(|id| terms.contains(id)) || skill.name.contains(term)
}

#[cfg(test)]
mod tests {
    use super::*;
    use moltlink_core::{MemoryTransport, RetryConfig, SessionConfig};

    fn registry_for(name: &str, feed: &Arc<MemoryTransport>) -> SkillRegistry {
        let engine = Arc::new(SessionEngine::new(
            PeerRef::new(name),
            feed.clone(),
            SessionConfig::default(),
            RetryConfig::default(),
        ));
        SkillRegistry::new(engine, Taxonomy::embedded().unwrap(), RegistryConfig::default())
    }

    fn registry() -> SkillRegistry {
        registry_for("me", &Arc::new(MemoryTransport::new()))
    }

    #[test]
    fn test_register_skill_is_idempotent_on_name() {
        let registry = registry();
        registry.register_skill(Skill::new("code_review", "first"));
        registry.register_skill(Skill::new("Code_Review", "second").with_confidence(0.4));

        let skills = registry.local_skills();
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].description, "second");
        assert_eq!(skills[0].confidence, 0.4);
    }

    #[test]
    fn test_one_profile_per_peer() {
        let registry = registry();
        let alpha = PeerRef::new("alpha");
        registry.upsert_profile(alpha.clone(), vec![Skill::standard("web_search")], ProfileSource::Declared);
        registry.upsert_profile(alpha.clone(), vec![Skill::standard("code_review")], ProfileSource::Queried);

        assert_eq!(registry.profiles().len(), 1);
        let profile = registry.profile(&alpha).unwrap();
        assert_eq!(profile.source, ProfileSource::Queried);
        assert_eq!(profile.skills.len(), 1);
        assert_eq!(profile.skills[0].name, "code_review");
    }

    #[test]
    fn test_local_agent_never_matched() {
        let registry = registry();
        registry.upsert_profile(PeerRef::new("me"), vec![Skill::standard("code_generation")], ProfileSource::Declared);
        assert!(registry.find_agents_with_skill("code_generation").is_empty());
        assert!(registry.profiles().is_empty());
    }

    #[test]
    fn test_exact_match_ordering() {
        let registry = registry();
        registry.upsert_profile(
            PeerRef::new("low"),
            vec![Skill::new("code_generation", "").with_confidence(0.5)],
            ProfileSource::Declared,
        );
        registry.upsert_profile(
            PeerRef::new("high"),
            vec![Skill::new("code_generation", "").with_confidence(0.9)],
            ProfileSource::Declared,
        );
        std::thread::sleep(std::time::Duration::from_millis(3));
        registry.upsert_profile(
            PeerRef::new("recent"),
            vec![Skill::new("code_generation", "").with_confidence(0.5)],
            ProfileSource::Declared,
        );

        let peers: Vec<String> = registry
            .find_agents_with_skill("code_generation")
            .into_iter()
            .map(|p| p.peer.to_string())
            .collect();
        assert_eq!(peers, vec!["high", "recent", "low"]);
    }

    #[test]
    fn test_fuzzy_match_through_taxonomy() {
        let registry = registry();
        registry.upsert_profile(
            PeerRef::new("by_name"),
            vec![Skill::new("code_generation", "")],
            ProfileSource::Declared,
        );
        registry.upsert_profile(
            PeerRef::new("by_synonym"),
            vec![Skill::new("backend", "").with_synonyms(vec!["code_generation"])],
            ProfileSource::Declared,
        );
        registry.upsert_profile(
            PeerRef::new("reviewer"),
            vec![Skill::new("code_review", "")],
            ProfileSource::Declared,
        );

        let mut peers: Vec<String> = registry
            .find_agents_with_skill("Coding")
            .into_iter()
            .map(|p| p.peer.to_string())
            .collect();
        peers.sort();
        assert_eq!(peers, vec!["by_name", "by_synonym"]);
    }

    #[test]
    fn test_exact_match_shadows_fuzzy() {
        let registry = registry();
        registry.upsert_profile(PeerRef::new("a"), vec![Skill::new("testing", "")], ProfileSource::Declared);
        registry.upsert_profile(
            PeerRef::new("b"),
            vec![Skill::new("integration_testing", "")],
            ProfileSource::Declared,
        );

        let exact = registry.match_skill("testing");
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].profile.peer, PeerRef::new("a"));

        // substring fallback when nothing matches exactly
        let fuzzy = registry.match_skill("integration");
        assert_eq!(fuzzy.len(), 1);
        assert_eq!(fuzzy[0].skill.name, "integration_testing");
    }

    #[test]
    fn test_evict_stale() {
        let feed = Arc::new(MemoryTransport::new());
        let engine = Arc::new(SessionEngine::new(
            PeerRef::new("me"),
            feed,
            SessionConfig::default(),
            RetryConfig::default(),
        ));
        let config = RegistryConfig {
            staleness_secs: 0,
            ..RegistryConfig::default()
        };
        let registry = SkillRegistry::new(engine, Taxonomy::embedded().unwrap(), config);
        registry.upsert_profile(PeerRef::new("old"), Vec::new(), ProfileSource::Discovered);
        std::thread::sleep(std::time::Duration::from_millis(5));

        assert_eq!(registry.evict_stale(), 1);
        assert!(registry.profiles().is_empty());
    }

    #[test]
    fn test_team_capabilities() {
        let registry = registry();
        registry.upsert_profile(
            PeerRef::new("alpha"),
            vec![Skill::standard("code_generation"), Skill::standard("code_review")],
            ProfileSource::Declared,
        );
        registry.upsert_profile(PeerRef::new("beta"), vec![Skill::standard("code_review")], ProfileSource::Queried);

        let team = registry.team_capabilities();
        assert_eq!(team["code_generation"], vec![PeerRef::new("alpha")]);
        assert_eq!(team["code_review"], vec![PeerRef::new("alpha"), PeerRef::new("beta")]);
    }

    #[test]
    fn test_registry_message_wire_shape() {
        let manifest = RegistryMessage::SkillManifest {
            agent: PeerRef::new("alpha"),
            skills: vec![Skill::new("web_search", "")],
        };
        let value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(value["type"], "skill_manifest");
        assert_eq!(value["agent"], "alpha");

        let query: RegistryMessage =
            serde_json::from_value(serde_json::json!({"type": "capability_query"})).unwrap();
        assert_eq!(query, RegistryMessage::CapabilityQuery { query: None });
    }
}
