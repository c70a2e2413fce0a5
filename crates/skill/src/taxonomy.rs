//! Canonical skill names and the synonyms they answer to.
//!
//! The mapping is versioned data, shipped as `taxonomy.json` and embedded at
//! build time. Fuzzy skill lookup is defined entirely in terms of it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::definition::normalize_name;
use crate::error::{Result, SkillError};

const EMBEDDED: &str = include_str!("taxonomy.json");

/// Highest taxonomy format this build understands
pub const TAXONOMY_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Taxonomy {
    pub version: u32,
    pub entries: BTreeMap<String, Vec<String>>,
}

impl Taxonomy {
    /// The taxonomy shipped with this crate.
    pub fn embedded() -> Result<Self> {
        Self::from_json_str(EMBEDDED)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: Taxonomy = serde_json::from_str(json)?;
        if raw.version == 0 || raw.version > TAXONOMY_VERSION {
            return Err(SkillError::InvalidTaxonomy(format!(
                "unsupported version {}",
                raw.version
            )));
        }

        let entries = raw
            .entries
            .into_iter()
            .map(|(canonical, synonyms)| {
                let synonyms = synonyms.iter().map(|s| normalize_name(s)).collect();
                (normalize_name(&canonical), synonyms)
            })
            .collect();

        Ok(Self {
            version: raw.version,
            entries,
        })
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Synonyms of a canonical skill.
    pub fn synonyms(&self, canonical: &str) -> &[String] {
        self.entries
            .get(&normalize_name(canonical))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Every canonical skill whose name equals or contains `term`, or that
    /// lists `term` as a synonym.
    pub fn canonical_for(&self, term: &str) -> Vec<&str> {
        let term = normalize_name(term);
        if term.is_empty() {
            return Vec::new();
        }

        self.entries
            .iter()
            .filter(|(canonical, synonyms)| {
                canonical.contains(&term) || synonyms.iter().any(|s| *s == term)
            })
            .map(|(canonical, _)| canonical.as_str())
            .collect()
    }

    /// The search terms a fuzzy lookup for `term` accepts: the term itself,
    /// the canonical skills it maps to, and, when `term` is canonical, its
    /// synonyms.
    pub fn expand(&self, term: &str) -> BTreeSet<String> {
        let term = normalize_name(term);
        let mut terms: BTreeSet<String> = self
            .canonical_for(&term)
            .into_iter()
            .map(str::to_string)
            .collect();
        terms.extend(self.synonyms(&term).iter().cloned());
        terms.insert(term);
        terms
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_taxonomy() {
        let taxonomy = Taxonomy::embedded().unwrap();
        assert_eq!(taxonomy.version, 1);
        assert_eq!(taxonomy.len(), 12);
        assert!(taxonomy.synonyms("code_generation").contains(&"coding".to_string()));
    }

    #[test]
    fn test_canonical_for() {
        let taxonomy = Taxonomy::embedded().unwrap();
        assert_eq!(taxonomy.canonical_for("Coding"), vec!["code_generation"]);
        assert_eq!(taxonomy.canonical_for("code"), vec!["code_generation", "code_review"]);
        assert_eq!(taxonomy.canonical_for("research"), vec!["data_analysis", "web_search"]);
        assert!(taxonomy.canonical_for("juggling").is_empty());
        assert!(taxonomy.canonical_for("  ").is_empty());
    }

    #[test]
    fn test_expand_canonical_term() {
        let taxonomy = Taxonomy::embedded().unwrap();
        let terms = taxonomy.expand("code_generation");
        assert!(terms.contains("code_generation"));
        assert!(terms.contains("programming"));
        assert!(!terms.contains("review"));
    }

    #[test]
    fn test_rejects_future_version() {
        let err = Taxonomy::from_json_str(r#"{"version":2,"entries":{}}"#).unwrap_err();
        assert!(matches!(err, SkillError::InvalidTaxonomy(_)));
    }

    #[test]
    fn test_entries_normalized() {
        let taxonomy =
            Taxonomy::from_json_str(r#"{"version":1,"entries":{"Poetry":["Verse"," rhyme "]}}"#)
                .unwrap();
        assert_eq!(taxonomy.synonyms("poetry"), ["verse", "rhyme"]);
        assert_eq!(taxonomy.canonical_for("RHYME"), vec!["poetry"]);
    }
}
