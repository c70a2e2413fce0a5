use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{CoreError, Result};

/// Polling and buffering knobs of the session engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Base interval between two polls of the same channel
    pub poll_interval_ms: u64,
    /// Uniform jitter added to or removed from each poll interval
    pub poll_jitter_ms: u64,
    /// Raw message ids remembered for de-duplication
    pub seen_capacity: usize,
    /// How long a sequence gap may block delivery before a forced flush
    pub reorder_timeout_ms: u64,
    /// Inbound envelopes kept while nobody fetches them
    pub inbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            poll_jitter_ms: 500,
            seen_capacity: 4_096,
            reorder_timeout_ms: 10_000,
            inbound_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reorder_timeout(&self) -> Duration {
        Duration::from_millis(self.reorder_timeout_ms)
    }
}

/// Backoff policy for transport failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per call before `Unavailable` is surfaced
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Minimum wait after a quota rejection
    pub rate_limit_delay_ms: u64,
    /// Quota rejections tolerated per call
    pub max_rate_limit_waits: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 250,
            max_delay_ms: 8_000,
            rate_limit_delay_ms: 5_000,
            max_rate_limit_waits: 6,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), doubling and capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    pub fn rate_limit_wait(&self, retry_after_ms: Option<u64>) -> Duration {
        Duration::from_millis(retry_after_ms.unwrap_or(0).max(self.rate_limit_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Peers requested from a single search
    pub search_limit: usize,
    /// Wait for one peer's capability answer
    pub capability_timeout_ms: u64,
    /// Profiles younger than this are not re-queried
    pub freshness_secs: u64,
    /// Profiles older than this are evicted
    pub staleness_secs: u64,
    /// Search query used when discovery is called without one
    pub default_query: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            search_limit: 25,
            capability_timeout_ms: 30_000,
            freshness_secs: 600,
            staleness_secs: 86_400,
            default_query: "agent".to_string(),
        }
    }
}

impl RegistryConfig {
    pub fn capability_timeout(&self) -> Duration {
        Duration::from_millis(self.capability_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationConfig {
    /// How long a sent delegation waits for its reply
    pub timeout_ms: u64,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self { timeout_ms: 300_000 }
    }
}

impl DelegationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Full configuration of one agent's protocol stack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub session: SessionConfig,
    pub retry: RetryConfig,
    pub registry: RegistryConfig,
    pub delegation: DelegationConfig,
}

impl ProtocolConfig {
    /// Parse a (possibly partial) JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Override fields from `MOLTLINK_*` environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| CoreError::InvalidConfig(format!("{} is not a number: {:?}", key, value)))
        }

        macro_rules! number {
            ($key:literal, $field:expr) => {
                if let Some(value) = lookup($key) {
                    $field = parse($key, value)?;
                }
            };
        }

        number!("MOLTLINK_POLL_INTERVAL_MS", self.session.poll_interval_ms);
        number!("MOLTLINK_POLL_JITTER_MS", self.session.poll_jitter_ms);
        number!("MOLTLINK_SEEN_CAPACITY", self.session.seen_capacity);
        number!("MOLTLINK_REORDER_TIMEOUT_MS", self.session.reorder_timeout_ms);
        number!("MOLTLINK_RETRY_MAX_ATTEMPTS", self.retry.max_attempts);
        number!("MOLTLINK_RETRY_BASE_DELAY_MS", self.retry.base_delay_ms);
        number!("MOLTLINK_RATE_LIMIT_DELAY_MS", self.retry.rate_limit_delay_ms);
        number!("MOLTLINK_SEARCH_LIMIT", self.registry.search_limit);
        number!("MOLTLINK_CAPABILITY_TIMEOUT_MS", self.registry.capability_timeout_ms);
        number!("MOLTLINK_STALENESS_SECS", self.registry.staleness_secs);
        number!("MOLTLINK_DELEGATION_TIMEOUT_MS", self.delegation.timeout_ms);

        if let Some(query) = lookup("MOLTLINK_DEFAULT_QUERY") {
            self.registry.default_query = query;
        }

        self.validate()
    }

    /// Reject values that would make a wait unbounded or a loop spin.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.session.poll_interval_ms == 0, "session.poll_interval_ms must be > 0"),
            (self.session.seen_capacity == 0, "session.seen_capacity must be > 0"),
            (self.session.inbound_capacity == 0, "session.inbound_capacity must be > 0"),
            (self.retry.max_attempts == 0, "retry.max_attempts must be > 0"),
            (self.registry.capability_timeout_ms == 0, "registry.capability_timeout_ms must be > 0"),
            (self.delegation.timeout_ms == 0, "delegation.timeout_ms must be > 0"),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(CoreError::InvalidConfig(message.to_string())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_json_takes_defaults() {
        let config =
            ProtocolConfig::from_json_str(r#"{"session": {"poll_interval_ms": 50}}"#).unwrap();
        assert_eq!(config.session.poll_interval_ms, 50);
        assert_eq!(config.session.seen_capacity, 4_096);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = ProtocolConfig::from_json_str(r#"{"delegation": {"timeout_ms": 0}}"#);
        assert!(matches!(err, Err(CoreError::InvalidConfig(_))));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("MOLTLINK_POLL_INTERVAL_MS", "25"),
            ("MOLTLINK_DELEGATION_TIMEOUT_MS", "1000"),
            ("MOLTLINK_DEFAULT_QUERY", "coder"),
        ]
        .into_iter()
        .collect();

        let mut config = ProtocolConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.session.poll_interval_ms, 25);
        assert_eq!(config.delegation.timeout_ms, 1_000);
        assert_eq!(config.registry.default_query, "coder");
    }

    #[test]
    fn test_bad_override_rejected() {
        let mut config = ProtocolConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "MOLTLINK_SEARCH_LIMIT").then(|| "lots".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryConfig {
            base_delay_ms: 100,
            max_delay_ms: 350,
            ..RetryConfig::default()
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(350));
        assert_eq!(retry.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn test_rate_limit_wait_has_floor() {
        let retry = RetryConfig {
            rate_limit_delay_ms: 500,
            ..RetryConfig::default()
        };
        assert_eq!(retry.rate_limit_wait(None), Duration::from_millis(500));
        assert_eq!(retry.rate_limit_wait(Some(100)), Duration::from_millis(500));
        assert_eq!(retry.rate_limit_wait(Some(900)), Duration::from_millis(900));
    }
}
