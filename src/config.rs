//! Engine configuration.
//!
//! Every field has a default, so a configuration file only needs the values
//! it changes. Layered settings go through [`EngineConfigOverrides`] and
//! [`EngineConfig::merge`].

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::chunk::RetryPolicy;
use crate::entry::CatalogFormat;
use crate::error::Result;
use crate::headers::DEFAULT_ADDRESS_POOL_SIZE;
use crate::learner::{DEFAULT_PERSIST_EVERY, DEFAULT_PROMOTION_THRESHOLD};
use crate::pattern::DEFAULT_RESULT_CAPACITY;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternCacheConfig {
    /// Maximum memoized test results
    pub result_capacity: usize,
}

impl Default for PatternCacheConfig {
    fn default() -> Self {
        Self {
            result_capacity: DEFAULT_RESULT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnerConfig {
    pub promotion_threshold: u64,
    pub persist_every: u64,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            promotion_threshold: DEFAULT_PROMOTION_THRESHOLD,
            persist_every: DEFAULT_PERSIST_EVERY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderConfig {
    /// Use mobile crawler user agents
    pub mobile: bool,
    pub address_pool_size: usize,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            mobile: false,
            address_pool_size: DEFAULT_ADDRESS_POOL_SIZE,
        }
    }
}

/// Configuration for a [`SiteEngine`](crate::SiteEngine).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pattern_cache: PatternCacheConfig,
    pub retry: RetryPolicy,
    pub learner: LearnerConfig,
    pub headers: HeaderConfig,
}

impl EngineConfig {
    /// Parse a JSON or YAML document.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(match CatalogFormat::sniff(text.as_bytes()) {
            CatalogFormat::Json => serde_json::from_str(text)?,
            CatalogFormat::Yaml => serde_yaml::from_str(text)?,
        })
    }

    /// Load a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::parse(&fs::read_to_string(path)?)
    }

    /// Apply every override that is set.
    pub fn merge(mut self, overrides: &EngineConfigOverrides) -> Self {
        fn set<T: Clone>(slot: &mut T, value: &Option<T>) {
            if let Some(v) = value {
                *slot = v.clone();
            }
        }

        set(
            &mut self.pattern_cache.result_capacity,
            &overrides.result_capacity,
        );
        set(&mut self.retry.max_attempts, &overrides.max_attempts);
        set(&mut self.retry.initial_delay_ms, &overrides.initial_delay_ms);
        set(&mut self.retry.multiplier, &overrides.multiplier);
        set(&mut self.retry.max_delay_ms, &overrides.max_delay_ms);
        set(
            &mut self.learner.promotion_threshold,
            &overrides.promotion_threshold,
        );
        set(&mut self.learner.persist_every, &overrides.persist_every);
        set(&mut self.headers.mobile, &overrides.mobile);
        set(
            &mut self.headers.address_pool_size,
            &overrides.address_pool_size,
        );
        self
    }
}

/// Partial configuration: only the fields that are `Some` are applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfigOverrides {
    pub result_capacity: Option<usize>,
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub multiplier: Option<f64>,
    pub max_delay_ms: Option<u64>,
    pub promotion_threshold: Option<u64>,
    pub persist_every: Option<u64>,
    pub mobile: Option<bool>,
    pub address_pool_size: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.pattern_cache.result_capacity, 1000);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_delay_ms, 100);
        assert_eq!(config.learner.promotion_threshold, 5);
        assert_eq!(config.learner.persist_every, 10);
        assert_eq!(config.headers.address_pool_size, 10);
        assert!(!config.headers.mobile);
    }

    #[test]
    fn test_partial_yaml() {
        let config = EngineConfig::parse(
            r#"
retry:
  max_attempts: 5
headers:
  mobile: true
"#,
        )
        .unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay_ms, 100);
        assert!(config.headers.mobile);
        assert_eq!(config.headers.address_pool_size, 10);
    }

    #[test]
    fn test_json() {
        let config = EngineConfig::parse(r#"{"learner": {"promotion_threshold": 2}}"#).unwrap();
        assert_eq!(config.learner.promotion_threshold, 2);
        assert_eq!(config.learner.persist_every, 10);
    }

    #[test]
    fn test_merge_applies_only_set_fields() {
        let overrides = EngineConfigOverrides {
            result_capacity: Some(50),
            mobile: Some(true),
            ..Default::default()
        };
        let merged = EngineConfig::default().merge(&overrides);
        assert_eq!(merged.pattern_cache.result_capacity, 50);
        assert!(merged.headers.mobile);
        assert_eq!(merged.retry, RetryPolicy::default());
        assert_eq!(merged.learner, LearnerConfig::default());

        let unchanged = EngineConfig::default().merge(&EngineConfigOverrides::default());
        assert_eq!(unchanged, EngineConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        fs::write(&path, "pattern_cache:\n  result_capacity: 7\n").unwrap();
        assert_eq!(
            EngineConfig::load(&path).unwrap().pattern_cache.result_capacity,
            7
        );
    }
}
