//! siteindex - Per-site request rules with O(1) lookups and lazy loading.
//!
//! This crate turns a large catalog of per-site configuration entries into
//! lookup structures that answer, for every request a client makes, whether a
//! sub-resource should be blocked and how request headers should be rewritten.
//!
//! # Features
//!
//! - **Domain index**: O(1) domain and group lookups, additive merges
//! - **Pattern cache**: block patterns compiled once, results memoized
//! - **Header rules**: user agent, referer and synthetic origin rewrites,
//!   precomputed per domain
//! - **Lazy loading**: catalog partitions fetched on demand, with coalesced
//!   requests, bounded retries and a full-catalog fallback
//! - **Usage learning**: frequently visited domains are promoted so their
//!   partitions can be kept resident
//!
//! # Quick Start
//!
//! ```ignore
//! use siteindex::{parse_catalog, CatalogFormat, EngineConfig, SiteEngine};
//!
//! let entries = parse_catalog(&std::fs::read_to_string("sites.json")?, CatalogFormat::Json)?;
//! let engine = SiteEngine::with_catalog(EngineConfig::default(), entries);
//!
//! engine.resolve("nytimes.com").await;
//! assert!(engine.should_block("nytimes.com", "https://px.tinypass.com/xyz"));
//!
//! let headers = vec![("User-Agent".to_string(), "Firefox".to_string())];
//! let rewritten = engine.apply_headers("nytimes.com", &headers);
//! ```
//!
//! # Lazy Loading
//!
//! With a [`ChunkManifest`] the catalog does not need to be resident up front:
//!
//! ```ignore
//! use siteindex::{ChunkManifest, EngineConfig, HttpChunkSource, SiteEngine};
//! use std::sync::Arc;
//!
//! let engine = SiteEngine::new(EngineConfig::default()).with_chunks(
//!     ChunkManifest::load("manifest.json")?,
//!     Arc::new(HttpChunkSource::new("https://cdn.example.com/sites")?),
//! );
//!
//! // Fetches the partition owning example.in on first use
//! assert!(engine.resolve("example.in").await);
//! ```

mod config;
mod engine;
mod entry;
mod error;

pub mod chunk;
pub mod headers;
pub mod index;
pub mod learner;
pub mod pattern;

// Re-export core types
pub use config::{
    EngineConfig, EngineConfigOverrides, HeaderConfig, LearnerConfig, PatternCacheConfig,
};
pub use engine::SiteEngine;
pub use entry::{
    expand_referer, normalize_domain, parse_catalog, parse_catalog_bytes, BotAgent,
    CatalogFormat, ConfigEntry, CookiePolicy, UserAgentOverride, COMMENT_SENTINEL,
};
pub use error::{Error, PartitionLoadError, PatternCompileError, PersistenceError, Result};

// Re-export component types
pub use chunk::{
    ChunkLoader, ChunkManifest, ChunkSource, FileChunkSource, HttpChunkSource, PartitionStatus,
    RetryPolicy,
};
pub use headers::{Header, HeaderRule, HeaderRuleEngine};
pub use index::DomainIndex;
pub use learner::{JsonFileStore, MemoryStore, UsageLearner, UsageSnapshot, UsageStore};
pub use pattern::{CacheStats, Matcher, PatternCache, PatternSpec};
