//! The request-facing facade.

use std::borrow::Cow;
use std::sync::Arc;

use crate::chunk::{ChunkLoader, ChunkManifest, ChunkSource};
use crate::config::EngineConfig;
use crate::entry::{ConfigEntry, CookiePolicy};
use crate::headers::{Header, HeaderRuleEngine};
use crate::index::DomainIndex;
use crate::learner::{UsageLearner, UsageStore};
use crate::pattern::PatternCache;

/// Wires the pattern cache, domain index, header rules, chunk loader and
/// usage learner together.
///
/// Per navigation call [`resolve`](SiteEngine::resolve); per request call
/// [`should_block`](SiteEngine::should_block) and
/// [`apply_headers`](SiteEngine::apply_headers).
///
/// # Example
///
/// ```ignore
/// use siteindex::{ChunkManifest, EngineConfig, FileChunkSource, SiteEngine};
/// use std::sync::Arc;
///
/// let engine = SiteEngine::new(EngineConfig::default()).with_chunks(
///     ChunkManifest::load("chunks/manifest.json")?,
///     Arc::new(FileChunkSource::new("chunks")),
/// );
///
/// if engine.resolve("nytimes.com").await {
///     let blocked = engine.should_block("nytimes.com", "https://px.tinypass.com/x");
/// }
/// ```
pub struct SiteEngine {
    config: EngineConfig,
    index: Arc<DomainIndex>,
    headers: HeaderRuleEngine,
    loader: Option<Arc<ChunkLoader>>,
    learner: UsageLearner,
}

impl SiteEngine {
    /// Create an engine with an empty index.
    pub fn new(config: EngineConfig) -> Self {
        let patterns = Arc::new(PatternCache::new(config.pattern_cache.result_capacity));
        Self {
            index: Arc::new(DomainIndex::new(patterns)),
            headers: HeaderRuleEngine::new(config.headers.address_pool_size),
            loader: None,
            learner: UsageLearner::new(
                config.learner.promotion_threshold,
                config.learner.persist_every,
            ),
            config,
        }
    }

    /// Create an engine with a resident catalog.
    pub fn with_catalog<I>(config: EngineConfig, entries: I) -> Self
    where
        I: IntoIterator<Item = ConfigEntry>,
    {
        let engine = Self::new(config);
        engine.build(entries);
        engine
    }

    /// Load partitions on demand from `source`.
    pub fn with_chunks(mut self, manifest: ChunkManifest, source: Arc<dyn ChunkSource>) -> Self {
        self.loader = Some(Arc::new(ChunkLoader::new(
            manifest,
            source,
            Arc::clone(&self.index),
            self.config.retry.clone(),
        )));
        self
    }

    /// Persist usage counts through `store`, restoring what it holds.
    pub fn with_usage_store(mut self, store: Arc<dyn UsageStore>) -> Self {
        self.learner = UsageLearner::new(
            self.config.learner.promotion_threshold,
            self.config.learner.persist_every,
        )
        .with_store(store);
        self
    }

    /// Merge entries into the index and refresh header rules.
    pub fn build<I>(&self, entries: I)
    where
        I: IntoIterator<Item = ConfigEntry>,
    {
        self.index.build(entries);
        self.refresh_headers();
    }

    /// Handle a navigation to `domain`.
    ///
    /// Records the visit and loads the owning partition if needed. Returns
    /// whether the domain has configuration afterwards.
    pub async fn resolve(&self, domain: &str) -> bool {
        self.learner.track_visit(domain);

        let found = if self.index.contains(domain) {
            true
        } else if let Some(loader) = &self.loader {
            loader.ensure_loaded(domain).await && self.index.contains(domain)
        } else {
            false
        };

        self.refresh_headers();
        found
    }

    /// Load the partitions of promoted domains.
    pub async fn warm_promoted(&self) -> usize {
        let promoted = self.learner.promoted();
        let loaded = match &self.loader {
            Some(loader) if !promoted.is_empty() => loader.preload(&promoted).await,
            _ => 0,
        };
        self.refresh_headers();
        loaded
    }

    pub fn should_block(&self, domain: &str, url: &str) -> bool {
        self.index.should_block(domain, url)
    }

    pub fn apply_headers<'a>(&self, domain: &str, headers: &'a [Header]) -> Cow<'a, [Header]> {
        self.headers.apply_headers(domain, headers)
    }

    pub fn lookup(&self, domain: &str) -> Option<Arc<ConfigEntry>> {
        self.index.lookup(domain)
    }

    /// Resolve a hostname through its parent domains.
    pub fn lookup_host(&self, host: &str) -> Option<(String, Arc<ConfigEntry>)> {
        self.index.lookup_host(host)
    }

    pub fn cookie_policy(&self, domain: &str) -> Option<CookiePolicy> {
        self.index.cookie_policy(domain)
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.index.contains(domain)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<DomainIndex> {
        &self.index
    }

    pub fn header_rules(&self) -> &HeaderRuleEngine {
        &self.headers
    }

    pub fn loader(&self) -> Option<&Arc<ChunkLoader>> {
        self.loader.as_ref()
    }

    pub fn learner(&self) -> &UsageLearner {
        &self.learner
    }

    /// Rebuild header rules if the index changed since the last build.
    fn refresh_headers(&self) {
        if self.headers.built_generation() != self.index.generation() {
            self.headers
                .build_rules(&self.index, self.config.headers.mobile);
        }
    }
}
