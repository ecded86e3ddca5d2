//! O(1) domain to configuration index.

use ahash::{AHashMap, AHashSet};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::entry::{normalize_domain, ConfigEntry, CookiePolicy, UserAgentOverride};
use crate::pattern::{Matcher, PatternCache};

#[derive(Default)]
struct IndexTables {
    /// Single-domain entries
    direct: AHashMap<String, Arc<ConfigEntry>>,
    /// Group member domain -> entry name
    groups: AHashMap<String, String>,
    /// Entry name -> shared group entry
    shared: AHashMap<String, Arc<ConfigEntry>>,
    /// Union of every registered domain
    domains: AHashSet<String>,
    user_agents: AHashMap<String, UserAgentOverride>,
    cookies: AHashMap<String, CookiePolicy>,
    block_patterns: AHashMap<String, Vec<Arc<Matcher>>>,
}

impl IndexTables {
    /// Pin members of a re-registered group that the new definition no
    /// longer lists to the definition that did list them.
    fn detach_stale_members(&mut self, previous: &Arc<ConfigEntry>, current: &[String]) {
        for domain in previous.domains() {
            if current.contains(&domain) || self.groups.get(&domain) != Some(&previous.name) {
                continue;
            }
            self.groups.remove(&domain);
            if !self.direct.contains_key(&domain) {
                log::debug!("Detaching {} from group {:?}", domain, previous.name);
                self.direct.insert(domain, Arc::clone(previous));
            }
        }
    }
}

/// Counts reported by [`DomainIndex::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub domains: usize,
    pub direct: usize,
    pub grouped: usize,
    pub shared_entries: usize,
    pub with_block_patterns: usize,
}

/// Index from domain to catalog entry and derived feature tables.
///
/// Builds are additive: indexing a new partition never removes domains that
/// are already present. When a group name is registered again, the newest
/// definition owns the name; members it no longer lists keep resolving to the
/// definition that listed them. [`DomainIndex::clear`] drops everything.
pub struct DomainIndex {
    tables: RwLock<IndexTables>,
    patterns: Arc<PatternCache>,
    /// Bumped on every build or clear.
    generation: AtomicU64,
}

impl DomainIndex {
    /// Create an empty index compiling block patterns through `patterns`.
    pub fn new(patterns: Arc<PatternCache>) -> Self {
        Self {
            tables: RwLock::new(IndexTables::default()),
            patterns,
            generation: AtomicU64::new(0),
        }
    }

    /// The pattern cache used for block patterns.
    pub fn patterns(&self) -> &Arc<PatternCache> {
        &self.patterns
    }

    /// Merge entries into the index.
    pub fn build<I>(&self, entries: I)
    where
        I: IntoIterator<Item = ConfigEntry>,
    {
        let start = Instant::now();
        let mut tables = self.tables.write();
        let mut indexed = 0usize;

        for entry in entries {
            if entry.is_comment() {
                continue;
            }

            let domains = entry.domains();
            let entry = Arc::new(entry);

            if !entry.group.is_empty() {
                if let Some(previous) = tables
                    .shared
                    .insert(entry.name.clone(), Arc::clone(&entry))
                {
                    tables.detach_stale_members(&previous, &domains);
                }
                for domain in &domains {
                    tables.groups.insert(domain.clone(), entry.name.clone());
                }
            } else if let Some(domain) = domains.first() {
                tables.direct.insert(domain.clone(), Arc::clone(&entry));
            }

            let matchers: Vec<Arc<Matcher>> = entry
                .block_patterns
                .iter()
                .filter_map(|spec| match self.patterns.compile(spec) {
                    Ok(m) => Some(m),
                    Err(e) => {
                        log::debug!("Skipping block pattern for {:?}: {}", entry.name, e);
                        None
                    }
                })
                .collect();

            for domain in domains {
                if let Some(ua) = &entry.user_agent {
                    tables.user_agents.insert(domain.clone(), ua.clone());
                }
                if let Some(policy) = &entry.cookies {
                    tables.cookies.insert(domain.clone(), policy.clone());
                }
                if !matchers.is_empty() {
                    let list = tables.block_patterns.entry(domain.clone()).or_default();
                    for matcher in &matchers {
                        if !list.iter().any(|m| m.id() == matcher.id()) {
                            list.push(Arc::clone(matcher));
                        }
                    }
                }
                tables.domains.insert(domain);
                indexed += 1;
            }
        }

        drop(tables);
        self.generation.fetch_add(1, Ordering::SeqCst);
        log::debug!(
            "Indexed {} domains in {:?} ({} total)",
            indexed,
            start.elapsed(),
            self.len()
        );
    }

    /// Resolve a domain to its entry: direct first, then group.
    pub fn lookup(&self, domain: &str) -> Option<Arc<ConfigEntry>> {
        let domain = normalize_domain(domain);
        let tables = self.tables.read();
        if let Some(entry) = tables.direct.get(&domain) {
            return Some(Arc::clone(entry));
        }
        tables
            .groups
            .get(&domain)
            .and_then(|name| tables.shared.get(name))
            .map(Arc::clone)
    }

    /// Resolve a hostname, falling back to its parent domains.
    ///
    /// Returns the registered domain that matched along with its entry.
    pub fn lookup_host(&self, host: &str) -> Option<(String, Arc<ConfigEntry>)> {
        let host = normalize_domain(host);
        let mut current = host.as_str();
        loop {
            if self.contains(current) {
                return self.lookup(current).map(|e| (current.to_string(), e));
            }
            match current.find('.') {
                Some(pos) => current = &current[pos + 1..],
                None => return None,
            }
        }
    }

    /// O(1) presence check.
    pub fn contains(&self, domain: &str) -> bool {
        self.tables.read().domains.contains(&normalize_domain(domain))
    }

    /// Whether a request for `url` made on `domain` should be blocked.
    pub fn should_block(&self, domain: &str, url: &str) -> bool {
        let matchers = {
            let tables = self.tables.read();
            match tables.block_patterns.get(&normalize_domain(domain)) {
                Some(list) if !list.is_empty() => list.clone(),
                _ => return false,
            }
        };
        matchers.iter().any(|m| self.patterns.test_matcher(m, url))
    }

    /// User agent override registered for a domain.
    pub fn user_agent(&self, domain: &str) -> Option<UserAgentOverride> {
        self.tables
            .read()
            .user_agents
            .get(&normalize_domain(domain))
            .cloned()
    }

    /// Cookie policy registered for a domain.
    pub fn cookie_policy(&self, domain: &str) -> Option<CookiePolicy> {
        self.tables
            .read()
            .cookies
            .get(&normalize_domain(domain))
            .cloned()
    }

    /// Number of compiled block patterns for a domain.
    pub fn block_pattern_count(&self, domain: &str) -> usize {
        self.tables
            .read()
            .block_patterns
            .get(&normalize_domain(domain))
            .map_or(0, Vec::len)
    }

    /// Snapshot of every registered domain.
    pub fn domains(&self) -> Vec<String> {
        self.tables.read().domains.iter().cloned().collect()
    }

    /// Number of registered domains.
    pub fn len(&self) -> usize {
        self.tables.read().domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter bumped by every build or clear.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> IndexStats {
        let tables = self.tables.read();
        IndexStats {
            domains: tables.domains.len(),
            direct: tables.direct.len(),
            grouped: tables.groups.len(),
            shared_entries: tables.shared.len(),
            with_block_patterns: tables.block_patterns.len(),
        }
    }

    /// Drop every indexed domain. Compiled patterns stay in the cache.
    pub fn clear(&self) {
        *self.tables.write() = IndexTables::default();
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::BotAgent;

    fn index() -> DomainIndex {
        DomainIndex::new(Arc::new(PatternCache::default()))
    }

    fn nyt() -> ConfigEntry {
        ConfigEntry::new("nyt", "nytimes.com").with_block_pattern(r"\.tinypass\.com/")
    }

    #[test]
    fn test_block_scenario() {
        let index = index();
        index.build(vec![nyt()]);

        assert!(index.should_block("nytimes.com", "https://px.tinypass.com/xyz"));
        assert!(!index.should_block("nytimes.com", "https://nytimes.com/article"));
        assert!(!index.should_block("unknown.com", "https://px.tinypass.com/xyz"));
    }

    #[test]
    fn test_group_resolution_shares_entry() {
        let index = index();
        index.build(vec![ConfigEntry::group("pair", ["a.com", "b.com"])]);

        let a = index.lookup("a.com").unwrap();
        let b = index.lookup("b.com").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(index.stats().shared_entries, 1);
    }

    #[test]
    fn test_direct_wins_over_group() {
        let index = index();
        index.build(vec![
            ConfigEntry::group("pair", ["a.com", "b.com"]),
            ConfigEntry::new("solo", "a.com"),
        ]);
        assert_eq!(index.lookup("a.com").unwrap().name, "solo");
        assert_eq!(index.lookup("b.com").unwrap().name, "pair");
    }

    #[test]
    fn test_comment_entries_skipped() {
        let index = index();
        index.build(vec![ConfigEntry::new("section", "###_de"), nyt()]);
        assert_eq!(index.len(), 1);
        assert!(!index.contains("###_de"));
    }

    #[test]
    fn test_build_is_idempotent() {
        let catalog = vec![
            nyt(),
            ConfigEntry::group("pair", ["a.com", "b.com"]).with_block_pattern("ads"),
        ];
        let index = index();
        index.build(catalog.clone());
        let once = index.stats();
        index.build(catalog);

        assert_eq!(index.stats(), once);
        assert_eq!(index.block_pattern_count("nytimes.com"), 1);
        assert_eq!(index.block_pattern_count("a.com"), 1);
    }

    #[test]
    fn test_merge_is_additive() {
        let index = index();
        index.build(vec![nyt()]);
        index.build(vec![ConfigEntry::new("ex", "example.in")]);

        assert!(index.contains("nytimes.com"));
        assert!(index.contains("example.in"));
        assert!(index.should_block("nytimes.com", "https://px.tinypass.com/xyz"));
    }

    #[test]
    fn test_patterns_accumulate_across_builds() {
        let index = index();
        index.build(vec![nyt()]);
        index.build(vec![ConfigEntry::new("nyt", "nytimes.com").with_block_pattern("meter")]);

        assert_eq!(index.block_pattern_count("nytimes.com"), 2);
        assert!(index.should_block("nytimes.com", "https://meter.svc/x"));
        assert!(index.should_block("nytimes.com", "https://px.tinypass.com/xyz"));
    }

    #[test]
    fn test_invalid_pattern_skipped() {
        let index = index();
        index.build(vec![ConfigEntry::new("bad", "bad.com")
            .with_block_pattern("([")
            .with_block_pattern("tracker")]);
        assert_eq!(index.block_pattern_count("bad.com"), 1);
        assert!(index.should_block("bad.com", "https://tracker.io/"));
        assert!(index.contains("bad.com"));
    }

    #[test]
    fn test_feature_tables() {
        let index = index();
        index.build(vec![ConfigEntry::new("x", "x.com")
            .with_user_agent(UserAgentOverride::Bot(BotAgent::Googlebot))
            .with_cookies(CookiePolicy::Remove)]);

        assert_eq!(
            index.user_agent("X.com"),
            Some(UserAgentOverride::Bot(BotAgent::Googlebot))
        );
        assert_eq!(index.cookie_policy("x.com"), Some(CookiePolicy::Remove));
        assert_eq!(index.cookie_policy("y.com"), None);
    }

    #[test]
    fn test_lookup_host_walks_parents() {
        let index = index();
        index.build(vec![nyt()]);

        let (domain, entry) = index.lookup_host("www.NYTimes.com").unwrap();
        assert_eq!(domain, "nytimes.com");
        assert_eq!(entry.name, "nyt");
        assert!(index.lookup_host("nytimes.org").is_none());
    }

    #[test]
    fn test_regrouped_name_keeps_stale_members_consistent() {
        let index = index();
        index.build(vec![ConfigEntry::group("pair", ["a.com", "b.com", "d.com"])
            .with_user_agent(UserAgentOverride::Bot(BotAgent::Bingbot))]);
        index.build(vec![ConfigEntry::new("solo", "d.com")]);
        index.build(vec![ConfigEntry::group("pair", ["b.com", "c.com"])
            .with_user_agent(UserAgentOverride::Bot(BotAgent::Googlebot))]);

        // b.com and c.com share the new definition.
        let b = index.lookup("b.com").unwrap();
        let c = index.lookup("c.com").unwrap();
        assert!(Arc::ptr_eq(&b, &c));
        assert_eq!(b.group, vec!["b.com".to_string(), "c.com".to_string()]);
        assert_eq!(
            index.user_agent("c.com"),
            Some(UserAgentOverride::Bot(BotAgent::Googlebot))
        );

        // a.com stays indexed under the definition that listed it.
        assert!(index.contains("a.com"));
        let a = index.lookup("a.com").unwrap();
        assert!(a.group.contains(&"a.com".to_string()));
        assert_eq!(a.user_agent, Some(UserAgentOverride::Bot(BotAgent::Bingbot)));
        assert_eq!(
            index.user_agent("a.com"),
            Some(UserAgentOverride::Bot(BotAgent::Bingbot))
        );

        // A direct entry is left alone.
        assert_eq!(index.lookup("d.com").unwrap().name, "solo");
    }

    #[test]
    fn test_clear_and_generation() {
        let index = index();
        let g0 = index.generation();
        index.build(vec![nyt()]);
        assert!(index.generation() > g0);

        index.clear();
        assert!(index.is_empty());
        assert!(index.lookup("nytimes.com").is_none());
        assert_eq!(index.patterns().stats().compiled, 1);
    }
}
