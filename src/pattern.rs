//! Compiled block patterns and the memoizing pattern cache.
//!
//! Compiled matchers are kept for the lifetime of the cache. Test results are
//! memoized per (matcher, subject) pair in a bounded table that evicts in
//! insertion order.

use ahash::AHashMap;
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::PatternCompileError;

/// Default bound on memoized test results.
pub const DEFAULT_RESULT_CAPACITY: usize = 1000;

/// Flags a delimited regex literal may carry.
const LITERAL_FLAGS: &str = "dgimsuy";

/// Whether `body` contains a `/` that would have ended a regex literal.
fn has_unescaped_slash(body: &str) -> bool {
    let mut escaped = false;
    let mut in_class = false;
    for c in body.chars() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '[' => in_class = true,
            ']' => in_class = false,
            '/' if !in_class => return true,
            _ => {}
        }
    }
    false
}

/// A pattern source plus its flags.
///
/// Flags follow the usual single-letter convention: `i` (case-insensitive),
/// `m` (multi-line), `s` (dot matches newline). Unknown flags are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatternSpec {
    source: String,
    flags: String,
}

impl PatternSpec {
    /// Create a spec from a raw source and flags.
    pub fn new(source: impl Into<String>, flags: &str) -> Self {
        let mut chars: Vec<char> = flags.chars().filter(|c| "ims".contains(*c)).collect();
        chars.sort_unstable();
        chars.dedup();
        Self {
            source: source.into(),
            flags: chars.into_iter().collect(),
        }
    }

    /// Parse a pattern as written in a catalog.
    ///
    /// Accepts either a bare source (`\.tinypass\.com/`) or the delimited
    /// literal form (`/\.tinypass\.com\//i`).
    ///
    /// The literal form only applies when the trailing flags are regex-literal
    /// flags (`dgimsuy`) and the body has no unescaped `/` outside a character
    /// class, so a path such as `/api/track` stays a bare source.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if let Some(rest) = text.strip_prefix('/') {
            if let Some(end) = rest.rfind('/') {
                let (body, flags) = (&rest[..end], &rest[end + 1..]);
                if !body.is_empty()
                    && flags.chars().all(|c| LITERAL_FLAGS.contains(c))
                    && !has_unescaped_slash(body)
                {
                    return Self::new(body, flags);
                }
            }
        }
        Self::new(text, "")
    }

    /// Pattern source without delimiters.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Normalized (sorted, deduplicated) flags.
    pub fn flags(&self) -> &str {
        &self.flags
    }
}

impl fmt::Display for PatternSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.flags.is_empty() {
            write!(f, "{}", self.source)
        } else {
            write!(f, "/{}/{}", self.source, self.flags)
        }
    }
}

impl From<&str> for PatternSpec {
    fn from(text: &str) -> Self {
        Self::parse(text)
    }
}

/// A compiled pattern with a stable identity.
#[derive(Debug)]
pub struct Matcher {
    id: u64,
    spec: PatternSpec,
    regex: Regex,
}

impl Matcher {
    /// Identity used to key memoized results.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The spec this matcher was compiled from.
    pub fn spec(&self) -> &PatternSpec {
        &self.spec
    }

    /// Evaluate the pattern directly, bypassing any cache.
    pub fn is_match(&self, subject: &str) -> bool {
        self.regex.is_match(subject)
    }
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub compiled: usize,
    /// Specs that failed to compile
    pub invalid: usize,
    pub results: usize,
}

impl CacheStats {
    /// Fraction of `test` calls answered from the result cache.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

type ResultKey = (u64, String);

struct ResultTable {
    entries: AHashMap<ResultKey, bool>,
    order: VecDeque<ResultKey>,
}

impl ResultTable {
    fn new() -> Self {
        Self {
            entries: AHashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// Pattern compiler with memoized test results.
pub struct PatternCache {
    compiled: Mutex<AHashMap<PatternSpec, Arc<Matcher>>>,
    /// Compile failures, remembered so each bad spec is compiled and logged once
    invalid: Mutex<AHashMap<PatternSpec, PatternCompileError>>,
    results: Mutex<ResultTable>,
    capacity: usize,
    next_id: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for PatternCache {
    fn default() -> Self {
        Self::new(DEFAULT_RESULT_CAPACITY)
    }
}

impl PatternCache {
    /// Create a cache holding at most `capacity` memoized results.
    pub fn new(capacity: usize) -> Self {
        Self {
            compiled: Mutex::new(AHashMap::new()),
            invalid: Mutex::new(AHashMap::new()),
            results: Mutex::new(ResultTable::new()),
            capacity,
            next_id: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Configured result bound.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Compile a pattern, returning the cached matcher when one exists.
    ///
    /// A spec that failed once fails again without recompiling; the failure
    /// is logged the first time only.
    pub fn compile(&self, spec: &PatternSpec) -> Result<Arc<Matcher>, PatternCompileError> {
        let mut compiled = self.compiled.lock();
        if let Some(matcher) = compiled.get(spec) {
            return Ok(Arc::clone(matcher));
        }
        if let Some(err) = self.invalid.lock().get(spec) {
            return Err(err.clone());
        }

        let flags = spec.flags();
        let regex = RegexBuilder::new(spec.source())
            .case_insensitive(flags.contains('i'))
            .multi_line(flags.contains('m'))
            .dot_matches_new_line(flags.contains('s'))
            .build();
        let regex = match regex {
            Ok(regex) => regex,
            Err(e) => {
                let err = PatternCompileError {
                    source_text: spec.to_string(),
                    reason: e.to_string(),
                };
                log::warn!("{}", err);
                self.invalid.lock().insert(spec.clone(), err.clone());
                return Err(err);
            }
        };

        let matcher = Arc::new(Matcher {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            spec: spec.clone(),
            regex,
        });
        compiled.insert(spec.clone(), Arc::clone(&matcher));
        Ok(matcher)
    }

    /// Test a subject against a pattern, compiling it if needed.
    ///
    /// A pattern that fails to compile never matches.
    pub fn test(&self, spec: &PatternSpec, subject: &str) -> bool {
        match self.compile(spec) {
            Ok(matcher) => self.test_matcher(&matcher, subject),
            Err(_) => false,
        }
    }

    /// Test a subject against an already compiled matcher.
    pub fn test_matcher(&self, matcher: &Matcher, subject: &str) -> bool {
        let key = (matcher.id(), subject.to_string());

        if let Some(&hit) = self.results.lock().entries.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return hit;
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let result = matcher.is_match(subject);
        if self.capacity == 0 {
            return result;
        }

        let mut table = self.results.lock();
        if table.entries.insert(key.clone(), result).is_none() {
            table.order.push_back(key);
        }
        while table.entries.len() > self.capacity {
            match table.order.pop_front() {
                Some(oldest) => {
                    table.entries.remove(&oldest);
                }
                None => break,
            }
        }
        result
    }

    /// Drop memoized results, keeping compiled matchers.
    pub fn clear_results(&self) {
        self.results.lock().clear();
    }

    /// Drop compiled matchers and memoized results.
    pub fn clear_all(&self) {
        self.compiled.lock().clear();
        self.invalid.lock().clear();
        self.clear_results();
    }

    /// Whether a result for this pair is currently memoized.
    pub fn is_cached(&self, matcher: &Matcher, subject: &str) -> bool {
        self.results
            .lock()
            .entries
            .contains_key(&(matcher.id(), subject.to_string()))
    }

    /// Snapshot of counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            compiled: self.compiled.lock().len(),
            invalid: self.invalid.lock().len(),
            results: self.results.lock().entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_literal_form() {
        let spec = PatternSpec::parse(r"/\.tinypass\.com\//i");
        assert_eq!(spec.source(), r"\.tinypass\.com\/");
        assert_eq!(spec.flags(), "i");

        let bare = PatternSpec::parse(r"\.tinypass\.com/");
        assert_eq!(bare.source(), r"\.tinypass\.com/");
        assert_eq!(bare.flags(), "");
    }

    #[test]
    fn test_path_like_source_is_not_a_literal() {
        let spec = PatternSpec::parse("/api/track");
        assert_eq!(spec.source(), "/api/track");
        assert_eq!(spec.flags(), "");
        assert_eq!(PatternSpec::parse("/api/track/").source(), "/api/track/");
        assert_eq!(PatternSpec::parse("/ads/x").source(), "/ads/x");

        let cache = PatternCache::default();
        assert!(!cache.test(&spec, "https://x.com/api/v2"));
        assert!(cache.test(&spec, "https://x.com/api/track?id=1"));
    }

    #[test]
    fn test_literal_with_class_and_escapes() {
        let spec = PatternSpec::parse(r"/pay[/]wall\/x/gi");
        assert_eq!(spec.source(), r"pay[/]wall\/x");
        assert_eq!(spec.flags(), "i");
    }

    #[test]
    fn test_flags_normalized() {
        assert_eq!(PatternSpec::new("a", "sii"), PatternSpec::new("a", "is"));
        assert_eq!(PatternSpec::new("a", "gi").flags(), "i");
    }

    #[test]
    fn test_compile_is_idempotent() {
        let cache = PatternCache::default();
        let spec = PatternSpec::parse(r"\.tinypass\.com/");
        let a = cache.compile(&spec).unwrap();
        let b = cache.compile(&spec).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.stats().compiled, 1);
    }

    #[test]
    fn test_flags_distinguish_matchers() {
        let cache = PatternCache::default();
        let plain = cache.compile(&PatternSpec::new("abc", "")).unwrap();
        let folded = cache.compile(&PatternSpec::new("abc", "i")).unwrap();
        assert_ne!(plain.id(), folded.id());
        assert!(!cache.test_matcher(&plain, "ABC"));
        assert!(cache.test_matcher(&folded, "ABC"));
    }

    #[test]
    fn test_invalid_pattern() {
        let cache = PatternCache::default();
        let spec = PatternSpec::new("([unclosed", "");
        let err = cache.compile(&spec).unwrap_err();
        assert!(err.source_text.contains("unclosed"));
        assert!(!cache.test(&spec, "anything"));
    }

    #[test]
    fn test_invalid_pattern_is_remembered() {
        let cache = PatternCache::default();
        let spec = PatternSpec::new("([unclosed", "");
        for _ in 0..5 {
            assert!(!cache.test(&spec, "anything"));
        }
        let first = cache.compile(&spec).unwrap_err();
        let again = cache.compile(&spec).unwrap_err();
        assert_eq!(first, again);

        let stats = cache.stats();
        assert_eq!(stats.invalid, 1);
        assert_eq!(stats.compiled, 0);

        cache.clear_all();
        assert_eq!(cache.stats().invalid, 0);
    }

    #[test]
    fn test_cache_agrees_with_direct_evaluation() {
        let cache = PatternCache::new(4);
        let spec = PatternSpec::parse(r"\.tinypass\.com/");
        let matcher = cache.compile(&spec).unwrap();
        let subjects = [
            "https://px.tinypass.com/xyz",
            "https://nytimes.com/article",
            "https://tinypass.com/",
            "https://cdn.tinypass.com/a",
            "https://example.org/",
            "https://px.tinypass.com/xyz",
        ];
        for _ in 0..3 {
            for subject in subjects {
                assert_eq!(cache.test(&spec, subject), matcher.is_match(subject));
            }
        }
    }

    #[test]
    fn test_hits_and_misses() {
        let cache = PatternCache::default();
        let spec = PatternSpec::parse("ads");
        cache.test(&spec, "https://ads.example.com/");
        cache.test(&spec, "https://ads.example.com/");
        cache.test(&spec, "https://ads.example.com/");
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert!(stats.hit_rate() > 0.6);
    }

    #[test]
    fn test_eviction_in_insertion_order() {
        let cache = PatternCache::new(3);
        let matcher = cache.compile(&PatternSpec::parse("x")).unwrap();

        for i in 0..5 {
            cache.test_matcher(&matcher, &format!("subject-{}", i));
            assert!(cache.stats().results <= 3);
        }

        // Re-reading an old entry does not refresh its position.
        assert!(cache.is_cached(&matcher, "subject-2"));
        cache.test_matcher(&matcher, "subject-2");
        cache.test_matcher(&matcher, "subject-5");

        assert!(!cache.is_cached(&matcher, "subject-0"));
        assert!(!cache.is_cached(&matcher, "subject-1"));
        assert!(!cache.is_cached(&matcher, "subject-2"));
        assert!(cache.is_cached(&matcher, "subject-3"));
        assert!(cache.is_cached(&matcher, "subject-4"));
        assert!(cache.is_cached(&matcher, "subject-5"));
    }

    #[test]
    fn test_clear_results_keeps_matchers() {
        let cache = PatternCache::default();
        let spec = PatternSpec::parse("x");
        let before = cache.compile(&spec).unwrap();
        cache.test(&spec, "x");
        cache.clear_results();

        let stats = cache.stats();
        assert_eq!(stats.results, 0);
        assert_eq!(stats.compiled, 1);
        assert!(Arc::ptr_eq(&before, &cache.compile(&spec).unwrap()));

        cache.clear_all();
        assert_eq!(cache.stats().compiled, 0);
        assert!(!Arc::ptr_eq(&before, &cache.compile(&spec).unwrap()));
    }

    #[test]
    fn test_zero_capacity_disables_memoization() {
        let cache = PatternCache::new(0);
        assert!(cache.test(&PatternSpec::parse("a"), "a"));
        assert_eq!(cache.stats().results, 0);
    }
}
