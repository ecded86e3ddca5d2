//! Precomputed per-domain request header rewrites.

use ahash::AHashMap;
use arc_swap::ArcSwap;
use bitflags::bitflags;
use std::borrow::Cow;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::entry::{expand_referer, BotAgent, UserAgentOverride};
use crate::index::DomainIndex;

/// Default number of synthetic addresses generated per domain.
pub const DEFAULT_ADDRESS_POOL_SIZE: usize = 10;

pub const USER_AGENT: &str = "User-Agent";
pub const REFERER: &str = "Referer";
pub const FORWARDED_FOR: &str = "X-Forwarded-For";

/// A request header as a (name, value) pair.
pub type Header = (String, String);

bitflags! {
    /// Header features a rule rewrites.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RuleFeatures: u8 {
        const USER_AGENT = 0b001;
        const REFERER = 0b010;
        const ORIGIN_ADDRESS = 0b100;
    }
}

/// Literal user agent for a crawler identity.
pub fn bot_user_agent(bot: BotAgent, mobile: bool) -> &'static str {
    match (bot, mobile) {
        (BotAgent::Googlebot, false) => {
            "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)"
        }
        (BotAgent::Googlebot, true) => {
            "Mozilla/5.0 (Linux; Android 6.0.1; Nexus 5X Build/MMB29P) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/W.X.Y.Z Mobile Safari/537.36 \
             (compatible; Googlebot/2.1; +http://www.google.com/bot.html)"
        }
        (BotAgent::Bingbot, false) => {
            "Mozilla/5.0 (compatible; bingbot/2.0; +http://www.bing.com/bingbot.htm)"
        }
        (BotAgent::Bingbot, true) => {
            "Mozilla/5.0 (iPhone; CPU iPhone OS 7_0 like Mac OS X) AppleWebKit/537.51.1 \
             (KHTML, like Gecko) Version/7.0 Mobile/11A465 Safari/9537.53 \
             (compatible; bingbot/2.0; +http://www.bing.com/bingbot.htm)"
        }
        (BotAgent::Facebookbot, _) => {
            "facebookexternalhit/1.1 (+http://www.facebook.com/externalhit_uatext.php)"
        }
    }
}

/// Header rewrites for one domain. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRule {
    features: RuleFeatures,
    user_agent: Option<String>,
    referer: Option<String>,
    addresses: Vec<Ipv4Addr>,
}

impl HeaderRule {
    pub fn features(&self) -> RuleFeatures {
        self.features
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    pub fn referer(&self) -> Option<&str> {
        self.referer.as_deref()
    }

    /// Synthetic origin addresses, fixed at build time.
    pub fn addresses(&self) -> &[Ipv4Addr] {
        &self.addresses
    }

    /// Address used for a request made at `now_millis`.
    pub fn address_at(&self, now_millis: u64) -> Option<Ipv4Addr> {
        if self.addresses.is_empty() {
            return None;
        }
        let idx = (now_millis % self.addresses.len() as u64) as usize;
        Some(self.addresses[idx])
    }

    /// Headers this rule sets for a request made at `now_millis`.
    fn replacements(&self, now_millis: u64) -> Vec<Header> {
        let mut out = Vec::with_capacity(3);
        if let Some(ua) = &self.user_agent {
            out.push((USER_AGENT.to_string(), ua.clone()));
        }
        if let Some(referer) = &self.referer {
            out.push((REFERER.to_string(), referer.clone()));
        }
        if let Some(addr) = self.address_at(now_millis) {
            out.push((FORWARDED_FOR.to_string(), addr.to_string()));
        }
        out
    }
}

fn synthetic_address() -> Ipv4Addr {
    Ipv4Addr::new(
        fastrand::u8(1..=223),
        fastrand::u8(..),
        fastrand::u8(..),
        fastrand::u8(1..=254),
    )
}

/// Builds and applies per-domain header rules.
pub struct HeaderRuleEngine {
    rules: ArcSwap<AHashMap<String, Arc<HeaderRule>>>,
    pool_size: usize,
    /// Index generation the current rules were built from.
    built_generation: AtomicU64,
}

impl Default for HeaderRuleEngine {
    fn default() -> Self {
        Self::new(DEFAULT_ADDRESS_POOL_SIZE)
    }
}

impl HeaderRuleEngine {
    /// Create an engine generating `pool_size` synthetic addresses per domain.
    pub fn new(pool_size: usize) -> Self {
        Self {
            rules: ArcSwap::from_pointee(AHashMap::new()),
            pool_size: pool_size.max(1),
            built_generation: AtomicU64::new(0),
        }
    }

    /// Rebuild every rule from the index, replacing the previous set.
    pub fn build_rules(&self, index: &DomainIndex, mobile: bool) {
        let generation = index.generation();
        let mut rules = AHashMap::new();

        for domain in index.domains() {
            let entry = match index.lookup(&domain) {
                Some(entry) => entry,
                None => continue,
            };

            let mut features = RuleFeatures::empty();
            let user_agent = index.user_agent(&domain).map(|ua| {
                features |= RuleFeatures::USER_AGENT;
                match ua {
                    UserAgentOverride::Bot(bot) => bot_user_agent(bot, mobile).to_string(),
                    UserAgentOverride::Custom(s) => s,
                }
            });
            let referer = entry.referer.as_deref().map(|r| {
                features |= RuleFeatures::REFERER;
                expand_referer(r)
            });
            let addresses = if entry.random_origin {
                features |= RuleFeatures::ORIGIN_ADDRESS;
                (0..self.pool_size).map(|_| synthetic_address()).collect()
            } else {
                Vec::new()
            };

            if features.is_empty() {
                continue;
            }
            rules.insert(
                domain,
                Arc::new(HeaderRule {
                    features,
                    user_agent,
                    referer,
                    addresses,
                }),
            );
        }

        log::debug!("Built {} header rules (mobile: {})", rules.len(), mobile);
        self.rules.store(Arc::new(rules));
        self.built_generation.store(generation, Ordering::SeqCst);
    }

    /// Index generation the current rules reflect.
    pub fn built_generation(&self) -> u64 {
        self.built_generation.load(Ordering::SeqCst)
    }

    /// Rule for a domain, if any.
    pub fn rule(&self, domain: &str) -> Option<Arc<HeaderRule>> {
        self.rules
            .load()
            .get(&crate::entry::normalize_domain(domain))
            .cloned()
    }

    /// Number of domains with a rule.
    pub fn len(&self) -> usize {
        self.rules.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite `headers` for a request to `domain` made now.
    pub fn apply_headers<'a>(&self, domain: &str, headers: &'a [Header]) -> Cow<'a, [Header]> {
        self.apply_headers_at(domain, headers, now_millis())
    }

    /// Rewrite `headers` for a request to `domain` made at `now_millis`.
    ///
    /// Without a rule the input is returned as is. Otherwise every header the
    /// rule sets is first removed (names compared case-insensitively).
    pub fn apply_headers_at<'a>(
        &self,
        domain: &str,
        headers: &'a [Header],
        now_millis: u64,
    ) -> Cow<'a, [Header]> {
        let rule = match self.rule(domain) {
            Some(rule) => rule,
            None => return Cow::Borrowed(headers),
        };

        let replacements = rule.replacements(now_millis);
        let mut out: Vec<Header> = headers
            .iter()
            .filter(|(name, _)| !replacements.iter().any(|(n, _)| n.eq_ignore_ascii_case(name)))
            .cloned()
            .collect();
        out.extend(replacements);
        Cow::Owned(out)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
