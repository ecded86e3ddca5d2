//! Catalog entries and catalog document parsing.
//!
//! A catalog document is JSON or YAML, either a map keyed by entry name or a
//! plain list of entries:
//!
//! ```yaml
//! The New York Times:
//!   domain: nytimes.com
//!   block_regex: '\.tinypass\.com/'
//!   useragent: googlebot
//! Group Example:
//!   domain: '###_group'
//!   group: [a.com, b.com]
//!   remove_cookies: 1
//! ```

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;

use crate::error::Result;
use crate::pattern::PatternSpec;

/// Domain markers starting with this are authoring metadata, not sites.
pub const COMMENT_SENTINEL: char = '#';

/// Crawler identities with well-known user agent strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BotAgent {
    Googlebot,
    Bingbot,
    Facebookbot,
}

impl BotAgent {
    /// Parse a catalog tag (case-insensitive).
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_lowercase().as_str() {
            "googlebot" => Some(BotAgent::Googlebot),
            "bingbot" => Some(BotAgent::Bingbot),
            "facebookbot" => Some(BotAgent::Facebookbot),
            _ => None,
        }
    }

    /// Catalog tag for this identity.
    pub fn tag(&self) -> &'static str {
        match self {
            BotAgent::Googlebot => "googlebot",
            BotAgent::Bingbot => "bingbot",
            BotAgent::Facebookbot => "facebookbot",
        }
    }
}

/// User agent to present for a site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAgentOverride {
    /// One of the built-in crawler identities
    Bot(BotAgent),
    /// A literal user agent string
    Custom(String),
}

/// Cookie handling directive for a site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookiePolicy {
    /// Keep all cookies
    Allow,
    /// Remove all cookies
    Remove,
    /// Remove all cookies except the named ones
    SelectHold(Vec<String>),
    /// Remove only the named cookies
    SelectDrop(Vec<String>),
}

impl CookiePolicy {
    /// Whether a cookie with this name should be removed.
    pub fn removes(&self, cookie: &str) -> bool {
        match self {
            CookiePolicy::Allow => false,
            CookiePolicy::Remove => true,
            CookiePolicy::SelectHold(keep) => !keep.iter().any(|c| c == cookie),
            CookiePolicy::SelectDrop(drop) => drop.iter().any(|c| c == cookie),
        }
    }
}

/// One catalog record. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawEntry", into = "RawEntry")]
pub struct ConfigEntry {
    pub name: String,
    pub domain: Option<String>,
    pub group: Vec<String>,
    pub block_patterns: Vec<PatternSpec>,
    pub user_agent: Option<UserAgentOverride>,
    pub referer: Option<String>,
    pub random_origin: bool,
    pub cookies: Option<CookiePolicy>,
}

impl ConfigEntry {
    /// A single-domain entry with no features.
    pub fn new(name: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain: Some(domain.into()),
            group: Vec::new(),
            block_patterns: Vec::new(),
            user_agent: None,
            referer: None,
            random_origin: false,
            cookies: None,
        }
    }

    /// A group entry shared by several domains.
    pub fn group<I, S>(name: impl Into<String>, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            domain: None,
            group: domains.into_iter().map(Into::into).collect(),
            ..Self::new(name, "")
        }
    }

    pub fn with_block_pattern(mut self, pattern: &str) -> Self {
        self.block_patterns.push(PatternSpec::parse(pattern));
        self
    }

    pub fn with_user_agent(mut self, user_agent: UserAgentOverride) -> Self {
        self.user_agent = Some(user_agent);
        self
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    pub fn with_random_origin(mut self) -> Self {
        self.random_origin = true;
        self
    }

    pub fn with_cookies(mut self, policy: CookiePolicy) -> Self {
        self.cookies = Some(policy);
        self
    }

    /// Whether this entry is authoring metadata rather than a site.
    pub fn is_comment(&self) -> bool {
        self.group.is_empty()
            && self
                .domain
                .as_deref()
                .map_or(true, |d| d.trim().is_empty() || d.starts_with(COMMENT_SENTINEL))
    }

    /// Domains this entry applies to, normalized.
    pub fn domains(&self) -> Vec<String> {
        if !self.group.is_empty() {
            return self.group.iter().map(|d| normalize_domain(d)).collect();
        }
        match &self.domain {
            Some(d) if !self.is_comment() => vec![normalize_domain(d)],
            _ => Vec::new(),
        }
    }
}

/// Lowercase a hostname and strip a trailing dot.
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_lowercase()
}

/// Map a referer tag to the URL sent for it; other values pass through.
pub fn expand_referer(referer: &str) -> String {
    match referer.trim().to_lowercase().as_str() {
        "google" => "https://www.google.com/".to_string(),
        "facebook" => "https://www.facebook.com/".to_string(),
        "twitter" => "https://t.co/".to_string(),
        _ => referer.trim().to_string(),
    }
}

/// Truthy flag as found in hand-written catalogs (`1`, `true`, `"all"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Num(i64),
    Text(String),
}

impl Flag {
    fn is_set(&self) -> bool {
        match self {
            Flag::Bool(b) => *b,
            Flag::Num(n) => *n != 0,
            Flag::Text(s) => !s.is_empty() && s != "0" && s != "false",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

/// Wire shape of an entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawEntry {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    domain: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    group: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    block_regex: Option<OneOrMany>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    useragent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    useragent_custom: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    referer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    random_ip: Option<Flag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_cookies: Option<Flag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remove_cookies: Option<Flag>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    remove_cookies_select_hold: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    remove_cookies_select_drop: Vec<String>,
}

impl From<RawEntry> for ConfigEntry {
    fn from(raw: RawEntry) -> Self {
        let user_agent = match (raw.useragent_custom, raw.useragent) {
            (Some(custom), _) if !custom.trim().is_empty() => {
                Some(UserAgentOverride::Custom(custom))
            }
            (_, Some(tag)) => match BotAgent::from_tag(&tag) {
                Some(bot) => Some(UserAgentOverride::Bot(bot)),
                None => {
                    log::warn!("Unknown user agent tag {:?} for {:?}", tag, raw.name);
                    None
                }
            },
            _ => None,
        };

        let cookies = if !raw.remove_cookies_select_hold.is_empty() {
            Some(CookiePolicy::SelectHold(raw.remove_cookies_select_hold))
        } else if !raw.remove_cookies_select_drop.is_empty() {
            Some(CookiePolicy::SelectDrop(raw.remove_cookies_select_drop))
        } else if raw.remove_cookies.as_ref().is_some_and(Flag::is_set) {
            Some(CookiePolicy::Remove)
        } else if raw.allow_cookies.as_ref().is_some_and(Flag::is_set) {
            Some(CookiePolicy::Allow)
        } else {
            None
        };

        Self {
            name: raw.name,
            domain: raw.domain,
            group: raw.group,
            block_patterns: raw
                .block_regex
                .map(OneOrMany::into_vec)
                .unwrap_or_default()
                .iter()
                .map(|p| PatternSpec::parse(p))
                .collect(),
            user_agent,
            referer: raw.referer.filter(|r| !r.trim().is_empty()),
            random_origin: raw.random_ip.as_ref().is_some_and(Flag::is_set),
            cookies,
        }
    }
}

impl From<ConfigEntry> for RawEntry {
    fn from(entry: ConfigEntry) -> Self {
        let mut raw = RawEntry {
            name: entry.name,
            domain: entry.domain,
            group: entry.group,
            referer: entry.referer,
            random_ip: entry.random_origin.then_some(Flag::Bool(true)),
            ..RawEntry::default()
        };

        let patterns: Vec<String> = entry.block_patterns.iter().map(|p| p.to_string()).collect();
        raw.block_regex = match patterns.len() {
            0 => None,
            1 => patterns.into_iter().next().map(OneOrMany::One),
            _ => Some(OneOrMany::Many(patterns)),
        };

        match entry.user_agent {
            Some(UserAgentOverride::Bot(bot)) => raw.useragent = Some(bot.tag().to_string()),
            Some(UserAgentOverride::Custom(s)) => raw.useragent_custom = Some(s),
            None => {}
        }

        match entry.cookies {
            Some(CookiePolicy::Allow) => raw.allow_cookies = Some(Flag::Num(1)),
            Some(CookiePolicy::Remove) => raw.remove_cookies = Some(Flag::Num(1)),
            Some(CookiePolicy::SelectHold(names)) => raw.remove_cookies_select_hold = names,
            Some(CookiePolicy::SelectDrop(names)) => raw.remove_cookies_select_drop = names,
            None => {}
        }

        raw
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawCatalog {
    Map(BTreeMap<String, ConfigEntry>),
    List(Vec<ConfigEntry>),
}

/// Document formats a catalog can be written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogFormat {
    Json,
    Yaml,
}

impl CatalogFormat {
    /// Guess the format from the first non-whitespace byte.
    pub fn sniff(data: &[u8]) -> Self {
        match data.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') | Some(b'[') => CatalogFormat::Json,
            _ => CatalogFormat::Yaml,
        }
    }
}

/// Parse a catalog document into entries.
///
/// Map-shaped documents use the key as the entry name unless the entry names
/// itself.
pub fn parse_catalog(text: &str, format: CatalogFormat) -> Result<Vec<ConfigEntry>> {
    let raw: RawCatalog = match format {
        CatalogFormat::Json => serde_json::from_str(text)?,
        CatalogFormat::Yaml => serde_yaml::from_str(text)?,
    };

    Ok(match raw {
        RawCatalog::Map(map) => map
            .into_iter()
            .map(|(key, mut entry)| {
                if entry.name.is_empty() {
                    entry.name = key;
                }
                entry
            })
            .collect(),
        RawCatalog::List(list) => list,
    })
}

/// Parse a catalog payload, inflating gzip and sniffing the format.
pub fn parse_catalog_bytes(data: &[u8]) -> Result<Vec<ConfigEntry>> {
    let inflated;
    let data = if is_gzip(data) {
        let mut buf = Vec::new();
        GzDecoder::new(data).read_to_end(&mut buf)?;
        inflated = buf;
        &inflated[..]
    } else {
        data
    };

    let text = std::str::from_utf8(data)
        .map_err(|e| crate::Error::Config(format!("catalog is not UTF-8: {}", e)))?;
    parse_catalog(text, CatalogFormat::sniff(data))
}

/// Check if data is gzip compressed.
pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}
