//! Partition manifest: which catalog chunk owns which domains.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::entry::normalize_domain;
use crate::error::Result;

/// Lowercase hex SHA-256 of a payload.
pub fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// One named catalog partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    /// Locator handed to the chunk source
    pub source: String,
    /// Domains whose entries live in this partition
    #[serde(default)]
    pub domains: Vec<String>,
    /// Optional hex SHA-256 of the payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Wire shape of a manifest document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    #[serde(default)]
    pub partitions: BTreeMap<String, PartitionInfo>,
    /// Locator of the full catalog, used when partitions cannot be loaded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

/// Manifest with its domain -> partition reverse index.
///
/// Read-only after construction.
#[derive(Debug, Clone)]
pub struct ChunkManifest {
    partitions: BTreeMap<String, PartitionInfo>,
    fallback: Option<String>,
    owners: AHashMap<String, String>,
}

impl ChunkManifest {
    /// Build the reverse index.
    ///
    /// A domain listed by several partitions belongs to the first one in name
    /// order.
    pub fn new(file: ManifestFile) -> Self {
        let mut owners = AHashMap::new();
        for (name, info) in &file.partitions {
            for domain in &info.domains {
                let domain = normalize_domain(domain);
                if let Some(existing) = owners.get(&domain) {
                    log::warn!(
                        "Domain {} listed by partitions {} and {}",
                        domain,
                        existing,
                        name
                    );
                    continue;
                }
                owners.insert(domain, name.clone());
            }
        }

        Self {
            partitions: file.partitions,
            fallback: file.fallback,
            owners,
        }
    }

    /// Parse a JSON manifest.
    pub fn from_json(text: &str) -> Result<Self> {
        let file: ManifestFile = serde_json::from_str(text)?;
        Ok(Self::new(file))
    }

    /// Load a JSON manifest from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    /// Partition owning a domain.
    pub fn partition_for(&self, domain: &str) -> Option<&str> {
        self.owners.get(&normalize_domain(domain)).map(String::as_str)
    }

    pub fn partition(&self, name: &str) -> Option<&PartitionInfo> {
        self.partitions.get(name)
    }

    pub fn partition_names(&self) -> impl Iterator<Item = &str> {
        self.partitions.keys().map(String::as_str)
    }

    pub fn fallback(&self) -> Option<&str> {
        self.fallback.as_deref()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Number of domains covered by some partition.
    pub fn domain_count(&self) -> usize {
        self.owners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "partitions": {
            "india": {"source": "chunks/india.json", "domains": ["example.in", "Hindu.IN"]},
            "us": {"source": "chunks/us.json", "domains": ["nytimes.com"], "sha256": "ab"}
        },
        "fallback": "catalog.json"
    }"#;

    #[test]
    fn test_reverse_index() {
        let manifest = ChunkManifest::from_json(MANIFEST).unwrap();
        assert_eq!(manifest.partition_for("example.in"), Some("india"));
        assert_eq!(manifest.partition_for("hindu.in"), Some("india"));
        assert_eq!(manifest.partition_for("nytimes.com"), Some("us"));
        assert_eq!(manifest.partition_for("unknown.org"), None);
        assert_eq!(manifest.fallback(), Some("catalog.json"));
        assert_eq!(manifest.domain_count(), 3);
        assert_eq!(manifest.partition("us").unwrap().sha256.as_deref(), Some("ab"));
    }

    #[test]
    fn test_duplicate_domain_keeps_first() {
        let mut file = ManifestFile::default();
        for name in ["b", "a"] {
            file.partitions.insert(
                name.to_string(),
                PartitionInfo {
                    source: format!("{}.json", name),
                    domains: vec!["dup.com".to_string()],
                    sha256: None,
                },
            );
        }
        let manifest = ChunkManifest::new(file);
        assert_eq!(manifest.partition_for("dup.com"), Some("a"));
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        fs::write(&path, MANIFEST).unwrap();
        let manifest = ChunkManifest::load(&path).unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.partition_names().collect::<Vec<_>>(), vec!["india", "us"]);
    }
}
