//! Lazy loading of catalog partitions.

mod loader;
mod manifest;
mod retry;
mod source;

pub use loader::{ChunkLoader, LoaderStats, PartitionStatus};
pub use manifest::{sha256_hex, ChunkManifest, ManifestFile, PartitionInfo};
pub use retry::RetryPolicy;
pub use source::{ChunkSource, FileChunkSource, HttpChunkSource};
