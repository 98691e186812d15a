//! Archive member caching
//!
//! Content stored as a container (zip, tar, bundle) is fetched and unpacked
//! once; its members are kept in the [`ArchiveBucketCache`] so later
//! lookups into the same container skip the network.

pub mod cache;

pub use cache::{ArchiveBucketCache, ArchiveCacheStats, ArchiveKey, ArchiveReader, METADATA_MEMBER};
