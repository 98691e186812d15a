//! Client configuration
//!
//! All knobs that shape fetches, inserts, the archive cache and the FEC
//! worker pool. Every section has sensible defaults so that a partial YAML
//! file only needs to name what it overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fec::CodecKind;

/// Default block size in bytes
pub const DEFAULT_BLOCK_SIZE: usize = 32 * 1024;

/// Default data blocks per segment for the redundant codec
pub const DEFAULT_SEGMENT_DATA_BLOCKS: usize = 128;

/// Default check blocks per segment for the redundant codec
pub const DEFAULT_SEGMENT_CHECK_BLOCKS: usize = 64;

/// Largest total shard count a GF(2^8) engine supports
pub const MAX_SHARDS_PER_SEGMENT: usize = 256;

// =============================================================================
// Top Level
// =============================================================================

/// Full client configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub fetch: FetchConfig,
    pub insert: InsertConfig,
    pub archive_cache: ArchiveCacheConfig,
    pub fec: FecConfig,
}

impl ClientConfig {
    /// Parse a YAML document, filling gaps with defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: ClientConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Render as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Reject values that would stall or break the engine.
    pub fn validate(&self) -> Result<()> {
        if self.fetch.max_concurrent_blocks == 0 {
            return Err(Error::Config(
                "fetch.max_concurrent_blocks must be greater than 0".to_string(),
            ));
        }
        if self.fetch.max_concurrent_segments == 0 {
            return Err(Error::Config(
                "fetch.max_concurrent_segments must be greater than 0".to_string(),
            ));
        }
        if self.fetch.heal_sample_denominator == 0 {
            return Err(Error::Config(
                "fetch.heal_sample_denominator must be greater than 0".to_string(),
            ));
        }
        if self.insert.max_concurrent_blocks == 0 {
            return Err(Error::Config(
                "insert.max_concurrent_blocks must be greater than 0".to_string(),
            ));
        }
        if self.insert.block_size == 0 {
            return Err(Error::Config(
                "insert.block_size must be greater than 0".to_string(),
            ));
        }
        if self.insert.block_size > self.fetch.max_block_size {
            return Err(Error::Config(format!(
                "insert.block_size {} exceeds fetch.max_block_size {}",
                self.insert.block_size, self.fetch.max_block_size
            )));
        }
        if self.insert.segment_data_blocks == 0 {
            return Err(Error::Config(
                "insert.segment_data_blocks must be greater than 0".to_string(),
            ));
        }
        if self.insert.codec == CodecKind::ReedSolomon {
            if self.insert.segment_check_blocks == 0 {
                return Err(Error::Config(
                    "insert.segment_check_blocks must be greater than 0 for reed_solomon"
                        .to_string(),
                ));
            }
            let total = self.insert.segment_data_blocks + self.insert.segment_check_blocks;
            if total > MAX_SHARDS_PER_SEGMENT {
                return Err(Error::Config(format!(
                    "segment shape {}+{} exceeds {} blocks",
                    self.insert.segment_data_blocks,
                    self.insert.segment_check_blocks,
                    MAX_SHARDS_PER_SEGMENT
                )));
            }
        }
        if self.archive_cache.max_entries == 0 {
            return Err(Error::Config(
                "archive_cache.max_entries must be greater than 0".to_string(),
            ));
        }
        if self.fec.engine_cache_size == 0 {
            return Err(Error::Config(
                "fec.engine_cache_size must be greater than 0".to_string(),
            ));
        }
        if self.fec.max_workers == Some(0) {
            return Err(Error::Config(
                "fec.max_workers must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Fetch-side settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Highest retry level a block may reach before it is exhausted
    pub max_block_retries: u32,
    /// Simultaneous block attempts per segment
    pub max_concurrent_blocks: usize,
    /// Segments running at once within one splitfile
    pub max_concurrent_segments: usize,
    /// Per-attempt timeout in milliseconds
    pub block_timeout_ms: u64,
    /// Metadata hops allowed before giving up
    pub max_recursion: u32,
    /// Container re-fetches allowed when an archive changes underneath us
    pub max_archive_restarts: u32,
    /// Re-insert blocks that were hard to find after a successful decode
    pub heal: bool,
    /// Never-attempted blocks are healed with probability 1/N
    pub heal_sample_denominator: u32,
    /// Largest object this client will assemble
    pub max_output_length: u64,
    /// Largest block size a splitfile document may declare
    pub max_block_size: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_block_retries: 3,
            max_concurrent_blocks: 20,
            max_concurrent_segments: 1,
            block_timeout_ms: 60_000,
            max_recursion: 10,
            max_archive_restarts: 2,
            heal: true,
            heal_sample_denominator: 5,
            max_output_length: u64::MAX,
            max_block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl FetchConfig {
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }
}

/// Insert-side settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsertConfig {
    /// Highest retry level a block may reach before it is exhausted
    pub max_block_retries: u32,
    /// Simultaneous block inserts per segment
    pub max_concurrent_blocks: usize,
    /// Size of every block in bytes
    pub block_size: usize,
    /// Data blocks per full segment
    pub segment_data_blocks: usize,
    /// Check blocks per full segment
    pub segment_check_blocks: usize,
    /// Redundancy codec for new splitfiles
    pub codec: CodecKind,
    /// Per-attempt timeout in milliseconds
    pub block_timeout_ms: u64,
}

impl Default for InsertConfig {
    fn default() -> Self {
        Self {
            max_block_retries: 10,
            max_concurrent_blocks: 20,
            block_size: DEFAULT_BLOCK_SIZE,
            segment_data_blocks: DEFAULT_SEGMENT_DATA_BLOCKS,
            segment_check_blocks: DEFAULT_SEGMENT_CHECK_BLOCKS,
            codec: CodecKind::ReedSolomon,
            block_timeout_ms: 60_000,
        }
    }
}

impl InsertConfig {
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }
}

/// Archive bucket cache budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveCacheConfig {
    /// Total bytes held across all entries
    pub max_bytes: u64,
    /// Number of entries held
    pub max_entries: usize,
}

impl Default for ArchiveCacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 32 * 1024 * 1024,
            max_entries: 1024,
        }
    }
}

/// FEC engine cache and worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FecConfig {
    /// Codec engines kept per shape
    pub engine_cache_size: usize,
    /// Fixed worker count; derived from cores and memory when unset
    pub max_workers: Option<usize>,
    /// Memory the pool may assume is available for codec buffers
    pub memory_budget_bytes: u64,
}

impl Default for FecConfig {
    fn default() -> Self {
        Self {
            engine_cache_size: 16,
            max_workers: None,
            memory_budget_bytes: 1024 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.fetch.max_block_retries, 3);
        assert_eq!(config.fetch.max_concurrent_blocks, 20);
        assert_eq!(config.fetch.max_recursion, 10);
        assert_eq!(config.fetch.max_block_size, 32768);
        assert_eq!(config.insert.max_block_retries, 10);
        assert_eq!(config.insert.block_size, 32768);
        assert_eq!(config.insert.segment_data_blocks, 128);
        assert_eq!(config.insert.segment_check_blocks, 64);
        assert_eq!(config.archive_cache.max_bytes, 32 * 1024 * 1024);
        assert_eq!(config.archive_cache.max_entries, 1024);
        assert_eq!(config.fec.engine_cache_size, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
fetch:
  max_block_retries: 5
insert:
  codec: non_redundant
archive_cache:
  max_bytes: 1000
"#;
        let config = ClientConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.fetch.max_block_retries, 5);
        assert_eq!(config.fetch.max_concurrent_blocks, 20);
        assert_eq!(config.insert.codec, CodecKind::NonRedundant);
        assert_eq!(config.archive_cache.max_bytes, 1000);
        assert_eq!(config.archive_cache.max_entries, 1024);
    }

    #[test]
    fn test_rejects_oversized_shape() {
        let yaml = r#"
insert:
  segment_data_blocks: 200
  segment_check_blocks: 100
"#;
        assert_matches!(ClientConfig::from_yaml_str(yaml), Err(Error::Config(_)));
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let mut config = ClientConfig::default();
        config.fetch.max_concurrent_blocks = 0;
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_rejects_blocks_larger_than_fetchable() {
        let yaml = r#"
insert:
  block_size: 65536
"#;
        assert_matches!(ClientConfig::from_yaml_str(yaml), Err(Error::Config(_)));

        let mut config = ClientConfig::default();
        config.fetch.max_block_size = 65536;
        config.insert.block_size = 65536;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = ClientConfig::default();
        let yaml = config.to_yaml().unwrap();
        let parsed = ClientConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_invalid_yaml() {
        assert_matches!(
            ClientConfig::from_yaml_str("fetch: [1, 2"),
            Err(Error::ConfigParse(_))
        );
    }
}
