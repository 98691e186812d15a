//! Metadata documents
//!
//! A fetched root block holds one of these documents. They describe how to
//! reach the actual data: another key, a manifest entry, a member of a
//! container, or a splitfile's block lists. Documents are stored as JSON.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::MAX_SHARDS_PER_SEGMENT;
use crate::domain::ports::ArchiveType;
use crate::error::{Error, FetchFailureMode, Result};
use crate::fec::{CodecKind, SegmentLayout, SegmentLimits};
use crate::keys::ContentKey;

// =============================================================================
// Metadata
// =============================================================================

/// One step on the way from a key to content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Metadata {
    /// The target block holds another metadata document
    SimpleRedirect { target: ContentKey },
    /// The target block holds the data itself
    SingleFileRedirect { target: ContentKey },
    /// The data is spread over erasure-coded segments
    Splitfile(SplitfileMetadata),
    /// A splitfile whose content is another metadata document
    MultiLevel(SplitfileMetadata),
    /// Named documents; consumes one path component
    SimpleManifest {
        documents: BTreeMap<String, Metadata>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Box<Metadata>>,
    },
    /// A container whose `.metadata` member is the next document
    ArchiveManifest {
        archive_type: ArchiveType,
        container: ContentKey,
    },
    /// The data is a member of the current container
    ArchiveInternalRedirect { name: String },
    /// A member of the current container is the next document
    ArchiveMetadataRedirect { name: String },
}

impl Metadata {
    /// Parse a document; anything unreadable is invalid metadata.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let metadata: Metadata = serde_json::from_slice(data).map_err(|e| {
            Error::fetch(
                FetchFailureMode::InvalidMetadata,
                format!("unreadable metadata: {}", e),
            )
        })?;
        if let Some(splitfile) = metadata.as_splitfile() {
            splitfile.validate()?;
        }
        Ok(metadata)
    }

    /// Serialize for storage in a block.
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn is_splitfile(&self) -> bool {
        matches!(self, Metadata::Splitfile(_) | Metadata::MultiLevel(_))
    }

    pub fn as_splitfile(&self) -> Option<&SplitfileMetadata> {
        match self {
            Metadata::Splitfile(splitfile) | Metadata::MultiLevel(splitfile) => Some(splitfile),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Metadata::SimpleRedirect { .. } => "simple_redirect",
            Metadata::SingleFileRedirect { .. } => "single_file_redirect",
            Metadata::Splitfile(_) => "splitfile",
            Metadata::MultiLevel(_) => "multi_level",
            Metadata::SimpleManifest { .. } => "simple_manifest",
            Metadata::ArchiveManifest { .. } => "archive_manifest",
            Metadata::ArchiveInternalRedirect { .. } => "archive_internal_redirect",
            Metadata::ArchiveMetadataRedirect { .. } => "archive_metadata_redirect",
        }
    }
}

// =============================================================================
// Splitfile Metadata
// =============================================================================

/// Everything needed to fetch and reassemble a splitfile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitfileMetadata {
    pub codec: CodecKind,
    /// Data blocks in a full segment
    pub segment_data_blocks: usize,
    /// Check blocks in a full segment
    pub segment_check_blocks: usize,
    /// Every block is padded to this length
    pub block_size: usize,
    /// Length of the content before padding
    pub original_length: u64,
    pub data_keys: Vec<ContentKey>,
    pub check_keys: Vec<ContentKey>,
}

impl SplitfileMetadata {
    /// Segment limits the splitfile was built with.
    pub fn splitfile_shape(&self) -> SegmentLimits {
        SegmentLimits {
            codec: self.codec,
            data_blocks: self.segment_data_blocks,
            check_blocks: self.segment_check_blocks,
        }
    }

    /// Keys of the data blocks, in content order.
    pub fn data_block_keys(&self) -> &[ContentKey] {
        &self.data_keys
    }

    /// Keys of the check blocks, segment by segment.
    pub fn check_block_keys(&self) -> &[ContentKey] {
        &self.check_keys
    }

    /// Length of the content before padding.
    pub fn original_byte_length(&self) -> u64 {
        self.original_length
    }

    /// Segment layout implied by the key counts and shape.
    pub fn layout(&self) -> Result<SegmentLayout> {
        SegmentLayout::compute(self.data_keys.len(), self.splitfile_shape())
            .map_err(|e| invalid(e.to_string()))
    }

    /// Check internal consistency: shape limits, key counts and length.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(invalid("block size is zero"));
        }
        if self.data_keys.is_empty() {
            return Err(invalid("splitfile has no data blocks"));
        }
        let shards = self
            .segment_data_blocks
            .checked_add(self.segment_check_blocks)
            .ok_or_else(|| invalid("segment shape overflows"))?;
        if self.codec == CodecKind::ReedSolomon && shards > MAX_SHARDS_PER_SEGMENT {
            return Err(invalid(format!(
                "segment shape {}+{} exceeds {} blocks",
                self.segment_data_blocks, self.segment_check_blocks, MAX_SHARDS_PER_SEGMENT
            )));
        }

        let layout = self.layout()?;
        if layout.total_check_blocks() != self.check_keys.len() {
            return Err(invalid(format!(
                "expected {} check keys, found {}",
                layout.total_check_blocks(),
                self.check_keys.len()
            )));
        }

        let capacity = (self.data_keys.len() as u64)
            .checked_mul(self.block_size as u64)
            .ok_or_else(|| invalid("block capacity overflows"))?;
        if self.original_length > capacity {
            return Err(invalid(format!(
                "original length {} exceeds block capacity {}",
                self.original_length, capacity
            )));
        }
        Ok(())
    }

    /// Validate, and reject blocks larger than `max_block_size`.
    pub fn validate_within(&self, max_block_size: usize) -> Result<()> {
        self.validate()?;
        if self.block_size > max_block_size {
            return Err(invalid(format!(
                "block size {} exceeds the {} byte limit",
                self.block_size, max_block_size
            )));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::fetch(FetchFailureMode::InvalidMetadata, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_BLOCK_SIZE;
    use assert_matches::assert_matches;

    fn keys(n: usize, tag: u8) -> Vec<ContentKey> {
        (0..n).map(|i| ContentKey::chk_for(&[tag, i as u8])).collect()
    }

    fn splitfile(data: usize, check: usize) -> SplitfileMetadata {
        SplitfileMetadata {
            codec: CodecKind::ReedSolomon,
            segment_data_blocks: 4,
            segment_check_blocks: 2,
            block_size: 16,
            original_length: (data as u64 * 16).saturating_sub(3),
            data_keys: keys(data, 0),
            check_keys: keys(check, 1),
        }
    }

    #[test]
    fn test_document_round_trip() {
        let mut documents = BTreeMap::new();
        documents.insert(
            "index.html".to_string(),
            Metadata::SingleFileRedirect {
                target: ContentKey::chk_for(b"page"),
            },
        );
        documents.insert("big".to_string(), Metadata::Splitfile(splitfile(6, 3)));
        let manifest = Metadata::SimpleManifest {
            documents,
            default: None,
        };

        let bytes = manifest.to_bytes().unwrap();
        assert_eq!(Metadata::from_bytes(&bytes).unwrap(), manifest);
    }

    #[test]
    fn test_tagged_representation() {
        let doc = Metadata::ArchiveInternalRedirect {
            name: "a.txt".to_string(),
        };
        let json: serde_json::Value = serde_json::from_slice(&doc.to_bytes().unwrap()).unwrap();
        assert_eq!(json["kind"], "archive_internal_redirect");
        assert_eq!(json["name"], "a.txt");
    }

    #[test]
    fn test_garbage_is_invalid_metadata() {
        let err = Metadata::from_bytes(b"\x00\x01not json").unwrap_err();
        assert_eq!(err.fetch_mode(), Some(FetchFailureMode::InvalidMetadata));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_accessors() {
        let meta = splitfile(6, 3);
        let shape = meta.splitfile_shape();
        assert_eq!(shape.data_blocks, 4);
        assert_eq!(shape.check_blocks, 2);
        assert_eq!(meta.data_block_keys().len(), 6);
        assert_eq!(meta.check_block_keys().len(), 3);
        assert_eq!(meta.original_byte_length(), 93);
        assert_eq!(meta.layout().unwrap().len(), 2);
        assert!(Metadata::MultiLevel(meta).is_splitfile());
    }

    #[test]
    fn test_check_key_count_must_match_layout() {
        // 6 data blocks: a full 4+2 segment and a 2+1 segment.
        assert!(splitfile(6, 3).validate().is_ok());
        let err = splitfile(6, 4).validate().unwrap_err();
        assert_eq!(err.fetch_mode(), Some(FetchFailureMode::InvalidMetadata));
    }

    #[test]
    fn test_length_beyond_capacity_rejected() {
        let mut meta = splitfile(2, 1);
        meta.original_length = 33;
        assert_matches!(meta.validate(), Err(Error::Fetch(_)));
    }

    #[test]
    fn test_huge_block_size_rejected() {
        let mut meta = splitfile(2, 1);
        meta.block_size = usize::MAX / 2;
        assert!(meta.validate().is_ok());

        let err = meta.validate_within(DEFAULT_BLOCK_SIZE).unwrap_err();
        assert_eq!(err.fetch_mode(), Some(FetchFailureMode::InvalidMetadata));
        assert!(err.is_fatal());
        assert!(splitfile(2, 1).validate_within(DEFAULT_BLOCK_SIZE).is_ok());
    }

    #[test]
    fn test_overflowing_sizes_rejected() {
        let mut meta = splitfile(2, 1);
        meta.segment_data_blocks = usize::MAX;
        assert_eq!(
            meta.validate().unwrap_err().fetch_mode(),
            Some(FetchFailureMode::InvalidMetadata)
        );

        let mut meta = splitfile(2, 1);
        meta.block_size = usize::MAX;
        assert_eq!(
            meta.validate().unwrap_err().fetch_mode(),
            Some(FetchFailureMode::InvalidMetadata)
        );
    }

    #[test]
    fn test_oversized_shape_rejected() {
        let mut meta = splitfile(2, 1);
        meta.segment_data_blocks = 200;
        meta.segment_check_blocks = 100;
        assert!(meta.validate().is_err());
    }
}
