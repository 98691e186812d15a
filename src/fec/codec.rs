//! Erasure codec
//!
//! Fills in missing data blocks from any k of the k+m blocks of a segment,
//! and generates check blocks from a complete set of data blocks. The
//! redundant codec is Reed-Solomon over GF(2^8); the non-redundant codec
//! has no check blocks and cannot recover anything.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::engine_cache::EngineCache;
use crate::config::MAX_SHARDS_PER_SEGMENT;
use crate::error::{Error, Result};

// =============================================================================
// Codec Shape
// =============================================================================

/// Redundancy scheme of a splitfile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    /// k data blocks, no check blocks
    NonRedundant,
    /// k data blocks, m Reed-Solomon check blocks
    ReedSolomon,
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecKind::NonRedundant => f.write_str("non-redundant"),
            CodecKind::ReedSolomon => f.write_str("reed-solomon"),
        }
    }
}

/// The (k, m) shape of one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodecShape {
    pub codec: CodecKind,
    pub data_blocks: usize,
    pub check_blocks: usize,
}

impl CodecShape {
    /// Validated shape.
    pub fn new(codec: CodecKind, data_blocks: usize, check_blocks: usize) -> Result<Self> {
        if data_blocks == 0 {
            return Err(Error::InvalidFecConfig(
                "data_blocks must be greater than 0".to_string(),
            ));
        }
        match codec {
            CodecKind::NonRedundant if check_blocks != 0 => {
                return Err(Error::InvalidFecConfig(format!(
                    "non-redundant codec cannot have {} check blocks",
                    check_blocks
                )));
            }
            CodecKind::ReedSolomon if check_blocks == 0 => {
                return Err(Error::InvalidFecConfig(
                    "reed-solomon codec needs at least one check block".to_string(),
                ));
            }
            CodecKind::ReedSolomon if data_blocks + check_blocks > MAX_SHARDS_PER_SEGMENT => {
                return Err(Error::InvalidFecConfig(format!(
                    "shape {}+{} exceeds {} blocks",
                    data_blocks, check_blocks, MAX_SHARDS_PER_SEGMENT
                )));
            }
            _ => {}
        }
        Ok(Self {
            codec,
            data_blocks,
            check_blocks,
        })
    }

    pub fn reed_solomon(data_blocks: usize, check_blocks: usize) -> Result<Self> {
        Self::new(CodecKind::ReedSolomon, data_blocks, check_blocks)
    }

    pub fn non_redundant(data_blocks: usize) -> Result<Self> {
        Self::new(CodecKind::NonRedundant, data_blocks, 0)
    }

    pub fn total_blocks(&self) -> usize {
        self.data_blocks + self.check_blocks
    }

    /// Successful blocks needed before decoding can start.
    pub fn min_to_decode(&self) -> usize {
        self.data_blocks
    }
}

impl fmt::Display for CodecShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}+{})", self.codec, self.data_blocks, self.check_blocks)
    }
}

// =============================================================================
// Erasure Codec
// =============================================================================

/// Stateless encode/decode over injected, shape-keyed engines.
#[derive(Debug, Clone)]
pub struct ErasureCodec {
    engines: Arc<EngineCache>,
}

impl ErasureCodec {
    pub fn new(engines: Arc<EngineCache>) -> Self {
        Self { engines }
    }

    pub fn engines(&self) -> &Arc<EngineCache> {
        &self.engines
    }

    /// Fill in every missing data block.
    ///
    /// At least `k` of the `k + m` blocks must be present. Check blocks are
    /// left as they are.
    #[instrument(skip(self, data, check))]
    pub fn decode(
        &self,
        shape: CodecShape,
        data: &mut [Option<Bytes>],
        check: &mut [Option<Bytes>],
        block_len: usize,
    ) -> Result<()> {
        check_slots(shape, data.len(), check.len())?;

        let present = data.iter().chain(check.iter()).filter(|b| b.is_some()).count();
        if data.iter().all(Option::is_some) {
            return Ok(());
        }

        match shape.codec {
            CodecKind::NonRedundant => Err(Error::InsufficientBlocks {
                available: present,
                required: shape.data_blocks,
            }),
            CodecKind::ReedSolomon => {
                if present < shape.data_blocks {
                    return Err(Error::InsufficientBlocks {
                        available: present,
                        required: shape.data_blocks,
                    });
                }

                let mut shards: Vec<Option<Vec<u8>>> = data
                    .iter()
                    .chain(check.iter())
                    .map(|b| b.as_ref().map(|b| padded(b, block_len)).transpose())
                    .collect::<Result<_>>()?;

                let engine = self.engines.engine(shape.data_blocks, shape.check_blocks)?;
                engine.reconstruct_data(&mut shards).map_err(|e| {
                    Error::FecDecodingFailed(format!("Reed-Solomon reconstruction failed: {}", e))
                })?;

                let mut recovered = 0;
                for (slot, shard) in data.iter_mut().zip(shards) {
                    if slot.is_none() {
                        let shard = shard.ok_or_else(|| {
                            Error::FecDecodingFailed("engine left a data block empty".to_string())
                        })?;
                        *slot = Some(Bytes::from(shard));
                        recovered += 1;
                    }
                }

                debug!(recovered, present, "Decoded segment");
                Ok(())
            }
        }
    }

    /// Generate all check blocks from a complete set of data blocks.
    ///
    /// Returns an empty vector for the non-redundant codec.
    #[instrument(skip(self, data))]
    pub fn encode(&self, shape: CodecShape, data: &[Bytes], block_len: usize) -> Result<Vec<Bytes>> {
        if data.len() != shape.data_blocks {
            return Err(Error::InvalidFecConfig(format!(
                "Expected {} data blocks, got {}",
                shape.data_blocks,
                data.len()
            )));
        }
        if shape.codec == CodecKind::NonRedundant {
            return Ok(Vec::new());
        }

        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(shape.total_blocks());
        for block in data {
            shards.push(padded(block, block_len)?);
        }
        shards.resize(shape.total_blocks(), vec![0u8; block_len]);

        let engine = self.engines.engine(shape.data_blocks, shape.check_blocks)?;
        engine.encode(&mut shards).map_err(|e| {
            Error::FecEncodingFailed(format!("Reed-Solomon encoding failed: {}", e))
        })?;

        debug!(check_blocks = shape.check_blocks, block_len, "Encoded segment");
        Ok(shards
            .into_iter()
            .skip(shape.data_blocks)
            .map(Bytes::from)
            .collect())
    }
}

fn check_slots(shape: CodecShape, data: usize, check: usize) -> Result<()> {
    if data != shape.data_blocks || check != shape.check_blocks {
        return Err(Error::InvalidFecConfig(format!(
            "Expected {}+{} block slots, got {}+{}",
            shape.data_blocks, shape.check_blocks, data, check
        )));
    }
    Ok(())
}

/// Copy a block into a zero-padded shard of exactly `block_len` bytes.
fn padded(block: &Bytes, block_len: usize) -> Result<Vec<u8>> {
    if block.len() > block_len {
        return Err(Error::InvalidFecConfig(format!(
            "Block of {} bytes exceeds block length {}",
            block.len(),
            block_len
        )));
    }
    let mut shard = Vec::with_capacity(block_len);
    shard.extend_from_slice(block);
    shard.resize(block_len, 0);
    Ok(shard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn codec() -> ErasureCodec {
        ErasureCodec::new(Arc::new(EngineCache::new(4)))
    }

    fn blocks(count: usize, len: usize) -> Vec<Bytes> {
        (0..count)
            .map(|i| Bytes::from((0..len).map(|j| (i * 31 + j * 7) as u8).collect::<Vec<_>>()))
            .collect()
    }

    #[test]
    fn test_shape_validation() {
        assert!(CodecShape::reed_solomon(3, 2).is_ok());
        assert!(CodecShape::non_redundant(5).is_ok());
        assert!(CodecShape::reed_solomon(0, 2).is_err());
        assert!(CodecShape::reed_solomon(3, 0).is_err());
        assert!(CodecShape::new(CodecKind::NonRedundant, 3, 1).is_err());
        assert!(CodecShape::reed_solomon(200, 57).is_err());
        assert_eq!(CodecShape::reed_solomon(128, 64).unwrap().min_to_decode(), 128);
    }

    #[test]
    fn test_encode_then_decode_missing_data() {
        let codec = codec();
        let shape = CodecShape::reed_solomon(3, 2).unwrap();
        let original = blocks(3, 64);
        let check = codec.encode(shape, &original, 64).unwrap();
        assert_eq!(check.len(), 2);

        let mut data = vec![Some(original[0].clone()), None, None];
        let mut check_slots = vec![Some(check[0].clone()), Some(check[1].clone())];
        codec.decode(shape, &mut data, &mut check_slots, 64).unwrap();

        let decoded: Vec<Bytes> = data.into_iter().map(Option::unwrap).collect();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_decode_needs_k_blocks() {
        let codec = codec();
        let shape = CodecShape::reed_solomon(3, 2).unwrap();
        let original = blocks(3, 16);
        let check = codec.encode(shape, &original, 16).unwrap();

        let mut data = vec![Some(original[0].clone()), None, None];
        let mut check_slots = vec![Some(check[0].clone()), None];
        assert_matches!(
            codec.decode(shape, &mut data, &mut check_slots, 16),
            Err(Error::InsufficientBlocks {
                available: 2,
                required: 3
            })
        );
    }

    #[test]
    fn test_non_redundant() {
        let codec = codec();
        let shape = CodecShape::non_redundant(2).unwrap();
        let original = blocks(2, 8);
        assert!(codec.encode(shape, &original, 8).unwrap().is_empty());

        let mut data = vec![Some(original[0].clone()), Some(original[1].clone())];
        codec.decode(shape, &mut data, &mut [], 8).unwrap();

        let mut missing = vec![Some(original[0].clone()), None];
        assert_matches!(
            codec.decode(shape, &mut missing, &mut [], 8),
            Err(Error::InsufficientBlocks { .. })
        );
    }

    #[test]
    fn test_short_block_is_padded() {
        let codec = codec();
        let shape = CodecShape::reed_solomon(2, 1).unwrap();
        let data = vec![Bytes::from_static(b"abcd"), Bytes::from_static(b"ef")];
        let check = codec.encode(shape, &data, 4).unwrap();

        let mut slots = vec![Some(data[0].clone()), None];
        let mut check_slots = vec![Some(check[0].clone())];
        codec.decode(shape, &mut slots, &mut check_slots, 4).unwrap();
        assert_eq!(slots[1].as_deref(), Some(&b"ef\0\0"[..]));
    }

    #[test]
    fn test_oversized_block_rejected() {
        let codec = codec();
        let shape = CodecShape::reed_solomon(2, 1).unwrap();
        let data = vec![Bytes::from_static(b"abcdef"), Bytes::from_static(b"ef")];
        assert_matches!(
            codec.encode(shape, &data, 4),
            Err(Error::InvalidFecConfig(_))
        );
    }
}
