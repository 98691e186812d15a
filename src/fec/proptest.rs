//! Property-Based Tests for the erasure codec and segment layout
//!
//! # Test Properties
//!
//! 1. **Decode determinism**: decoding from any k surviving blocks and
//!    re-encoding reproduces the original check blocks byte for byte
//! 2. **Recovery**: any k of k+m blocks recover the original data blocks
//! 3. **Layout coverage**: segments tile the block lists without gaps

#![cfg(test)]

use std::sync::Arc;

use bytes::Bytes;
use proptest::prelude::*;

use super::codec::{CodecKind, CodecShape, ErasureCodec};
use super::engine_cache::EngineCache;
use super::layout::{SegmentLayout, SegmentLimits};

// =============================================================================
// Property Strategies
// =============================================================================

/// Shapes small enough to keep each case fast.
fn shape_strategy() -> impl Strategy<Value = (usize, usize)> {
    (1usize..=8, 1usize..=4)
}

/// A shape, a block length, block contents and the set of surviving blocks.
fn segment_strategy() -> impl Strategy<Value = (usize, usize, usize, Vec<Vec<u8>>, Vec<usize>)> {
    (shape_strategy(), 1usize..=64).prop_flat_map(|((k, m), len)| {
        let blocks = prop::collection::vec(prop::collection::vec(any::<u8>(), len), k);
        let survivors = Just((0..k + m).collect::<Vec<_>>()).prop_shuffle();
        (Just(k), Just(m), Just(len), blocks, survivors)
    })
}

fn codec() -> ErasureCodec {
    ErasureCodec::new(Arc::new(EngineCache::new(8)))
}

// =============================================================================
// Codec Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Decode from any k survivors then re-encode gives identical check blocks.
    #[test]
    fn prop_decode_then_encode_is_deterministic(
        (k, m, len, blocks, order) in segment_strategy()
    ) {
        let codec = codec();
        let shape = CodecShape::reed_solomon(k, m).unwrap();
        let data: Vec<Bytes> = blocks.into_iter().map(Bytes::from).collect();
        let check = codec.encode(shape, &data, len).unwrap();

        let keep: Vec<usize> = order.into_iter().take(k).collect();
        let mut data_slots: Vec<Option<Bytes>> = (0..k)
            .map(|i| keep.contains(&i).then(|| data[i].clone()))
            .collect();
        let mut check_slots: Vec<Option<Bytes>> = (0..m)
            .map(|i| keep.contains(&(k + i)).then(|| check[i].clone()))
            .collect();

        codec.decode(shape, &mut data_slots, &mut check_slots, len).unwrap();
        let recovered: Vec<Bytes> = data_slots.into_iter().map(Option::unwrap).collect();
        prop_assert_eq!(&recovered, &data);

        let reencoded = codec.encode(shape, &recovered, len).unwrap();
        prop_assert_eq!(reencoded, check);
    }

    /// Encoding the same data twice gives the same check blocks.
    #[test]
    fn prop_encode_is_deterministic((k, m, len, blocks, _order) in segment_strategy()) {
        let codec = codec();
        let shape = CodecShape::reed_solomon(k, m).unwrap();
        let data: Vec<Bytes> = blocks.into_iter().map(Bytes::from).collect();
        let first = codec.encode(shape, &data, len).unwrap();
        let second = codec.encode(shape, &data, len).unwrap();
        prop_assert_eq!(first, second);
    }

    /// Fewer than k survivors is always rejected.
    #[test]
    fn prop_too_few_blocks_rejected((k, m, len, blocks, order) in segment_strategy()) {
        prop_assume!(k > 1);
        let codec = codec();
        let shape = CodecShape::reed_solomon(k, m).unwrap();
        let data: Vec<Bytes> = blocks.into_iter().map(Bytes::from).collect();
        let check = codec.encode(shape, &data, len).unwrap();

        let keep: Vec<usize> = order.into_iter().take(k - 1).collect();
        let mut data_slots: Vec<Option<Bytes>> = (0..k)
            .map(|i| keep.contains(&i).then(|| data[i].clone()))
            .collect();
        let mut check_slots: Vec<Option<Bytes>> = (0..m)
            .map(|i| keep.contains(&(k + i)).then(|| check[i].clone()))
            .collect();
        prop_assert!(codec.decode(shape, &mut data_slots, &mut check_slots, len).is_err());
    }
}

// =============================================================================
// Layout Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Segments cover every block exactly once and respect the limits.
    #[test]
    fn prop_layout_tiles_blocks(
        total in 1usize..2000,
        data_limit in 1usize..=128,
        check_limit in 1usize..=64,
    ) {
        let limits = SegmentLimits {
            codec: CodecKind::ReedSolomon,
            data_blocks: data_limit,
            check_blocks: check_limit,
        };
        let layout = SegmentLayout::compute(total, limits).unwrap();

        let mut next_data = 0;
        let mut next_check = 0;
        for (i, span) in layout.segments().iter().enumerate() {
            prop_assert_eq!(span.index, i);
            prop_assert_eq!(span.data.start, next_data);
            prop_assert_eq!(span.check.start, next_check);
            prop_assert!(span.shape.data_blocks <= data_limit);
            prop_assert!(span.shape.check_blocks <= check_limit);
            prop_assert!(span.shape.check_blocks >= 1);
            next_data = span.data.end;
            next_check = span.check.end;
        }
        prop_assert_eq!(next_data, total);
        prop_assert_eq!(layout.total_check_blocks(), next_check);
    }
}
