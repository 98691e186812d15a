//! Forward Error Correction Module
//!
//! Erasure coding for splitfile segments.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           FEC Module                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐   │
//! │  │   FecQueue   │───▶│ ErasureCodec │───▶│   EngineCache    │   │
//! │  │ (worker pool)│    │ (encode/     │    │ (LRU by (k, m))  │   │
//! │  └──────────────┘    │  decode)     │    └──────────────────┘   │
//! │                      └──────────────┘                            │
//! │  ┌──────────────────────────────────┐                            │
//! │  │ SegmentLayout (block → segment)  │                            │
//! │  └──────────────────────────────────┘                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - **Codec** (`codec.rs`): Reed-Solomon and non-redundant codecs over
//!   fixed-length blocks. Decode fills missing data blocks from any k of
//!   k+m; encode produces every check block from the k data blocks.
//! - **Engine cache** (`engine_cache.rs`): engines are expensive to build,
//!   so the codec keeps the most recent ones per shape.
//! - **Queue** (`queue.rs`): CPU-bound codec work runs on the blocking pool
//!   with a small permit count.
//! - **Layout** (`layout.rs`): how data blocks are grouped into segments
//!   and how many check blocks each segment gets.
//!
//! # Usage
//!
//! ```rust,ignore
//! use splitfec::fec::{CodecShape, EngineCache, ErasureCodec};
//!
//! let codec = ErasureCodec::new(Arc::new(EngineCache::default()));
//! let shape = CodecShape::reed_solomon(3, 2)?;
//! let check = codec.encode(shape, &data_blocks, 32768)?;
//!
//! let mut data = vec![Some(d0), None, None];
//! let mut check = vec![Some(check[0].clone()), Some(check[1].clone())];
//! codec.decode(shape, &mut data, &mut check, 32768)?;
//! ```

pub mod codec;
pub mod engine_cache;
pub mod layout;
pub mod queue;

#[cfg(test)]
mod proptest;

pub use codec::{CodecKind, CodecShape, ErasureCodec};
pub use engine_cache::EngineCache;
pub use layout::{SegmentLayout, SegmentLimits, SegmentSpan};
pub use queue::{default_worker_count, DecodedBlocks, FecQueue};
