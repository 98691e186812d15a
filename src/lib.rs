//! splitfec - FEC Splitfile Engine
//!
//! Stores large content on an unreliable content-addressed block network by
//! splitting it into fixed-size blocks, grouping the blocks into segments
//! and adding Reed-Solomon check blocks to each segment. Any `k` of a
//! segment's `n` blocks recover it.
//!
//! # Architecture
//!
//! ```text
//! ClientGetter (metadata walk) → SplitfileFetcher → FetchSegment → BlockNetwork
//!                                                        │
//!                                              FecQueue (decode, heal)
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - In-memory network, bundle archives, job queue, event publishers
//! - [`archive`] - Bounded cache of extracted archive members
//! - [`buffer`] - Reference-counted block buffers
//! - [`client`] - Segments, retry scheduling, fetcher, inserter, getter
//! - [`config`] - YAML-loadable client configuration
//! - [`domain`] - Ports and events
//! - [`error`] - Error types and failure modes
//! - [`fec`] - Erasure codec, engine cache, segment layout, worker pool
//! - [`keys`] - Content keys and client URIs
//! - [`metrics`] - Prometheus counters

pub mod adapters;
pub mod archive;
pub mod buffer;
pub mod client;
pub mod config;
pub mod domain;
pub mod error;
pub mod fec;
pub mod keys;
pub mod metrics;

// Re-export commonly used types
pub use archive::{ArchiveBucketCache, ArchiveKey, ArchiveReader};
pub use buffer::{Buffer, BufferFactory, BufferLedger, InMemoryBufferFactory};
pub use client::{
    ClientContext, ClientGetter, Metadata, RetryTracker, SplitfileFetcher, SplitfileInserter,
    SplitfileMetadata,
};
pub use config::ClientConfig;
pub use error::{Error, FetchFailureMode, InsertFailureMode, Result};
pub use fec::{CodecShape, ErasureCodec, FecQueue, SegmentLayout};
pub use keys::{ClientUri, ContentKey};
pub use metrics::ClientMetrics;
