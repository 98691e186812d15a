//! Splitfile client
//!
//! Fetch and insert of FEC-protected splitfiles, plus the getter that
//! resolves URIs through metadata documents.
//!
//! # Layers
//!
//! ```text
//! ClientGetter ──▶ SplitfileFetcher ──▶ FetchSegment ──▶ block attempts
//! SplitfileInserter ──▶ InsertSegment ──▶ block attempts
//! ```
//!
//! Every segment owns a [`RetryTracker`] that decides which block to try
//! next and when the segment is finished.

pub mod block;
pub mod context;
pub mod failure;
pub mod fetcher;
pub mod getter;
pub mod insert_segment;
pub mod inserter;
pub mod metadata;
pub mod retry;
pub mod segment;

pub use block::{FetchOutcome, InsertOutcome};
pub use context::ClientContext;
pub use failure::FailureCodeTracker;
pub use fetcher::SplitfileFetcher;
pub use getter::ClientGetter;
pub use insert_segment::{FinishedInsertSegment, InsertSegment};
pub use inserter::{insert_metadata, split_blocks, InsertResult, SplitfileInserter};
pub use metadata::{Metadata, SplitfileMetadata};
pub use retry::{BlockState, RetryOutcome, RetryTracker};
pub use segment::{FetchSegment, FinishedSegment, SegmentOutcome};
