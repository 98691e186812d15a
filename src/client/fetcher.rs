//! Splitfile fetcher
//!
//! Builds one [`FetchSegment`] per segment of the layout, starts them in
//! random order as segment slots free up, and waits for all of them. The
//! content is returned only if every segment decoded; otherwise the caller
//! gets one failure carrying the block tallies of the whole splitfile.

use bytes::BytesMut;
use futures::stream::{FuturesUnordered, StreamExt};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::context::ClientContext;
use super::failure::FailureCodeTracker;
use super::metadata::SplitfileMetadata;
use super::segment::{FetchSegment, FinishedSegment, SegmentOutcome};
use crate::buffer::Buffer;
use crate::domain::events::{ClientEvent, RequestKind};
use crate::error::{BlockCounts, Error, FetchFailure, FetchFailureMode, Result};

/// Fetches and reassembles splitfiles.
#[derive(Debug, Clone)]
pub struct SplitfileFetcher {
    ctx: ClientContext,
    seed: Option<u64>,
}

impl SplitfileFetcher {
    pub fn new(ctx: ClientContext) -> Self {
        Self { ctx, seed: None }
    }

    /// Deterministic segment order and block selection, for tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Fetch every segment of `metadata` and return the original content.
    #[instrument(skip(self, metadata, cancel), fields(
        data_blocks = metadata.data_keys.len(),
        length = metadata.original_length
    ))]
    pub async fn fetch(
        &self,
        metadata: &SplitfileMetadata,
        cancel: &CancellationToken,
    ) -> Result<Buffer> {
        let fetch = &self.ctx.config.fetch;
        metadata.validate_within(fetch.max_block_size)?;
        if metadata.original_length > fetch.max_output_length {
            return Err(Error::fetch(
                FetchFailureMode::TooBig,
                format!(
                    "{} bytes exceeds the {} byte limit",
                    metadata.original_length, fetch.max_output_length
                ),
            ));
        }

        let layout = metadata.layout()?;
        let total = layout.len();
        let mut pending = Vec::with_capacity(total);
        for span in layout.segments() {
            let data_keys = &metadata.data_keys[span.data.clone()];
            let check_keys = &metadata.check_keys[span.check.clone()];
            let segment = match self.seed {
                Some(seed) => FetchSegment::with_seed(
                    span.index,
                    span.shape,
                    metadata.block_size,
                    data_keys,
                    check_keys,
                    fetch.max_block_retries,
                    seed.wrapping_add(span.index as u64),
                )?,
                None => FetchSegment::new(
                    span.index,
                    span.shape,
                    metadata.block_size,
                    data_keys,
                    check_keys,
                    fetch.max_block_retries,
                )?,
            };
            pending.push(segment);
        }

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        pending.shuffle(&mut rng);

        let finished = self.run_segments(pending, cancel).await;
        self.assemble(metadata, finished, cancel)
    }

    /// Run segments with at most `max_concurrent_segments` at a time.
    async fn run_segments(
        &self,
        mut pending: Vec<FetchSegment>,
        cancel: &CancellationToken,
    ) -> Vec<FinishedSegment> {
        let total = pending.len();
        let slots = self.ctx.config.fetch.max_concurrent_segments.max(1);
        let mut running = FuturesUnordered::new();
        let mut finished = Vec::with_capacity(total);

        loop {
            while running.len() < slots {
                let Some(segment) = pending.pop() else { break };
                debug!(segment = segment.index(), "Starting segment");
                running.push(segment.run(&self.ctx, cancel));
            }
            let Some(done) = running.next().await else {
                break;
            };
            finished.push(done);
            self.ctx
                .publish(ClientEvent::splitfile_progress(
                    RequestKind::Fetch,
                    finished.len(),
                    total,
                ))
                .await;
        }

        finished.sort_by_key(|s| s.index);
        finished
    }

    fn assemble(
        &self,
        metadata: &SplitfileMetadata,
        finished: Vec<FinishedSegment>,
        cancel: &CancellationToken,
    ) -> Result<Buffer> {
        let total = finished.len();
        let mut counts = BlockCounts::default();
        let mut codes = FailureCodeTracker::new();
        let mut failures = Vec::new();
        let mut decoded = Vec::with_capacity(total);

        for segment in finished {
            counts.merge(&segment.counts);
            codes.merge(&segment.codes);
            match segment.outcome {
                SegmentOutcome::Decoded(buffer) => decoded.push(buffer),
                SegmentOutcome::Failed(failure) => failures.push(failure),
            }
        }

        if !failures.is_empty() {
            let mode = if cancel.is_cancelled() {
                FetchFailureMode::Cancelled
            } else if failures
                .iter()
                .any(|f| f.mode == FetchFailureMode::SplitfileDecodeError)
            {
                FetchFailureMode::SplitfileDecodeError
            } else {
                FetchFailureMode::SplitfileError
            };
            let failure = FetchFailure::new(mode)
                .with_message(format!("{} of {} segments failed", failures.len(), total))
                .with_counts(counts)
                .with_codes(codes);
            warn!(%counts, fatal = failure.is_fatal(), "Splitfile fetch failed");
            return Err(failure.into());
        }

        let length = metadata.original_length as usize;
        let mut out = BytesMut::with_capacity(length);
        for buffer in &decoded {
            let take = buffer.len().min(length - out.len());
            out.extend_from_slice(&buffer.as_slice()[..take]);
        }
        if out.len() != length {
            return Err(Error::fetch(
                FetchFailureMode::SplitfileDecodeError,
                format!("assembled {} of {} bytes", out.len(), length),
            ));
        }
        drop(decoded);

        info!(segments = total, bytes = length, "Splitfile fetched");
        Ok(self.ctx.buffers.make_buffer(out.freeze()))
    }
}
