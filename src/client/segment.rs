//! Fetch segment
//!
//! One erasure-coded group of `k` data blocks and `m` check blocks. The
//! segment feeds block attempts from its retry tracker, decodes as soon as
//! `k` blocks are in, and gives up as soon as `k` can no longer be reached.
//!
//! ```text
//! start ──▶ attempts ──▶ succeeded ≥ k ──▶ decode ──▶ heal ──▶ Decoded
//!              │
//!              └──▶ succeeded + running + queued < k ──▶ Failed
//! ```
//!
//! After a decode, blocks that were hard to find are re-inserted in the
//! background: every block that failed at least once and was never fetched,
//! plus a random sample of blocks that were never tried.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::block::{fetch_block, insert_block, FetchOutcome, InsertOutcome};
use super::context::ClientContext;
use super::failure::FailureCodeTracker;
use super::retry::RetryTracker;
use crate::buffer::Buffer;
use crate::domain::events::{ClientEvent, RequestKind};
use crate::domain::ports::JobPriority;
use crate::error::{BlockCounts, Error, FetchFailure, FetchFailureMode, Result};
use crate::fec::CodecShape;
use crate::keys::ContentKey;

// =============================================================================
// Results
// =============================================================================

/// Terminal result of a segment.
#[derive(Debug)]
pub enum SegmentOutcome {
    /// The `k` data blocks, concatenated
    Decoded(Buffer),
    Failed(FetchFailure),
}

/// What a finished segment reports to its splitfile.
#[derive(Debug)]
pub struct FinishedSegment {
    pub index: usize,
    pub counts: BlockCounts,
    pub codes: FailureCodeTracker<FetchFailureMode>,
    /// Block attempts issued over the segment's life
    pub attempts: usize,
    /// Blocks handed to the healing job
    pub healed: usize,
    pub outcome: SegmentOutcome,
}

impl FinishedSegment {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SegmentOutcome::Decoded(_))
    }
}

// =============================================================================
// Fetch Segment
// =============================================================================

struct SegmentState {
    tracker: RetryTracker<FetchFailureMode>,
    /// Fetched blocks, data first then check
    blocks: Vec<Option<Buffer>>,
    attempts: usize,
    rng: StdRng,
}

/// One segment of a splitfile being fetched.
pub struct FetchSegment {
    index: usize,
    shape: CodecShape,
    block_size: usize,
    keys: Vec<ContentKey>,
    state: Mutex<SegmentState>,
}

enum Step {
    Decode,
    Fail,
    Wait(Vec<usize>),
}

impl FetchSegment {
    /// Segment over `data_keys` and `check_keys`, all registered at level 0.
    pub fn new(
        index: usize,
        shape: CodecShape,
        block_size: usize,
        data_keys: &[ContentKey],
        check_keys: &[ContentKey],
        max_retries: u32,
    ) -> Result<Self> {
        Self::build(
            index,
            shape,
            block_size,
            data_keys,
            check_keys,
            RetryTracker::new(max_retries),
            StdRng::from_entropy(),
        )
    }

    /// Like [`FetchSegment::new`] with deterministic attempt order and
    /// healing sample.
    pub fn with_seed(
        index: usize,
        shape: CodecShape,
        block_size: usize,
        data_keys: &[ContentKey],
        check_keys: &[ContentKey],
        max_retries: u32,
        seed: u64,
    ) -> Result<Self> {
        Self::build(
            index,
            shape,
            block_size,
            data_keys,
            check_keys,
            RetryTracker::with_seed(max_retries, seed),
            StdRng::seed_from_u64(seed.wrapping_add(1)),
        )
    }

    fn build(
        index: usize,
        shape: CodecShape,
        block_size: usize,
        data_keys: &[ContentKey],
        check_keys: &[ContentKey],
        mut tracker: RetryTracker<FetchFailureMode>,
        rng: StdRng,
    ) -> Result<Self> {
        if data_keys.len() != shape.data_blocks || check_keys.len() != shape.check_blocks {
            return Err(Error::fetch(
                FetchFailureMode::InvalidMetadata,
                format!(
                    "segment {} expects {} keys, got {}+{}",
                    index,
                    shape,
                    data_keys.len(),
                    check_keys.len()
                ),
            ));
        }

        let keys: Vec<ContentKey> = data_keys.iter().chain(check_keys).cloned().collect();
        for block in 0..keys.len() {
            tracker.add_block(block)?;
        }
        tracker.seal();

        Ok(Self {
            index,
            shape,
            block_size,
            state: Mutex::new(SegmentState {
                tracker,
                blocks: vec![None; keys.len()],
                attempts: 0,
                rng,
            }),
            keys,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn shape(&self) -> CodecShape {
        self.shape
    }

    /// Drive the segment to its terminal state.
    ///
    /// Consumes the segment, so it finishes exactly once.
    #[instrument(skip(self, ctx, cancel), fields(segment = self.index, shape = %self.shape))]
    pub async fn run(self, ctx: &ClientContext, cancel: &CancellationToken) -> FinishedSegment {
        let k = self.shape.min_to_decode();
        let cap = ctx.config.fetch.max_concurrent_blocks.max(1);
        let timeout = ctx.config.fetch.block_timeout();
        let network = ctx.network.as_ref();
        let buffers = ctx.buffers.as_ref();
        let attempt_cancel = cancel.child_token();
        let mut in_flight = FuturesUnordered::new();

        let step = loop {
            let step = {
                let mut state = self.state.lock();
                if cancel.is_cancelled() && !state.tracker.is_killed() {
                    debug!("Segment cancelled");
                    state.tracker.kill();
                }
                let tracker = &mut state.tracker;
                if tracker.succeeded_count() >= k {
                    tracker.kill();
                    Step::Decode
                } else if tracker.potential_successes() < k {
                    tracker.kill();
                    Step::Fail
                } else {
                    let mut launch = Vec::new();
                    while tracker.running_count() < cap {
                        match tracker.next_attempt() {
                            Some(block) => launch.push(block),
                            None => break,
                        }
                    }
                    state.attempts += launch.len();
                    Step::Wait(launch)
                }
            };

            let launch = match step {
                Step::Wait(launch) => launch,
                other => break other,
            };
            for block in launch {
                let key = &self.keys[block];
                let token = &attempt_cancel;
                trace!(block, %key, "Starting block fetch");
                in_flight.push(async move {
                    let outcome = fetch_block(network, buffers, key, timeout, token).await;
                    (block, outcome)
                });
            }

            let Some((block, outcome)) = in_flight.next().await else {
                // Nothing running and nothing queued, yet k is still in
                // reach: only possible if the tracker lost a block.
                warn!("Segment stalled with no work in flight");
                break Step::Fail;
            };
            ctx.record_block("fetch", outcome.label());
            self.record_outcome(block, outcome);
        };

        // Anything still in flight is abandoned.
        attempt_cancel.cancel();
        drop(in_flight);

        let finished = match step {
            Step::Decode => self.decode_and_heal(ctx).await,
            _ => {
                let failure = self.failure(cancel.is_cancelled());
                self.finish(SegmentOutcome::Failed(failure), 0)
            }
        };

        ctx.record_segment("fetch", finished.is_success());
        ctx.publish(ClientEvent::segment_finished(
            RequestKind::Fetch,
            self.index,
            finished.is_success(),
            finished.counts,
        ))
        .await;
        finished
    }

    fn record_outcome(&self, block: usize, outcome: FetchOutcome) {
        let mut state = self.state.lock();
        let result = match outcome {
            FetchOutcome::Success(buffer) => {
                state.blocks[block] = Some(buffer);
                state.tracker.report_success(block)
            }
            FetchOutcome::NonFatal(mode) => {
                let result = state.tracker.report_non_fatal(block, mode);
                if let Ok(retry) = &result {
                    debug!(block, %mode, ?retry, "Block fetch failed");
                }
                result.map(|_| ())
            }
            FetchOutcome::Fatal(mode) => {
                debug!(block, %mode, "Block fetch failed fatally");
                state.tracker.report_fatal(block, mode)
            }
        };
        if let Err(e) = result {
            warn!(block, error = %e, "Dropped block outcome");
        }
    }

    fn failure(&self, cancelled: bool) -> FetchFailure {
        let state = self.state.lock();
        let counts = state.tracker.counts();
        let mode = if cancelled {
            FetchFailureMode::Cancelled
        } else {
            FetchFailureMode::SplitfileError
        };
        warn!(segment = self.index, %counts, "Segment failed");
        FetchFailure::new(mode)
            .with_message(format!("segment {} cannot reach {} blocks", self.index, self.shape.data_blocks))
            .with_counts(counts)
            .with_codes(state.tracker.failure_codes())
    }

    fn finish(&self, outcome: SegmentOutcome, healed: usize) -> FinishedSegment {
        let mut state = self.state.lock();
        let counts = state.tracker.counts();
        let codes = state.tracker.failure_codes();
        // Block buffers are released here; only the decoded output lives on.
        state.blocks.iter_mut().for_each(|b| *b = None);
        FinishedSegment {
            index: self.index,
            counts,
            codes,
            attempts: state.attempts,
            healed,
            outcome,
        }
    }

    // =========================================================================
    // Decode and Healing
    // =========================================================================

    async fn decode_and_heal(&self, ctx: &ClientContext) -> FinishedSegment {
        let k = self.shape.data_blocks;
        let (data, check) = {
            let state = self.state.lock();
            let slots: Vec<Option<Bytes>> = state
                .blocks
                .iter()
                .map(|b| b.as_ref().map(|b| b.bytes().clone()))
                .collect();
            let check = slots[k..].to_vec();
            let mut data = slots;
            data.truncate(k);
            (data, check)
        };

        ctx.record_fec_job("decode");
        let decoded = match ctx
            .fec
            .decode(self.shape, data, check, self.block_size)
            .await
        {
            Ok(decoded) => decoded,
            Err(e) => return self.finish(SegmentOutcome::Failed(self.decode_failure(e)), 0),
        };

        let mut out = BytesMut::with_capacity(k * self.block_size);
        for block in &decoded.data {
            if block.len() != self.block_size {
                let e = Error::FecDecodingFailed(format!(
                    "block of {} bytes in a segment of {} byte blocks",
                    block.len(),
                    self.block_size
                ));
                return self.finish(SegmentOutcome::Failed(self.decode_failure(e)), 0);
            }
            out.extend_from_slice(block);
        }
        let output = ctx.buffers.make_buffer(out.freeze());
        debug!(segment = self.index, len = output.len(), "Segment decoded");

        let healed = if ctx.config.fetch.heal {
            self.heal(ctx, &decoded.data, decoded.check).await
        } else {
            0
        };
        self.finish(SegmentOutcome::Decoded(output), healed)
    }

    fn decode_failure(&self, error: Error) -> FetchFailure {
        let state = self.state.lock();
        warn!(segment = self.index, error = %error, "Segment decode failed");
        FetchFailure::new(FetchFailureMode::SplitfileDecodeError)
            .with_message(error.to_string())
            .with_counts(state.tracker.counts())
            .with_codes(state.tracker.failure_codes())
    }

    /// Blocks to re-insert: never fetched, and either failed before or
    /// drawn in the sample of untried blocks.
    fn healing_candidates(&self, denominator: u32) -> Vec<usize> {
        let mut state = self.state.lock();
        let denominator = denominator.max(1);
        let mut candidates = Vec::new();
        for block in 0..self.keys.len() {
            if state.blocks[block].is_some() {
                continue;
            }
            if state.tracker.tries(block) > 0 || state.rng.gen_range(0..denominator) == 0 {
                candidates.push(block);
            }
        }
        candidates
    }

    async fn heal(
        &self,
        ctx: &ClientContext,
        data: &[Bytes],
        mut check: Vec<Option<Bytes>>,
    ) -> usize {
        let k = self.shape.data_blocks;
        let candidates = self.healing_candidates(ctx.config.fetch.heal_sample_denominator);
        if candidates.is_empty() {
            return 0;
        }

        // Check blocks are only regenerated if one of them needs healing.
        if candidates.iter().any(|b| *b >= k && check[b - k].is_none()) {
            ctx.record_fec_job("encode");
            match ctx
                .fec
                .encode(self.shape, data.to_vec(), self.block_size)
                .await
            {
                Ok(encoded) => check = encoded.into_iter().map(Some).collect(),
                Err(e) => {
                    warn!(segment = self.index, error = %e, "Could not regenerate check blocks for healing");
                }
            }
        }

        let mut blocks: Vec<(ContentKey, Bytes)> = Vec::with_capacity(candidates.len());
        for block in candidates {
            let payload = if block < k {
                Some(data[block].clone())
            } else {
                check.get(block - k).cloned().flatten()
            };
            if let Some(payload) = payload {
                blocks.push((self.keys[block].clone(), payload));
            }
        }
        if blocks.is_empty() {
            return 0;
        }

        let queued = blocks.len();
        info!(segment = self.index, blocks = queued, "Queueing healing inserts");
        if let Some(metrics) = &ctx.metrics {
            metrics.record_healing_n("queued", queued);
        }
        ctx.publish(ClientEvent::healing_queued(self.index, queued))
            .await;

        let network = Arc::clone(&ctx.network);
        let metrics = ctx.metrics.clone();
        let timeout = ctx.config.insert.block_timeout();
        let segment = self.index;
        ctx.jobs.enqueue(
            Box::pin(async move {
                let cancel = CancellationToken::new();
                for (key, payload) in blocks {
                    let outcome =
                        insert_block(network.as_ref(), payload, Some(&key), timeout, &cancel).await;
                    let label = match &outcome {
                        InsertOutcome::Success(_) => "success",
                        InsertOutcome::NonFatal(mode) | InsertOutcome::Fatal(mode) => {
                            debug!(segment, %key, %mode, "Healing insert failed");
                            "failure"
                        }
                    };
                    if let Some(metrics) = &metrics {
                        metrics.record_healing(label);
                    }
                }
            }),
            JobPriority::Background,
        );
        queued
    }
}

impl std::fmt::Debug for FetchSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchSegment")
            .field("index", &self.index)
            .field("shape", &self.shape)
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::event_publisher::InMemoryEventCollector;
    use crate::adapters::memory_network::{FetchStep, InMemoryNetwork};
    use crate::adapters::tokio_jobs::TokioJobQueue;
    use crate::buffer::{BufferLedger, InMemoryBufferFactory};
    use crate::config::ClientConfig;
    use crate::domain::ports::NetworkFetchError;
    use crate::fec::{EngineCache, ErasureCodec};
    use crate::metrics::ClientMetrics;
    use assert_matches::assert_matches;

    const BLOCK: usize = 64;

    struct Fixture {
        network: Arc<InMemoryNetwork>,
        jobs: Arc<TokioJobQueue>,
        events: Arc<InMemoryEventCollector>,
        ledger: Arc<BufferLedger>,
        metrics: Arc<ClientMetrics>,
        ctx: ClientContext,
        data: Vec<Bytes>,
        data_keys: Vec<ContentKey>,
        check_keys: Vec<ContentKey>,
    }

    /// Store a 3+2 segment and build a context over it.
    fn fixture(configure: impl FnOnce(&mut ClientConfig)) -> Fixture {
        let network = Arc::new(InMemoryNetwork::with_seed(11));
        let data: Vec<Bytes> = (0..3u8)
            .map(|i| Bytes::from(vec![i + 1; BLOCK]))
            .collect();
        let codec = ErasureCodec::new(Arc::new(EngineCache::default()));
        let shape = CodecShape::reed_solomon(3, 2).unwrap();
        let check = codec.encode(shape, &data, BLOCK).unwrap();

        let data_keys = data.iter().map(|b| network.store(b.clone())).collect();
        let check_keys = check.iter().map(|b| network.store(b.clone())).collect();

        let mut config = ClientConfig::default();
        config.fetch.block_timeout_ms = 200;
        configure(&mut config);

        let jobs = Arc::new(TokioJobQueue::default());
        let events = Arc::new(InMemoryEventCollector::new());
        let ledger = Arc::new(BufferLedger::new());
        let metrics = Arc::new(ClientMetrics::new().unwrap());
        let ctx = ClientContext::new(network.clone(), config)
            .unwrap()
            .with_jobs(jobs.clone())
            .with_events(events.clone())
            .with_buffers(Arc::new(InMemoryBufferFactory::with_ledger(ledger.clone())))
            .with_metrics(metrics.clone());

        Fixture {
            network,
            jobs,
            events,
            ledger,
            metrics,
            ctx,
            data,
            data_keys,
            check_keys,
        }
    }

    fn segment(f: &Fixture, max_retries: u32) -> FetchSegment {
        FetchSegment::with_seed(
            0,
            CodecShape::reed_solomon(3, 2).unwrap(),
            BLOCK,
            &f.data_keys,
            &f.check_keys,
            max_retries,
            5,
        )
        .unwrap()
    }

    fn expected(f: &Fixture) -> Vec<u8> {
        f.data.iter().flat_map(|b| b.iter().copied()).collect()
    }

    #[tokio::test]
    async fn test_all_blocks_available() {
        let f = fixture(|_| {});
        let finished = segment(&f, 3).run(&f.ctx, &CancellationToken::new()).await;

        assert_eq!(finished.index, 0);
        let buffer = assert_matches!(finished.outcome, SegmentOutcome::Decoded(b) => b);
        assert_eq!(buffer.as_slice(), expected(&f).as_slice());
        assert_eq!(f.events.events_of_type("SegmentFinished").len(), 1);
        assert_eq!(f.metrics.segment_count("fetch", true), 1);
    }

    #[tokio::test]
    async fn test_decode_reconstructs_fatal_data_block() {
        // D0, D1 and C0 arrive, D2 is corrupt, C1 never answers.
        let f = fixture(|_| {});
        f.network.poison(&f.data_keys[2], FetchStep::Corrupt);
        f.network.poison(&f.check_keys[1], FetchStep::Hang);

        let finished = segment(&f, 3).run(&f.ctx, &CancellationToken::new()).await;

        // D2 can never succeed, so its contents came from the decoder.
        assert_eq!(finished.counts.succeeded, 3);
        let buffer = assert_matches!(finished.outcome, SegmentOutcome::Decoded(b) => b);
        assert_eq!(buffer.as_slice(), expected(&f).as_slice());
    }

    #[tokio::test]
    async fn test_unreachable_threshold_fails() {
        // D0, C0, C1 fatal and D1 never found: only D2 can succeed.
        let f = fixture(|_| {});
        f.network.poison(&f.data_keys[0], FetchStep::Corrupt);
        f.network
            .poison(&f.data_keys[1], FetchStep::Fail(NetworkFetchError::DataNotFound));
        f.network.poison(&f.check_keys[0], FetchStep::Corrupt);
        f.network.poison(&f.check_keys[1], FetchStep::Corrupt);

        let finished = segment(&f, 2).run(&f.ctx, &CancellationToken::new()).await;

        let failure = assert_matches!(finished.outcome, SegmentOutcome::Failed(ref e) => e.clone());
        assert_eq!(failure.mode, FetchFailureMode::SplitfileError);
        assert!(failure.is_fatal());
        assert!(finished.counts.fatal >= 1);
        assert_eq!(f.metrics.segment_count("fetch", false), 1);
        assert_eq!(f.events.events_of_type("HealingQueued").len(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_nonfatal() {
        let f = fixture(|_| {});
        for key in f.data_keys.iter().take(2).chain(f.check_keys.iter()) {
            f.network
                .poison(key, FetchStep::Fail(NetworkFetchError::RouteNotFound));
        }

        let finished = segment(&f, 1).run(&f.ctx, &CancellationToken::new()).await;

        let failure = assert_matches!(finished.outcome, SegmentOutcome::Failed(e) => e);
        assert!(!failure.is_fatal());
        assert_eq!(finished.counts.fatal, 0);
        assert!(finished.counts.failed >= 2);
    }

    #[tokio::test]
    async fn test_no_attempts_after_threshold() {
        // One attempt at a time: exactly k fetches when nothing fails.
        let f = fixture(|c| c.fetch.max_concurrent_blocks = 1);
        let finished = segment(&f, 3).run(&f.ctx, &CancellationToken::new()).await;

        assert!(finished.is_success());
        assert_eq!(finished.attempts, 3);
        assert_eq!(f.network.fetch_count(), 3);
    }

    #[tokio::test]
    async fn test_retries_recover_transient_failures() {
        let f = fixture(|c| c.fetch.max_concurrent_blocks = 1);
        f.network.script_fetch(
            &f.data_keys[0],
            [
                FetchStep::Fail(NetworkFetchError::RejectedOverload),
                FetchStep::Fail(NetworkFetchError::TransferFailed),
            ],
        );

        let finished = segment(&f, 3).run(&f.ctx, &CancellationToken::new()).await;
        assert!(finished.is_success());
        assert_eq!(f.metrics.block_count("fetch", "nonfatal"), finished.attempts as u64 - 3);
    }

    #[tokio::test]
    async fn test_healing_reinserts_failed_blocks() {
        // Every first attempt fails, so D1 and C0 have been tried before
        // the retries of D0, D2 and C1 bring the segment to k.
        let f = fixture(|_| {});
        for key in [&f.data_keys[0], &f.data_keys[2], &f.check_keys[1]] {
            f.network
                .script_fetch(key, [FetchStep::Fail(NetworkFetchError::RejectedOverload)]);
        }
        f.network.poison(&f.data_keys[1], FetchStep::Corrupt);
        f.network.remove(&f.check_keys[0]);
        f.network
            .poison(&f.check_keys[0], FetchStep::Fail(NetworkFetchError::DataNotFound));

        let finished = segment(&f, 1).run(&f.ctx, &CancellationToken::new()).await;
        assert!(finished.is_success());
        f.jobs.drain().await;

        // D1 failed fatally and C0 ran out of retries; both were re-inserted.
        assert!(finished.healed >= 2);
        assert_eq!(f.events.events_of_type("HealingQueued").len(), 1);
        assert!(f.network.contains(&f.check_keys[0]));
        assert!(f.metrics.healing_count("success") >= 2);
        assert_eq!(f.metrics.healing_count("queued"), finished.healed as u64);
    }

    #[tokio::test]
    async fn test_healing_disabled() {
        let f = fixture(|c| c.fetch.heal = false);
        f.network.poison(&f.data_keys[1], FetchStep::Corrupt);

        let finished = segment(&f, 0).run(&f.ctx, &CancellationToken::new()).await;
        assert!(finished.is_success());
        assert_eq!(finished.healed, 0);
        assert!(f.events.events_of_type("HealingQueued").is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let f = fixture(|_| {});
        let cancel = CancellationToken::new();
        cancel.cancel();

        let finished = segment(&f, 3).run(&f.ctx, &cancel).await;
        let failure = assert_matches!(finished.outcome, SegmentOutcome::Failed(e) => e);
        assert_eq!(failure.mode, FetchFailureMode::Cancelled);
        assert_eq!(finished.attempts, 0);
    }

    #[tokio::test]
    async fn test_block_buffers_released_after_decode() {
        let f = fixture(|c| c.fetch.heal = false);
        let finished = segment(&f, 3).run(&f.ctx, &CancellationToken::new()).await;

        // Only the decoded output is still alive.
        assert_eq!(f.ledger.live(), 1);
        drop(finished);
        assert_eq!(f.ledger.live(), 0);
        assert_eq!(f.ledger.acquired(), f.ledger.released());
    }

    #[test]
    fn test_key_count_must_match_shape() {
        let keys: Vec<ContentKey> = (0..3u8).map(|i| ContentKey::chk_for(&[i])).collect();
        let err = FetchSegment::new(
            0,
            CodecShape::reed_solomon(3, 2).unwrap(),
            BLOCK,
            &keys,
            &keys[..1],
            3,
        )
        .unwrap_err();
        assert_eq!(err.fetch_mode(), Some(FetchFailureMode::InvalidMetadata));
    }
}
