//! Insert segment
//!
//! The insert-side mirror of a fetch segment. Check blocks are encoded up
//! front, so every block's key is known before any of them is inserted.
//! The segment is done only when every block, data and check, has either
//! been inserted or run out of retries.

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use super::block::{insert_block, InsertOutcome};
use super::context::ClientContext;
use super::failure::FailureCodeTracker;
use super::retry::RetryTracker;
use crate::domain::events::{ClientEvent, RequestKind};
use crate::error::{BlockCounts, Error, InsertFailure, InsertFailureMode, Result};
use crate::fec::CodecShape;
use crate::keys::ContentKey;

/// What a finished insert segment reports to its splitfile.
#[derive(Debug)]
pub struct FinishedInsertSegment {
    pub index: usize,
    pub counts: BlockCounts,
    pub codes: FailureCodeTracker<InsertFailureMode>,
    pub attempts: usize,
    /// `Ok` when every block was inserted
    pub outcome: std::result::Result<(), InsertFailure>,
}

impl FinishedInsertSegment {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

struct InsertState {
    tracker: RetryTracker<InsertFailureMode>,
    attempts: usize,
}

/// One encoded segment waiting to be inserted.
pub struct InsertSegment {
    index: usize,
    shape: CodecShape,
    blocks: Vec<Bytes>,
    keys: Vec<ContentKey>,
    state: Mutex<InsertState>,
}

impl InsertSegment {
    /// Encode check blocks for `data` and derive every block key.
    ///
    /// Every data block must already be padded to `block_size`.
    #[instrument(skip(ctx, data), fields(blocks = data.len()))]
    pub async fn encode(
        ctx: &ClientContext,
        index: usize,
        shape: CodecShape,
        block_size: usize,
        data: Vec<Bytes>,
    ) -> Result<Self> {
        if let Some(bad) = data.iter().find(|b| b.len() != block_size) {
            return Err(Error::InvalidFecConfig(format!(
                "data block of {} bytes in a segment of {} byte blocks",
                bad.len(),
                block_size
            )));
        }

        ctx.record_fec_job("encode");
        let check = ctx.fec.encode(shape, data.clone(), block_size).await?;
        let mut blocks = data;
        blocks.extend(check);

        let keys = blocks.iter().map(|b| ContentKey::chk_for(b)).collect();
        let mut tracker = RetryTracker::new(ctx.config.insert.max_block_retries);
        for block in 0..blocks.len() {
            tracker.add_block(block)?;
        }
        tracker.seal();

        debug!(segment = index, %shape, "Insert segment encoded");
        Ok(Self {
            index,
            shape,
            blocks,
            keys,
            state: Mutex::new(InsertState {
                tracker,
                attempts: 0,
            }),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn shape(&self) -> CodecShape {
        self.shape
    }

    pub fn data_keys(&self) -> &[ContentKey] {
        &self.keys[..self.shape.data_blocks]
    }

    pub fn check_keys(&self) -> &[ContentKey] {
        &self.keys[self.shape.data_blocks..]
    }

    /// Insert every block until each one is terminal.
    #[instrument(skip(self, ctx, cancel), fields(segment = self.index, shape = %self.shape))]
    pub async fn run(&self, ctx: &ClientContext, cancel: &CancellationToken) -> FinishedInsertSegment {
        let cap = ctx.config.insert.max_concurrent_blocks.max(1);
        let timeout = ctx.config.insert.block_timeout();
        let network = ctx.network.as_ref();
        let mut in_flight = FuturesUnordered::new();

        loop {
            let launch = {
                let mut state = self.state.lock();
                if cancel.is_cancelled() && !state.tracker.is_killed() {
                    debug!("Insert segment cancelled");
                    state.tracker.kill();
                }
                let mut launch = Vec::new();
                while state.tracker.running_count() < cap {
                    match state.tracker.next_attempt() {
                        Some(block) => launch.push(block),
                        None => break,
                    }
                }
                state.attempts += launch.len();
                launch
            };

            for block in launch {
                let data = self.blocks[block].clone();
                let key = &self.keys[block];
                trace!(block, %key, "Starting block insert");
                in_flight.push(async move {
                    let outcome = insert_block(network, data, Some(key), timeout, cancel).await;
                    (block, outcome)
                });
            }

            // Every block terminal, or killed with nothing left running.
            let Some((block, outcome)) = in_flight.next().await else {
                break;
            };
            ctx.record_block("insert", outcome.label());
            self.record_outcome(block, outcome);
        }

        let finished = self.finish(cancel.is_cancelled());
        ctx.record_segment("insert", finished.is_success());
        ctx.publish(ClientEvent::segment_finished(
            RequestKind::Insert,
            self.index,
            finished.is_success(),
            finished.counts,
        ))
        .await;
        finished
    }

    fn record_outcome(&self, block: usize, outcome: InsertOutcome) {
        let mut state = self.state.lock();
        let result = match outcome {
            InsertOutcome::Success(key) if key == self.keys[block] => {
                state.tracker.report_success(block)
            }
            InsertOutcome::Success(key) => {
                warn!(block, expected = %self.keys[block], got = %key, "Network returned a different key");
                state.tracker.report_fatal(block, InsertFailureMode::InternalError)
            }
            InsertOutcome::NonFatal(mode) => {
                debug!(block, %mode, "Block insert failed");
                state.tracker.report_non_fatal(block, mode).map(|_| ())
            }
            InsertOutcome::Fatal(mode) => {
                debug!(block, %mode, "Block insert failed fatally");
                state.tracker.report_fatal(block, mode)
            }
        };
        if let Err(e) = result {
            warn!(block, error = %e, "Dropped block outcome");
        }
    }

    fn finish(&self, cancelled: bool) -> FinishedInsertSegment {
        let state = self.state.lock();
        let counts = state.tracker.counts();
        let codes = state.tracker.failure_codes();

        let outcome = if counts.succeeded == self.keys.len() {
            Ok(())
        } else {
            let mode = if cancelled {
                InsertFailureMode::Cancelled
            } else if counts.fatal > 0 {
                InsertFailureMode::FatalErrorsInBlocks
            } else {
                InsertFailureMode::TooManyRetriesInBlocks
            };
            warn!(segment = self.index, %counts, %mode, "Insert segment failed");
            Err(InsertFailure::new(mode)
                .with_message(format!("segment {}", self.index))
                .with_counts(counts)
                .with_codes(codes.clone()))
        };

        FinishedInsertSegment {
            index: self.index,
            counts,
            codes,
            attempts: state.attempts,
            outcome,
        }
    }
}

impl std::fmt::Debug for InsertSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsertSegment")
            .field("index", &self.index)
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}
