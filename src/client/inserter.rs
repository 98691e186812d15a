//! Splitfile inserter
//!
//! Splits content into padded blocks, groups them into segments, encodes
//! and inserts every segment, then inserts a metadata document describing
//! the result. The returned root key is what a fetcher starts from.
//!
//! The last segment is the smallest, so it is encoded first and its keys
//! are known earliest. Segments are inserted while later ones are still
//! being encoded.

use bytes::{Bytes, BytesMut};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::block::{insert_block, InsertOutcome};
use super::context::ClientContext;
use super::failure::FailureCodeTracker;
use super::insert_segment::{FinishedInsertSegment, InsertSegment};
use super::metadata::{Metadata, SplitfileMetadata};
use crate::domain::events::{ClientEvent, RequestKind};
use crate::error::{BlockCounts, Error, InsertFailure, InsertFailureMode, Result};
use crate::fec::{CodecKind, SegmentLayout, SegmentLimits};
use crate::keys::ContentKey;

/// Metadata documents nest at most this deep before insertion gives up
pub const MAX_METADATA_LEVELS: usize = 4;

/// Root key and description of a finished insert.
#[derive(Debug, Clone)]
pub struct InsertResult {
    pub root: ContentKey,
    pub metadata: SplitfileMetadata,
    pub segments: usize,
}

/// Inserts one piece of content as a splitfile.
#[derive(Debug, Clone)]
pub struct SplitfileInserter {
    ctx: ClientContext,
}

impl SplitfileInserter {
    pub fn new(ctx: ClientContext) -> Self {
        Self { ctx }
    }

    /// Insert `content` and its root metadata document.
    #[instrument(skip(self, content, cancel), fields(len = content.len()))]
    pub async fn insert(&self, content: Bytes, cancel: &CancellationToken) -> Result<InsertResult> {
        let insert = &self.ctx.config.insert;
        let limits = SegmentLimits {
            codec: insert.codec,
            data_blocks: insert.segment_data_blocks,
            check_blocks: insert.segment_check_blocks,
        };

        let result = async {
            let metadata = insert_splitfile(&self.ctx, &content, limits, cancel).await?;
            let segments = metadata.layout()?.len();
            let root = insert_metadata(&self.ctx, &Metadata::Splitfile(metadata.clone()), cancel)
                .await?;
            Ok::<_, Error>(InsertResult {
                root,
                metadata,
                segments,
            })
        }
        .await;

        match &result {
            Ok(done) => {
                info!(root = %done.root, segments = done.segments, "Insert completed");
                self.ctx
                    .publish(ClientEvent::insert_completed(
                        done.root.to_string(),
                        content.len() as u64,
                        done.segments,
                    ))
                    .await;
            }
            Err(e) => {
                warn!(error = %e, "Insert failed");
                self.ctx
                    .publish(ClientEvent::insert_failed(e.to_string(), e.is_fatal()))
                    .await;
            }
        }
        result
    }
}

/// Insert a metadata document and return the key it can be fetched from.
///
/// A document larger than one block is itself inserted as a non-redundant
/// splitfile and referenced from a smaller multi-level document.
pub async fn insert_metadata(
    ctx: &ClientContext,
    metadata: &Metadata,
    cancel: &CancellationToken,
) -> Result<ContentKey> {
    let block_size = ctx.config.insert.block_size;
    let mut document = metadata.to_bytes()?;

    for level in 0..MAX_METADATA_LEVELS {
        if document.len() <= block_size {
            debug!(level, len = document.len(), "Inserting root metadata");
            return insert_single_block(ctx, document, cancel).await;
        }
        let limits = SegmentLimits {
            codec: CodecKind::NonRedundant,
            data_blocks: document.len().div_ceil(block_size),
            check_blocks: 0,
        };
        let inner = insert_splitfile(ctx, &document, limits, cancel).await?;
        document = Metadata::MultiLevel(inner).to_bytes()?;
    }

    Err(Error::insert(
        InsertFailureMode::TooBig,
        format!(
            "metadata does not fit a {} byte block after {} levels",
            block_size, MAX_METADATA_LEVELS
        ),
    ))
}

/// Insert one block under its content hash, retrying nonfatal failures.
async fn insert_single_block(
    ctx: &ClientContext,
    block: Bytes,
    cancel: &CancellationToken,
) -> Result<ContentKey> {
    let insert = &ctx.config.insert;
    let key = ContentKey::chk_for(&block);
    let mut codes = FailureCodeTracker::new();

    for _ in 0..=insert.max_block_retries {
        let outcome =
            insert_block(ctx.network.as_ref(), block.clone(), Some(&key), insert.block_timeout(), cancel)
                .await;
        ctx.record_block("insert", outcome.label());
        match outcome {
            InsertOutcome::Success(_) => return Ok(key),
            InsertOutcome::NonFatal(mode) => codes.inc(mode),
            InsertOutcome::Fatal(mode) => {
                codes.inc(mode);
                return Err(InsertFailure::new(mode)
                    .with_message("root block")
                    .with_codes(codes)
                    .into());
            }
        }
    }

    let mode = codes.dominant().unwrap_or(InsertFailureMode::RouteNotFound);
    Err(InsertFailure::new(mode)
        .with_message("root block ran out of retries")
        .with_codes(codes)
        .into())
}

/// Split `content` into padded blocks of the configured size.
pub fn split_blocks(content: &[u8], block_size: usize) -> Vec<Bytes> {
    if content.is_empty() {
        return vec![Bytes::from(vec![0u8; block_size])];
    }
    content
        .chunks(block_size)
        .map(|chunk| {
            let mut block = BytesMut::with_capacity(block_size);
            block.extend_from_slice(chunk);
            block.resize(block_size, 0);
            block.freeze()
        })
        .collect()
}

/// Encode and insert every segment of `content`.
async fn insert_splitfile(
    ctx: &ClientContext,
    content: &[u8],
    limits: SegmentLimits,
    cancel: &CancellationToken,
) -> Result<SplitfileMetadata> {
    let block_size = ctx.config.insert.block_size;
    let blocks = split_blocks(content, block_size);
    let layout = SegmentLayout::compute(blocks.len(), limits)?;
    let total = layout.len();
    let insert_cancel = cancel.child_token();

    let (tx, mut rx) = mpsc::channel::<InsertSegment>(2);

    // Last segment first, then the rest in order.
    let mut order: Vec<usize> = (0..total).collect();
    order.rotate_right(1);

    let producer = async {
        for index in order {
            if insert_cancel.is_cancelled() {
                break;
            }
            let span = &layout.segments()[index];
            let data = blocks[span.data.clone()].to_vec();
            let segment = match InsertSegment::encode(ctx, index, span.shape, block_size, data).await {
                Ok(segment) => segment,
                Err(e) => {
                    insert_cancel.cancel();
                    return Err(e);
                }
            };
            if tx.send(segment).await.is_err() {
                break;
            }
        }
        drop(tx);
        Ok::<(), Error>(())
    };

    let consumer = async {
        let mut running = FuturesUnordered::new();
        let mut finished: Vec<(InsertSegment, FinishedInsertSegment)> = Vec::with_capacity(total);
        let mut open = true;
        while open || !running.is_empty() {
            tokio::select! {
                received = rx.recv(), if open => match received {
                    Some(segment) => running.push(async {
                        let result = segment.run(ctx, &insert_cancel).await;
                        (segment, result)
                    }),
                    None => open = false,
                },
                Some(done) = running.next(), if !running.is_empty() => {
                    finished.push(done);
                    ctx.publish(ClientEvent::splitfile_progress(
                        RequestKind::Insert,
                        finished.len(),
                        total,
                    ))
                    .await;
                }
            }
        }
        finished
    };

    let (produced, mut finished) = tokio::join!(producer, consumer);
    produced?;
    if finished.len() != total {
        return Err(Error::insert(
            InsertFailureMode::Cancelled,
            format!("{} of {} segments were started", finished.len(), total),
        ));
    }
    finished.sort_by_key(|(segment, _)| segment.index());

    let mut counts = BlockCounts::default();
    let mut codes = FailureCodeTracker::new();
    let mut failed = 0;
    for (_, result) in &finished {
        counts.merge(&result.counts);
        codes.merge(&result.codes);
        if !result.is_success() {
            failed += 1;
        }
    }

    if failed > 0 {
        let mode = if cancel.is_cancelled() {
            InsertFailureMode::Cancelled
        } else if counts.fatal > 0 {
            InsertFailureMode::FatalErrorsInBlocks
        } else {
            InsertFailureMode::TooManyRetriesInBlocks
        };
        return Err(InsertFailure::new(mode)
            .with_message(format!("{} of {} segments failed", failed, total))
            .with_counts(counts)
            .with_codes(codes)
            .into());
    }

    let mut data_keys = Vec::with_capacity(layout.total_data_blocks());
    let mut check_keys = Vec::with_capacity(layout.total_check_blocks());
    for (segment, _) in &finished {
        data_keys.extend_from_slice(segment.data_keys());
        check_keys.extend_from_slice(segment.check_keys());
    }

    Ok(SplitfileMetadata {
        codec: limits.codec,
        segment_data_blocks: limits.data_blocks,
        segment_check_blocks: limits.check_blocks,
        block_size,
        original_length: content.len() as u64,
        data_keys,
        check_keys,
    })
}
