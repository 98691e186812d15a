//! Client getter
//!
//! Resolves a URI to content by walking metadata documents. The walk is a
//! plain loop over two states, a key to fetch a document from and a
//! document to interpret. Every step charges one hop, so redirect chains
//! and nested multi-level documents are bounded by `max_recursion`.
//!
//! ```text
//! Key ──fetch──▶ Document ──redirect──▶ Key
//!                   │ ├──manifest / archive / multi-level──▶ Document
//!                   │ └──single file / splitfile / archive member──▶ data
//! ```
//!
//! Archive members are served from the [`ArchiveBucketCache`]. A miss
//! fetches and unpacks the whole container and caches every member.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::block::{fetch_block, FetchOutcome};
use super::context::ClientContext;
use super::failure::FailureCodeTracker;
use super::fetcher::SplitfileFetcher;
use super::metadata::Metadata;
use crate::archive::{ArchiveBucketCache, ArchiveKey, METADATA_MEMBER};
use crate::buffer::Buffer;
use crate::domain::events::ClientEvent;
use crate::domain::ports::{ArchiveExtractor, ArchiveType};
use crate::error::{Error, FetchFailure, FetchFailureMode, Result};
use crate::keys::{ClientUri, ContentKey};

enum Step {
    Key(ContentKey),
    Document(Metadata),
}

#[derive(Debug, Clone)]
struct OpenArchive {
    container: ContentKey,
    archive_type: ArchiveType,
}

/// Per-fetch walk state.
struct Walk {
    path: VecDeque<String>,
    archive: Option<OpenArchive>,
    hops: u32,
    restarts: u32,
    /// Digest of each container the last time it was unpacked
    extracted: HashMap<ContentKey, [u8; 32]>,
}

impl Walk {
    fn new(uri: &ClientUri) -> Self {
        Self {
            path: uri.path.iter().cloned().collect(),
            archive: None,
            hops: 0,
            restarts: 0,
            extracted: HashMap::new(),
        }
    }

    /// Every re-extraction of a container counts as one restart.
    fn charge_restart(&mut self, limit: u32) -> Result<()> {
        self.restarts += 1;
        if self.restarts > limit {
            return Err(Error::fetch(
                FetchFailureMode::TooManyArchiveRestarts,
                format!("archive extracted again {} times", self.restarts),
            ));
        }
        Ok(())
    }

    fn charge_hop(&mut self, limit: u32) -> Result<()> {
        self.hops += 1;
        if self.hops > limit {
            return Err(Error::fetch(
                FetchFailureMode::TooMuchRecursion,
                format!("more than {} metadata hops", limit),
            ));
        }
        Ok(())
    }
}

/// Fetches content by URI.
pub struct ClientGetter {
    ctx: ClientContext,
    cache: Arc<ArchiveBucketCache>,
    extractor: Arc<dyn ArchiveExtractor>,
    fetcher: SplitfileFetcher,
}

impl ClientGetter {
    pub fn new(
        ctx: ClientContext,
        cache: Arc<ArchiveBucketCache>,
        extractor: Arc<dyn ArchiveExtractor>,
    ) -> Self {
        let fetcher = SplitfileFetcher::new(ctx.clone());
        Self {
            ctx,
            cache,
            extractor,
            fetcher,
        }
    }

    pub fn cache(&self) -> &Arc<ArchiveBucketCache> {
        &self.cache
    }

    /// Fetch the content `uri` names.
    #[instrument(skip(self, uri, cancel), fields(uri = %uri))]
    pub async fn fetch(&self, uri: &ClientUri, cancel: &CancellationToken) -> Result<Buffer> {
        let result = self.walk(uri, cancel).await;
        match &result {
            Ok(buffer) => {
                info!(bytes = buffer.len(), "Fetch completed");
                self.ctx
                    .publish(ClientEvent::fetch_completed(uri.to_string(), buffer.len() as u64))
                    .await;
            }
            Err(e) => {
                warn!(error = %e, "Fetch failed");
                self.ctx
                    .publish(ClientEvent::fetch_failed(uri.to_string(), e.to_string(), e.is_fatal()))
                    .await;
            }
        }
        result
    }

    async fn walk(&self, uri: &ClientUri, cancel: &CancellationToken) -> Result<Buffer> {
        let limit = self.ctx.config.fetch.max_recursion;
        let mut walk = Walk::new(uri);
        let mut step = Step::Key(uri.key.clone());

        loop {
            if cancel.is_cancelled() {
                return Err(Error::fetch(FetchFailureMode::Cancelled, "fetch cancelled"));
            }
            walk.charge_hop(limit)?;

            step = match step {
                Step::Key(key) => {
                    let block = self.fetch_single(&key, cancel).await?;
                    Step::Document(Metadata::from_bytes(block.as_slice())?)
                }
                Step::Document(document) => {
                    debug!(kind = document.kind_name(), hops = walk.hops, "Interpreting metadata");
                    match self.interpret(document, &mut walk, cancel).await {
                        Ok(Resolved::Next(next)) => next,
                        Ok(Resolved::Data(buffer)) => {
                            return self.finish_data(buffer, &walk);
                        }
                        Err(Restart::Failed(e)) => return Err(e),
                        Err(Restart::ArchiveChanged) => {
                            info!(restarts = walk.restarts, "Archive changed, restarting fetch");
                            walk.path = uri.path.iter().cloned().collect();
                            walk.archive = None;
                            Step::Key(uri.key.clone())
                        }
                    }
                }
            };
        }
    }

    fn finish_data(&self, buffer: Buffer, walk: &Walk) -> Result<Buffer> {
        if !walk.path.is_empty() {
            return Err(Error::fetch(
                FetchFailureMode::TooManyPathComponents,
                format!("{} unused path components", walk.path.len()),
            ));
        }
        if buffer.len() as u64 > self.ctx.config.fetch.max_output_length {
            return Err(Error::fetch(
                FetchFailureMode::TooBig,
                format!("{} bytes", buffer.len()),
            ));
        }
        Ok(buffer)
    }

    async fn interpret(
        &self,
        document: Metadata,
        walk: &mut Walk,
        cancel: &CancellationToken,
    ) -> std::result::Result<Resolved, Restart> {
        let resolved = match document {
            Metadata::SimpleRedirect { target } => Resolved::Next(Step::Key(target)),
            Metadata::SingleFileRedirect { target } => {
                Resolved::Data(self.fetch_single(&target, cancel).await?)
            }
            Metadata::Splitfile(splitfile) => {
                Resolved::Data(self.fetcher.fetch(&splitfile, cancel).await?)
            }
            Metadata::MultiLevel(splitfile) => {
                let inner = self.fetcher.fetch(&splitfile, cancel).await?;
                Resolved::Next(Step::Document(Metadata::from_bytes(inner.as_slice())?))
            }
            Metadata::SimpleManifest {
                mut documents,
                default,
            } => {
                let next = match walk.path.pop_front() {
                    Some(name) => documents.remove(&name).ok_or_else(|| {
                        Error::fetch(FetchFailureMode::NotInArchive, format!("no document {}", name))
                    })?,
                    None => *default.ok_or_else(|| {
                        Error::fetch(
                            FetchFailureMode::NotEnoughPathComponents,
                            "manifest has no default document",
                        )
                    })?,
                };
                Resolved::Next(Step::Document(next))
            }
            Metadata::ArchiveManifest {
                archive_type,
                container,
            } => {
                walk.archive = Some(OpenArchive {
                    container,
                    archive_type,
                });
                let member = self.archive_member(walk, METADATA_MEMBER, cancel).await?;
                Resolved::Next(Step::Document(Metadata::from_bytes(member.as_slice())?))
            }
            Metadata::ArchiveInternalRedirect { name } => {
                Resolved::Data(self.archive_member(walk, &name, cancel).await?)
            }
            Metadata::ArchiveMetadataRedirect { name } => {
                let member = self.archive_member(walk, &name, cancel).await?;
                Resolved::Next(Step::Document(Metadata::from_bytes(member.as_slice())?))
            }
        };
        Ok(resolved)
    }

    // =========================================================================
    // Archives
    // =========================================================================

    /// Read `name` from the open archive, unpacking the container on a miss.
    async fn archive_member(
        &self,
        walk: &mut Walk,
        name: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<Buffer, Restart> {
        let archive = walk.archive.clone().ok_or_else(|| {
            Error::fetch(
                FetchFailureMode::InvalidMetadata,
                "archive redirect outside an archive",
            )
        })?;
        let key = ArchiveKey::new(archive.container.clone(), name);
        if let Some(reader) = self.cache.acquire(&key) {
            return Ok(reader.into_buffer());
        }

        debug!(container = %archive.container, member = %key.name, "Archive cache miss");
        let container = self.fetch_container(&archive.container, walk, cancel).await?;
        let digest: [u8; 32] = Sha256::digest(container.as_slice()).into();
        if let Some(previous) = walk.extracted.insert(archive.container.clone(), digest) {
            walk.charge_restart(self.ctx.config.fetch.max_archive_restarts)?;
            if previous != digest {
                self.cache.invalidate_container(&archive.container);
                return Err(Restart::ArchiveChanged);
            }
        }

        let members = self
            .extractor
            .extract(container.bytes(), archive.archive_type)?;
        let mut wanted = None;
        for (member, data) in members {
            let member_key = ArchiveKey::new(archive.container.clone(), member);
            let is_wanted = member_key.name == key.name;
            let reader = self
                .cache
                .add_and_acquire(member_key, self.ctx.buffers.make_buffer(data));
            if is_wanted {
                wanted = Some(reader);
            }
        }

        wanted.map(|reader| reader.into_buffer()).ok_or_else(|| {
            Restart::Failed(Error::fetch(
                FetchFailureMode::NotInArchive,
                format!("{} is not in {}", key.name, archive.container),
            ))
        })
    }

    /// Resolve a container key to the container's bytes.
    ///
    /// Containers are stored like any other content, so this follows the
    /// redirects and splitfiles that lead to data on the same hop budget.
    async fn fetch_container(
        &self,
        container: &ContentKey,
        walk: &mut Walk,
        cancel: &CancellationToken,
    ) -> Result<Buffer> {
        let limit = self.ctx.config.fetch.max_recursion;
        let block = self.fetch_single(container, cancel).await?;
        let mut document = Metadata::from_bytes(block.as_slice())?;
        loop {
            walk.charge_hop(limit)?;
            document = match document {
                Metadata::SimpleRedirect { target } => {
                    let block = self.fetch_single(&target, cancel).await?;
                    Metadata::from_bytes(block.as_slice())?
                }
                Metadata::SingleFileRedirect { target } => {
                    return self.fetch_single(&target, cancel).await
                }
                Metadata::Splitfile(splitfile) => {
                    return self.fetcher.fetch(&splitfile, cancel).await
                }
                Metadata::MultiLevel(splitfile) => {
                    let inner = self.fetcher.fetch(&splitfile, cancel).await?;
                    Metadata::from_bytes(inner.as_slice())?
                }
                other => {
                    return Err(Error::fetch(
                        FetchFailureMode::InvalidMetadata,
                        format!("container resolves to {}", other.kind_name()),
                    ))
                }
            };
        }
    }

    // =========================================================================
    // Single Blocks
    // =========================================================================

    /// Fetch one block, retrying nonfatal failures.
    async fn fetch_single(&self, key: &ContentKey, cancel: &CancellationToken) -> Result<Buffer> {
        let fetch = &self.ctx.config.fetch;
        let mut codes = FailureCodeTracker::new();

        for _ in 0..=fetch.max_block_retries {
            let outcome = fetch_block(
                self.ctx.network.as_ref(),
                self.ctx.buffers.as_ref(),
                key,
                fetch.block_timeout(),
                cancel,
            )
            .await;
            self.ctx.record_block("fetch", outcome.label());
            match outcome {
                FetchOutcome::Success(buffer) => return Ok(buffer),
                FetchOutcome::NonFatal(mode) => codes.inc(mode),
                FetchOutcome::Fatal(mode) => {
                    codes.inc(mode);
                    return Err(FetchFailure::new(mode)
                        .with_message(key.to_string())
                        .with_codes(codes)
                        .into());
                }
            }
        }

        let mode = codes.dominant().unwrap_or(FetchFailureMode::DataNotFound);
        Err(FetchFailure::new(mode)
            .with_message(format!("{} ran out of retries", key))
            .with_codes(codes)
            .into())
    }
}

impl std::fmt::Debug for ClientGetter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientGetter")
            .field("ctx", &self.ctx)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

enum Resolved {
    Next(Step),
    Data(Buffer),
}

enum Restart {
    ArchiveChanged,
    Failed(Error),
}

impl From<Error> for Restart {
    fn from(error: Error) -> Self {
        Restart::Failed(error)
    }
}
