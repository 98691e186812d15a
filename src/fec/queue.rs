//! FEC worker pool
//!
//! Encode and decode are CPU bound, so they run on the blocking thread pool
//! under a semaphore. The permit count is small: every job holds a full
//! segment of blocks in memory.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Semaphore;
use tracing::{debug, instrument};

use super::codec::{CodecShape, ErasureCodec};
use crate::config::FecConfig;
use crate::error::{Error, Result};

/// Upper bound on concurrent codec jobs
pub const MAX_FEC_WORKERS: usize = 3;

/// Memory each concurrent codec job is assumed to need
pub const MEMORY_PER_WORKER: u64 = 128 * 1024 * 1024;

/// Below this budget only one job runs at a time
pub const LOW_MEMORY_THRESHOLD: u64 = 256 * 1024 * 1024;

/// Worker count for a machine with `cores` cores and `memory_budget` bytes.
pub fn default_worker_count(cores: usize, memory_budget: u64) -> usize {
    if memory_budget < LOW_MEMORY_THRESHOLD {
        return 1;
    }
    let by_memory = (memory_budget / MEMORY_PER_WORKER) as usize;
    MAX_FEC_WORKERS.min(cores).min(by_memory).max(1)
}

/// Data blocks and check blocks after a decode.
#[derive(Debug, Clone)]
pub struct DecodedBlocks {
    pub data: Vec<Bytes>,
    pub check: Vec<Option<Bytes>>,
}

/// Bounded pool running codec jobs off the async workers.
#[derive(Debug)]
pub struct FecQueue {
    codec: Arc<ErasureCodec>,
    permits: Arc<Semaphore>,
    workers: usize,
}

impl FecQueue {
    pub fn new(codec: Arc<ErasureCodec>, workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            codec,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    /// Pool sized from configuration, or from the host when unset.
    pub fn from_config(codec: Arc<ErasureCodec>, config: &FecConfig) -> Self {
        let workers = config.max_workers.unwrap_or_else(|| {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            default_worker_count(cores, config.memory_budget_bytes)
        });
        Self::new(codec, workers)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn codec(&self) -> &Arc<ErasureCodec> {
        &self.codec
    }

    /// Reconstruct missing data blocks on the pool.
    #[instrument(skip(self, data, check))]
    pub async fn decode(
        &self,
        shape: CodecShape,
        mut data: Vec<Option<Bytes>>,
        mut check: Vec<Option<Bytes>>,
        block_len: usize,
    ) -> Result<DecodedBlocks> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("FEC queue closed".to_string()))?;
        let codec = Arc::clone(&self.codec);

        let decoded = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            codec.decode(shape, &mut data, &mut check, block_len)?;
            let data = data
                .into_iter()
                .map(|b| {
                    b.ok_or_else(|| Error::FecDecodingFailed("data block missing".to_string()))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok::<_, Error>(DecodedBlocks { data, check })
        })
        .await
        .map_err(|e| Error::Internal(format!("FEC decode task failed: {}", e)))??;

        debug!("Decode job finished");
        Ok(decoded)
    }

    /// Generate check blocks on the pool.
    #[instrument(skip(self, data))]
    pub async fn encode(
        &self,
        shape: CodecShape,
        data: Vec<Bytes>,
        block_len: usize,
    ) -> Result<Vec<Bytes>> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("FEC queue closed".to_string()))?;
        let codec = Arc::clone(&self.codec);

        let check = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            codec.encode(shape, &data, block_len)
        })
        .await
        .map_err(|e| Error::Internal(format!("FEC encode task failed: {}", e)))??;

        debug!(check_blocks = check.len(), "Encode job finished");
        Ok(check)
    }
}
