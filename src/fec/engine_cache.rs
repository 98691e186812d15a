//! Shape-keyed Reed-Solomon engine cache
//!
//! Building an engine inverts and multiplies GF(2^8) matrices, so engines
//! are kept in a small least-recently-used cache keyed by (k, m). The cache
//! is an ordinary value injected into the codec rather than process-wide
//! state.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use reed_solomon_erasure::galois_8::ReedSolomon;
use tracing::debug;

use crate::error::{Error, Result};

/// Default number of cached engines
pub const DEFAULT_ENGINE_CACHE_SIZE: usize = 16;

/// Bounded LRU cache of Reed-Solomon engines.
pub struct EngineCache {
    engines: Mutex<LruCache<(usize, usize), Arc<ReedSolomon>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EngineCache {
    /// Cache holding at most `capacity` engines (minimum one).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            engines: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Engine for shape (k, m), built on a miss.
    pub fn engine(&self, data_blocks: usize, check_blocks: usize) -> Result<Arc<ReedSolomon>> {
        let shape = (data_blocks, check_blocks);
        if let Some(engine) = self.engines.lock().get(&shape) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(engine));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        // Built outside the lock; a racing builder for the same shape just
        // replaces an identical engine.
        let engine = Arc::new(ReedSolomon::new(data_blocks, check_blocks).map_err(|e| {
            Error::InvalidFecConfig(format!("Failed to create Reed-Solomon codec: {}", e))
        })?);
        debug!(data_blocks, check_blocks, "Built Reed-Solomon engine");

        self.engines.lock().put(shape, Arc::clone(&engine));
        Ok(engine)
    }

    pub fn len(&self) -> usize {
        self.engines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.engines.lock().cap().get()
    }

    pub fn contains(&self, data_blocks: usize, check_blocks: usize) -> bool {
        self.engines.lock().contains(&(data_blocks, check_blocks))
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl Default for EngineCache {
    fn default() -> Self {
        Self::new(DEFAULT_ENGINE_CACHE_SIZE)
    }
}

impl fmt::Debug for EngineCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineCache")
            .field("len", &self.len())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish()
    }
}
