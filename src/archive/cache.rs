//! Archive bucket cache
//!
//! Holds members already extracted from fetched containers, keyed by
//! (container key, member name), under a byte budget and an entry budget.
//!
//! Each entry owns one keep-alive reference to its buffer. Callers get an
//! [`ArchiveReader`] holding its own reference, never the cache's. Eviction
//! only drops the keep-alive reference, so a reader that was handed out
//! before an eviction keeps its data until the reader itself is dropped.
//!
//! The lock guards only the LRU structure: promote, insert, evict. Reading
//! data through a reader never touches it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::buffer::Buffer;
use crate::config::ArchiveCacheConfig;
use crate::keys::ContentKey;
use crate::metrics::ClientMetrics;

/// Name of the member holding an archive's own metadata document
pub const METADATA_MEMBER: &str = ".metadata";

/// Identifies one member of one container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchiveKey {
    pub container: ContentKey,
    pub name: String,
}

impl ArchiveKey {
    pub fn new(container: ContentKey, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            container,
            name: name.trim_start_matches('/').to_string(),
        }
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.container, self.name)
    }
}

/// Shared read-only view of a cached member.
///
/// Holds its own reference; the data stays valid until this reader is
/// dropped, whatever the cache does meanwhile.
#[derive(Debug, Clone)]
pub struct ArchiveReader {
    buffer: Buffer,
}

impl ArchiveReader {
    /// Length of the member in bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True for an empty member.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// The member's bytes.
    pub fn as_slice(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    /// The member's bytes as a shared `Bytes`.
    pub fn bytes(&self) -> &Bytes {
        self.buffer.bytes()
    }

    /// Give up the reader in exchange for a buffer reference.
    pub fn into_buffer(self) -> Buffer {
        self.buffer
    }
}

/// Snapshot of cache occupancy and counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveCacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct CacheInner {
    entries: LruCache<ArchiveKey, Buffer>,
    total_bytes: u64,
}

/// Bounded, reference-counted LRU of extracted archive members.
pub struct ArchiveBucketCache {
    inner: Mutex<CacheInner>,
    max_bytes: u64,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    metrics: Option<Arc<ClientMetrics>>,
}

impl ArchiveBucketCache {
    pub fn new(config: &ArchiveCacheConfig) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                total_bytes: 0,
            }),
            max_bytes: config.max_bytes,
            max_entries: config.max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            metrics: None,
        }
    }

    /// Count hits, misses and evictions in `metrics` too.
    pub fn with_metrics(mut self, metrics: Arc<ClientMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Reader for `key`, promoting it to most recently used.
    pub fn acquire(&self, key: &ArchiveKey) -> Option<ArchiveReader> {
        let reader = {
            let mut inner = self.inner.lock();
            inner.entries.get(key).map(|buffer| ArchiveReader {
                buffer: buffer.clone(),
            })
        };

        match &reader {
            Some(_) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.record("hit");
                trace!(%key, "Archive cache hit");
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.record("miss");
            }
        }
        reader
    }

    /// Store `buffer` as the newest entry and return a reader for it.
    ///
    /// The cache takes ownership of `buffer`. Eviction runs before return,
    /// so the returned reader may outlive the entry if the budgets are
    /// smaller than the buffer.
    pub fn add_and_acquire(&self, key: ArchiveKey, buffer: Buffer) -> ArchiveReader {
        let size = buffer.len() as u64;
        let reader = ArchiveReader {
            buffer: buffer.clone(),
        };

        let mut released = Vec::new();
        {
            let mut inner = self.inner.lock();
            if let Some((_, old)) = inner.entries.push(key, buffer) {
                inner.total_bytes -= old.len() as u64;
                released.push(old);
            }
            inner.total_bytes += size;

            while inner.total_bytes > self.max_bytes || inner.entries.len() > self.max_entries {
                let Some((evicted_key, evicted)) = inner.entries.pop_lru() else {
                    break;
                };
                inner.total_bytes -= evicted.len() as u64;
                debug!(key = %evicted_key, size = evicted.len(), "Evicted archive member");
                released.push(evicted);
            }
        }

        if !released.is_empty() {
            self.evictions
                .fetch_add(released.len() as u64, Ordering::Relaxed);
            for _ in &released {
                self.record("eviction");
            }
        }
        // Keep-alive references are dropped here, outside the lock.
        drop(released);
        reader
    }

    /// Forget every member of `container`.
    pub fn invalidate_container(&self, container: &ContentKey) -> usize {
        let mut inner = self.inner.lock();
        let stale: Vec<ArchiveKey> = inner
            .entries
            .iter()
            .filter(|(k, _)| &k.container == container)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            if let Some(buffer) = inner.entries.pop(key) {
                inner.total_bytes -= buffer.len() as u64;
            }
        }
        stale.len()
    }

    /// True if `key` is cached. Does not touch recency.
    pub fn contains(&self, key: &ArchiveKey) -> bool {
        self.inner.lock().entries.contains(key)
    }

    /// Number of cached members.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Bytes held across all cached members.
    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().total_bytes
    }

    /// Current occupancy and lifetime counters.
    pub fn stats(&self) -> ArchiveCacheStats {
        let inner = self.inner.lock();
        ArchiveCacheStats {
            entries: inner.entries.len(),
            total_bytes: inner.total_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn record(&self, event: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_cache(event);
        }
    }
}

impl fmt::Debug for ArchiveBucketCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveBucketCache")
            .field("max_bytes", &self.max_bytes)
            .field("max_entries", &self.max_entries)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferFactory, BufferLedger, InMemoryBufferFactory};

    fn cache(max_bytes: u64, max_entries: usize) -> ArchiveBucketCache {
        ArchiveBucketCache::new(&ArchiveCacheConfig {
            max_bytes,
            max_entries,
        })
    }

    fn key(name: &str) -> ArchiveKey {
        ArchiveKey::new(ContentKey::chk_for(b"container"), name)
    }

    #[test]
    fn test_acquire_miss_then_hit() {
        let cache = cache(1000, 10);
        assert!(cache.acquire(&key("a")).is_none());

        let reader = cache.add_and_acquire(key("a"), Buffer::from_bytes(vec![1u8; 10]));
        assert_eq!(reader.len(), 10);
        assert_eq!(cache.acquire(&key("a")).unwrap().as_slice(), &[1u8; 10]);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_bytes, 10);
    }

    #[test]
    fn test_byte_budget_evicts_lru() {
        let cache = cache(1000, 100);
        cache.add_and_acquire(key("A"), Buffer::from_bytes(vec![0u8; 400]));
        cache.add_and_acquire(key("B"), Buffer::from_bytes(vec![0u8; 400]));
        cache.add_and_acquire(key("C"), Buffer::from_bytes(vec![0u8; 400]));

        assert!(cache.acquire(&key("A")).is_none());
        assert!(cache.acquire(&key("B")).is_some());
        assert!(cache.acquire(&key("C")).is_some());
        assert_eq!(cache.total_bytes(), 800);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_promotion_changes_victim() {
        let cache = cache(1000, 100);
        cache.add_and_acquire(key("A"), Buffer::from_bytes(vec![0u8; 400]));
        cache.add_and_acquire(key("B"), Buffer::from_bytes(vec![0u8; 400]));
        assert!(cache.acquire(&key("A")).is_some());
        cache.add_and_acquire(key("C"), Buffer::from_bytes(vec![0u8; 400]));

        assert!(cache.contains(&key("A")));
        assert!(!cache.contains(&key("B")));
        assert!(cache.contains(&key("C")));
    }

    #[test]
    fn test_count_budget() {
        let cache = cache(u64::MAX, 2);
        for name in ["a", "b", "c", "d"] {
            cache.add_and_acquire(key(name), Buffer::from_bytes(vec![0u8; 1]));
            assert!(cache.len() <= 2);
        }
        assert!(cache.contains(&key("c")));
        assert!(cache.contains(&key("d")));
    }

    #[test]
    fn test_reader_survives_eviction() {
        let ledger = Arc::new(BufferLedger::new());
        let factory = InMemoryBufferFactory::with_ledger(ledger.clone());
        let cache = cache(100, 10);

        let reader = cache.add_and_acquire(key("big"), factory.make_buffer(Bytes::from(vec![7u8; 80])));
        let second = cache.acquire(&key("big")).unwrap();
        cache.add_and_acquire(key("other"), factory.make_buffer(Bytes::from(vec![1u8; 80])));

        assert!(!cache.contains(&key("big")));
        assert_eq!(reader.as_slice(), &[7u8; 80][..]);
        assert_eq!(ledger.freed(), 0);

        drop(reader);
        assert_eq!(ledger.freed(), 0);
        assert_eq!(second.as_slice()[0], 7);
        drop(second);
        assert_eq!(ledger.freed(), 1);
    }

    #[test]
    fn test_oversized_entry_returns_reader() {
        let cache = cache(10, 10);
        let reader = cache.add_and_acquire(key("huge"), Buffer::from_bytes(vec![3u8; 50]));
        assert_eq!(reader.len(), 50);
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn test_replace_same_key() {
        let cache = cache(1000, 10);
        cache.add_and_acquire(key("a"), Buffer::from_bytes(vec![0u8; 100]));
        cache.add_and_acquire(key("a"), Buffer::from_bytes(vec![0u8; 30]));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 30);
    }

    #[test]
    fn test_leading_slash_stripped() {
        assert_eq!(key("/index.html"), key("index.html"));
    }

    #[test]
    fn test_invalidate_container() {
        let cache = cache(1000, 10);
        cache.add_and_acquire(key("a"), Buffer::from_bytes(vec![0u8; 5]));
        cache.add_and_acquire(key("b"), Buffer::from_bytes(vec![0u8; 5]));
        let other = ArchiveKey::new(ContentKey::chk_for(b"other"), "a");
        cache.add_and_acquire(other.clone(), Buffer::from_bytes(vec![0u8; 5]));

        assert_eq!(cache.invalidate_container(&ContentKey::chk_for(b"container")), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&other));
        assert_eq!(cache.total_bytes(), 5);
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let cache = Arc::new(cache(4096, 16));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let k = key(&format!("m{}", (t * 7 + i) % 40));
                        match cache.acquire(&k) {
                            Some(reader) => assert!(reader.len() <= 512),
                            None => {
                                let len = 64 + (i % 8) * 56;
                                cache.add_and_acquire(k, Buffer::from_bytes(vec![t as u8; len]));
                            }
                        }
                        let stats = cache.stats();
                        assert!(stats.total_bytes <= 4096);
                        assert!(stats.entries <= 16);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
