//! Reference-counted byte buffers
//!
//! A [`Buffer`] is a handle to an immutable byte sequence. Cloning a handle
//! acquires a reference, dropping it releases one, and the underlying
//! storage is freed when the last handle goes. The optional
//! [`BufferLedger`] counts every acquire, release, allocation and free so
//! tests can assert that each holder released exactly what it acquired.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

// =============================================================================
// Ledger
// =============================================================================

/// Acquire/release accounting shared by every buffer from one factory.
#[derive(Debug, Default)]
pub struct BufferLedger {
    allocated: AtomicU64,
    freed: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    bytes_live: AtomicU64,
}

impl BufferLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers created.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    /// Buffers whose last reference has been released.
    pub fn freed(&self) -> u64 {
        self.freed.load(Ordering::Acquire)
    }

    /// Buffers still alive.
    pub fn live(&self) -> u64 {
        self.allocated() - self.freed()
    }

    /// References handed out, including the initial one per buffer.
    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::Acquire)
    }

    /// References given back.
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Acquire)
    }

    /// References still outstanding.
    pub fn outstanding(&self) -> u64 {
        self.acquired() - self.released()
    }

    /// Bytes held by live buffers.
    pub fn bytes_live(&self) -> u64 {
        self.bytes_live.load(Ordering::Acquire)
    }
}

/// Storage shared by all handles to one buffer.
struct Lease {
    len: u64,
    ledger: Option<Arc<BufferLedger>>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(ledger) = &self.ledger {
            ledger.freed.fetch_add(1, Ordering::AcqRel);
            ledger.bytes_live.fetch_sub(self.len, Ordering::AcqRel);
        }
    }
}

// =============================================================================
// Buffer
// =============================================================================

/// One reference to an immutable byte sequence.
pub struct Buffer {
    data: Bytes,
    lease: Arc<Lease>,
}

impl Buffer {
    fn allocate(data: Bytes, ledger: Option<Arc<BufferLedger>>) -> Self {
        if let Some(ledger) = &ledger {
            ledger.allocated.fetch_add(1, Ordering::AcqRel);
            ledger.acquired.fetch_add(1, Ordering::AcqRel);
            ledger
                .bytes_live
                .fetch_add(data.len() as u64, Ordering::AcqRel);
        }
        let lease = Arc::new(Lease {
            len: data.len() as u64,
            ledger,
        });
        Self { data, lease }
    }

    /// Wrap bytes in an untracked buffer.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self::allocate(data.into(), None)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// A view of the contents. The view does not count as a reference.
    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    /// Number of live handles to this buffer.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.lease)
    }

    /// Handle to the first `len` bytes sharing the same storage.
    pub fn truncated(&self, len: usize) -> Buffer {
        let mut handle = self.clone();
        handle.data.truncate(len);
        handle
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        if let Some(ledger) = &self.lease.ledger {
            ledger.acquired.fetch_add(1, Ordering::AcqRel);
        }
        Self {
            data: self.data.clone(),
            lease: Arc::clone(&self.lease),
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(ledger) = &self.lease.ledger {
            ledger.released.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for Buffer {}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.data.len())
            .field("refs", &self.ref_count())
            .finish()
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Source of buffers; the buffer store collaborator.
pub trait BufferFactory: Send + Sync {
    /// Take ownership of `data` as a new buffer with one reference.
    fn make_buffer(&self, data: Bytes) -> Buffer;
}

/// Heap-backed buffer factory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBufferFactory {
    ledger: Option<Arc<BufferLedger>>,
}

impl InMemoryBufferFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose buffers report into `ledger`.
    pub fn with_ledger(ledger: Arc<BufferLedger>) -> Self {
        Self {
            ledger: Some(ledger),
        }
    }

    pub fn ledger(&self) -> Option<&Arc<BufferLedger>> {
        self.ledger.as_ref()
    }
}

impl BufferFactory for InMemoryBufferFactory {
    fn make_buffer(&self, data: Bytes) -> Buffer {
        Buffer::allocate(data, self.ledger.clone())
    }
}
