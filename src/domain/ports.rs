//! Domain Ports (Port/Adapter Pattern)
//!
//! The collaborators the splitfile engine consumes but does not implement:
//! the block network, the container extractor, the job queue and the event
//! sink. Infrastructure adapters implement these traits.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Client Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │ BlockNetwork │ ArchiveExtractor │ JobQueue │ Events │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │ InMemoryNetwork │ BundleExtractor │ TokioJobQueue    │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::events::ClientEvent;
use crate::error::{FetchFailureMode, InsertFailureMode, Result};
use crate::keys::ContentKey;

// =============================================================================
// Block Network
// =============================================================================

/// Why the network could not return a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum NetworkFetchError {
    #[error("data not found")]
    DataNotFound,
    #[error("route not found")]
    RouteNotFound,
    #[error("rejected overload")]
    RejectedOverload,
    #[error("transfer failed")]
    TransferFailed,
    #[error("internal error")]
    InternalError,
}

impl NetworkFetchError {
    pub fn mode(self) -> FetchFailureMode {
        match self {
            NetworkFetchError::DataNotFound => FetchFailureMode::DataNotFound,
            NetworkFetchError::RouteNotFound => FetchFailureMode::RouteNotFound,
            NetworkFetchError::RejectedOverload => FetchFailureMode::RejectedOverload,
            NetworkFetchError::TransferFailed => FetchFailureMode::TransferFailed,
            NetworkFetchError::InternalError => FetchFailureMode::InternalError,
        }
    }
}

/// Why the network could not store a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum NetworkPutError {
    #[error("route not found")]
    RouteNotFound,
    #[error("rejected overload")]
    RejectedOverload,
    #[error("collision")]
    Collision,
    #[error("internal error")]
    InternalError,
}

impl NetworkPutError {
    pub fn mode(self) -> InsertFailureMode {
        match self {
            NetworkPutError::RouteNotFound => InsertFailureMode::RouteNotFound,
            NetworkPutError::RejectedOverload => InsertFailureMode::RejectedOverload,
            NetworkPutError::Collision => InsertFailureMode::Collision,
            NetworkPutError::InternalError => InsertFailureMode::InternalError,
        }
    }
}

/// Fetch-by-key and put-by-key against the peer network.
///
/// Neither call retries on its own; the caller owns the retry policy.
#[async_trait]
pub trait BlockNetwork: Send + Sync {
    /// Fetch the block named by `key`.
    async fn fetch(&self, key: &ContentKey) -> std::result::Result<Bytes, NetworkFetchError>;

    /// Store `block`. With no target the block is stored under its CHK;
    /// with a target it is stored under that key.
    async fn put(
        &self,
        block: Bytes,
        target: Option<&ContentKey>,
    ) -> std::result::Result<ContentKey, NetworkPutError>;
}

// =============================================================================
// Archive Extraction
// =============================================================================

/// Container format of an archive manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveType {
    Zip,
    Tar,
    /// Length-prefixed name/data records
    Bundle,
}

impl fmt::Display for ArchiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveType::Zip => f.write_str("zip"),
            ArchiveType::Tar => f.write_str("tar"),
            ArchiveType::Bundle => f.write_str("bundle"),
        }
    }
}

/// Unpacks a fetched container into its members.
pub trait ArchiveExtractor: Send + Sync {
    fn extract(&self, container: &Bytes, archive_type: ArchiveType)
        -> Result<BTreeMap<String, Bytes>>;
}

// =============================================================================
// Job Queue
// =============================================================================

/// A unit of deferred work.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Scheduling class of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobPriority {
    /// Work a caller is waiting on
    Interactive,
    /// Background work such as healing inserts
    Background,
}

/// Handle to an enqueued job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: Uuid,
    cancel: CancellationToken,
}

impl JobHandle {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            cancel,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Prevent the job from running if it has not started yet.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Runs each enqueued job exactly once, eventually.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: Job, priority: JobPriority) -> JobHandle;
}

// =============================================================================
// Event Publishing
// =============================================================================

/// Sink for client progress and outcome events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: ClientEvent) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_error_modes_are_retryable() {
        use crate::error::FailureMode;
        for err in [
            NetworkFetchError::DataNotFound,
            NetworkFetchError::RouteNotFound,
            NetworkFetchError::RejectedOverload,
            NetworkFetchError::TransferFailed,
            NetworkFetchError::InternalError,
        ] {
            assert!(!err.mode().is_fatal(), "{} should be retryable", err);
        }
        assert!(NetworkPutError::Collision.mode().is_fatal());
        assert!(!NetworkPutError::RejectedOverload.mode().is_fatal());
    }

    #[test]
    fn test_job_handle_cancel() {
        let handle = JobHandle::new(CancellationToken::new());
        let other = handle.clone();
        assert!(!other.is_cancelled());
        handle.cancel();
        assert!(other.is_cancelled());
        assert_eq!(handle.id(), other.id());
    }
}
