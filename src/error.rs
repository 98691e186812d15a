//! Error types for the splitfile engine
//!
//! Block-level outcomes are classified into failure modes that are either
//! retryable (nonfatal) or final (fatal). Splitfile-level failures carry the
//! aggregated block counts and a per-mode failure tally rather than the
//! individual block errors.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::failure::FailureCodeTracker;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the splitfile engine
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Client Errors
    // =========================================================================
    /// A fetch failed
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchFailure),

    /// An insert failed
    #[error("Insert failed: {0}")]
    Insert(#[from] InsertFailure),

    /// Operation is not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    // =========================================================================
    // FEC Errors
    // =========================================================================
    /// Codec shape or engine construction rejected
    #[error("Invalid FEC configuration: {0}")]
    InvalidFecConfig(String),

    /// FEC encoding failed
    #[error("FEC encoding failed: {0}")]
    FecEncodingFailed(String),

    /// FEC decoding failed
    #[error("FEC decoding failed: {0}")]
    FecDecodingFailed(String),

    /// Not enough blocks present to decode
    #[error("Insufficient blocks for decode: have {available}, need {required}")]
    InsufficientBlocks { available: usize, required: usize },

    // =========================================================================
    // Configuration & Infrastructure Errors
    // =========================================================================
    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Metadata or event serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a fetch failure without block counts.
    pub fn fetch(mode: FetchFailureMode, message: impl Into<String>) -> Self {
        Error::Fetch(FetchFailure::new(mode).with_message(message))
    }

    /// Shorthand for an insert failure without block counts.
    pub fn insert(mode: InsertFailureMode, message: impl Into<String>) -> Self {
        Error::Insert(InsertFailure::new(mode).with_message(message))
    }

    /// The fetch failure mode, if this is a fetch failure.
    pub fn fetch_mode(&self) -> Option<FetchFailureMode> {
        match self {
            Error::Fetch(f) => Some(f.mode),
            _ => None,
        }
    }

    /// The insert failure mode, if this is an insert failure.
    pub fn insert_mode(&self) -> Option<InsertFailureMode> {
        match self {
            Error::Insert(f) => Some(f.mode),
            _ => None,
        }
    }

    /// Whether retrying the whole request is pointless.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Fetch(f) => f.is_fatal(),
            Error::Insert(f) => f.is_fatal(),
            Error::Io(_) | Error::Internal(_) => false,
            _ => true,
        }
    }
}

// =============================================================================
// Failure Modes
// =============================================================================

/// A failure classification that knows whether it can be retried.
pub trait FailureMode:
    Copy + Ord + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// True when the failure must not be retried.
    fn is_fatal(self) -> bool;
}

/// Why a fetch (of a block, a segment or a whole object) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchFailureMode {
    DataNotFound,
    RouteNotFound,
    RejectedOverload,
    TransferFailed,
    InternalError,
    BucketError,
    BlockDecodeError,
    InvalidMetadata,
    UnknownMetadata,
    TooMuchRecursion,
    TooManyArchiveRestarts,
    NotInArchive,
    TooManyPathComponents,
    NotEnoughPathComponents,
    SplitfileError,
    SplitfileDecodeError,
    ArchiveFailure,
    TooBig,
    Cancelled,
}

impl FetchFailureMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchFailureMode::DataNotFound => "data-not-found",
            FetchFailureMode::RouteNotFound => "route-not-found",
            FetchFailureMode::RejectedOverload => "rejected-overload",
            FetchFailureMode::TransferFailed => "transfer-failed",
            FetchFailureMode::InternalError => "internal-error",
            FetchFailureMode::BucketError => "bucket-error",
            FetchFailureMode::BlockDecodeError => "block-decode-error",
            FetchFailureMode::InvalidMetadata => "invalid-metadata",
            FetchFailureMode::UnknownMetadata => "unknown-metadata",
            FetchFailureMode::TooMuchRecursion => "too-much-recursion",
            FetchFailureMode::TooManyArchiveRestarts => "too-many-archive-restarts",
            FetchFailureMode::NotInArchive => "not-in-archive",
            FetchFailureMode::TooManyPathComponents => "too-many-path-components",
            FetchFailureMode::NotEnoughPathComponents => "not-enough-path-components",
            FetchFailureMode::SplitfileError => "splitfile-error",
            FetchFailureMode::SplitfileDecodeError => "splitfile-decode-error",
            FetchFailureMode::ArchiveFailure => "archive-failure",
            FetchFailureMode::TooBig => "too-big",
            FetchFailureMode::Cancelled => "cancelled",
        }
    }
}

impl FailureMode for FetchFailureMode {
    fn is_fatal(self) -> bool {
        !matches!(
            self,
            FetchFailureMode::DataNotFound
                | FetchFailureMode::RouteNotFound
                | FetchFailureMode::RejectedOverload
                | FetchFailureMode::TransferFailed
                | FetchFailureMode::InternalError
                | FetchFailureMode::BucketError
                | FetchFailureMode::SplitfileError
        )
    }
}

impl fmt::Display for FetchFailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an insert (of a block, a segment or a whole object) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InsertFailureMode {
    RouteNotFound,
    RejectedOverload,
    InternalError,
    BucketError,
    InvalidUri,
    Collision,
    FatalErrorsInBlocks,
    TooManyRetriesInBlocks,
    TooBig,
    Cancelled,
}

impl InsertFailureMode {
    pub fn as_str(self) -> &'static str {
        match self {
            InsertFailureMode::RouteNotFound => "route-not-found",
            InsertFailureMode::RejectedOverload => "rejected-overload",
            InsertFailureMode::InternalError => "internal-error",
            InsertFailureMode::BucketError => "bucket-error",
            InsertFailureMode::InvalidUri => "invalid-uri",
            InsertFailureMode::Collision => "collision",
            InsertFailureMode::FatalErrorsInBlocks => "fatal-errors-in-blocks",
            InsertFailureMode::TooManyRetriesInBlocks => "too-many-retries-in-blocks",
            InsertFailureMode::TooBig => "too-big",
            InsertFailureMode::Cancelled => "cancelled",
        }
    }
}

impl FailureMode for InsertFailureMode {
    fn is_fatal(self) -> bool {
        !matches!(
            self,
            InsertFailureMode::RouteNotFound
                | InsertFailureMode::RejectedOverload
                | InsertFailureMode::InternalError
                | InsertFailureMode::BucketError
                | InsertFailureMode::TooManyRetriesInBlocks
        )
    }
}

impl fmt::Display for InsertFailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Aggregated Failures
// =============================================================================

/// Block tallies attached to a segment or splitfile failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCounts {
    /// Blocks that completed successfully
    pub succeeded: usize,
    /// Blocks that ran out of retries
    pub failed: usize,
    /// Blocks that failed fatally
    pub fatal: usize,
    /// Blocks in the request
    pub total: usize,
}

impl BlockCounts {
    pub fn merge(&mut self, other: &BlockCounts) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.fatal += other.fatal;
        self.total += other.total;
    }
}

impl fmt::Display for BlockCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} fatal of {} blocks",
            self.succeeded, self.failed, self.fatal, self.total
        )
    }
}

/// Generic failure record shared by the fetch and insert paths.
#[derive(Debug, Clone)]
pub struct RequestFailure<M: FailureMode> {
    /// Primary failure mode
    pub mode: M,
    /// Optional human readable detail
    pub message: Option<String>,
    /// Aggregated block tallies for splitfile failures
    pub counts: Option<BlockCounts>,
    /// Per-mode block failure tally for splitfile failures
    pub codes: Option<FailureCodeTracker<M>>,
}

/// Failure of a fetch request.
pub type FetchFailure = RequestFailure<FetchFailureMode>;

/// Failure of an insert request.
pub type InsertFailure = RequestFailure<InsertFailureMode>;

impl<M: FailureMode> RequestFailure<M> {
    pub fn new(mode: M) -> Self {
        Self {
            mode,
            message: None,
            counts: None,
            codes: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_counts(mut self, counts: BlockCounts) -> Self {
        self.counts = Some(counts);
        self
    }

    pub fn with_codes(mut self, codes: FailureCodeTracker<M>) -> Self {
        self.codes = Some(codes);
        self
    }

    /// Fatal if the primary mode is fatal or any fatal block failure was seen.
    pub fn is_fatal(&self) -> bool {
        self.mode.is_fatal() || self.counts.is_some_and(|c| c.fatal > 0)
    }
}

impl<M: FailureMode> fmt::Display for RequestFailure<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mode)?;
        if let Some(message) = &self.message {
            write!(f, ": {}", message)?;
        }
        if let Some(counts) = &self.counts {
            write!(f, " ({})", counts)?;
        }
        if let Some(codes) = self.codes.as_ref().filter(|c| !c.is_empty()) {
            write!(f, " [{}]", codes)?;
        }
        Ok(())
    }
}

impl<M: FailureMode> std::error::Error for RequestFailure<M> {}
