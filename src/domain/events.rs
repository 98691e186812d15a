//! Client Events
//!
//! Immutable records of progress and outcomes of fetches and inserts. They
//! are published through the [`EventPublisher`](super::ports::EventPublisher)
//! port and are never needed for correctness.
//!
//! # Example
//!
//! ```ignore
//! let event = ClientEvent::segment_finished(2, true, counts);
//! event_publisher.publish(event).await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BlockCounts;

/// Which side of the client produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Fetch,
    Insert,
}

/// Progress or outcome of a client request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    // =========================================================================
    // Segment Events
    // =========================================================================
    /// A segment reached its terminal state.
    SegmentFinished {
        kind: RequestKind,
        segment: usize,
        success: bool,
        counts: BlockCounts,
        timestamp: DateTime<Utc>,
    },

    /// Blocks were queued for re-insertion after a decode.
    HealingQueued {
        segment: usize,
        blocks: usize,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Splitfile Events
    // =========================================================================
    /// Aggregate block progress across a splitfile.
    SplitfileProgress {
        kind: RequestKind,
        segments_finished: usize,
        segments_total: usize,
        timestamp: DateTime<Utc>,
    },

    /// A fetch produced its final data.
    FetchCompleted {
        uri: String,
        bytes: u64,
        timestamp: DateTime<Utc>,
    },

    /// A fetch gave up.
    FetchFailed {
        uri: String,
        reason: String,
        fatal: bool,
        timestamp: DateTime<Utc>,
    },

    /// An insert produced a root key.
    InsertCompleted {
        root: String,
        bytes: u64,
        segments: usize,
        timestamp: DateTime<Utc>,
    },

    /// An insert gave up.
    InsertFailed {
        reason: String,
        fatal: bool,
        timestamp: DateTime<Utc>,
    },
}

impl ClientEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ClientEvent::SegmentFinished { timestamp, .. }
            | ClientEvent::HealingQueued { timestamp, .. }
            | ClientEvent::SplitfileProgress { timestamp, .. }
            | ClientEvent::FetchCompleted { timestamp, .. }
            | ClientEvent::FetchFailed { timestamp, .. }
            | ClientEvent::InsertCompleted { timestamp, .. }
            | ClientEvent::InsertFailed { timestamp, .. } => *timestamp,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            ClientEvent::SegmentFinished { .. } => "SegmentFinished",
            ClientEvent::HealingQueued { .. } => "HealingQueued",
            ClientEvent::SplitfileProgress { .. } => "SplitfileProgress",
            ClientEvent::FetchCompleted { .. } => "FetchCompleted",
            ClientEvent::FetchFailed { .. } => "FetchFailed",
            ClientEvent::InsertCompleted { .. } => "InsertCompleted",
            ClientEvent::InsertFailed { .. } => "InsertFailed",
        }
    }
}

// =============================================================================
// Constructors
// =============================================================================

impl ClientEvent {
    pub fn segment_finished(
        kind: RequestKind,
        segment: usize,
        success: bool,
        counts: BlockCounts,
    ) -> Self {
        ClientEvent::SegmentFinished {
            kind,
            segment,
            success,
            counts,
            timestamp: Utc::now(),
        }
    }

    pub fn healing_queued(segment: usize, blocks: usize) -> Self {
        ClientEvent::HealingQueued {
            segment,
            blocks,
            timestamp: Utc::now(),
        }
    }

    pub fn splitfile_progress(kind: RequestKind, finished: usize, total: usize) -> Self {
        ClientEvent::SplitfileProgress {
            kind,
            segments_finished: finished,
            segments_total: total,
            timestamp: Utc::now(),
        }
    }

    pub fn fetch_completed(uri: impl Into<String>, bytes: u64) -> Self {
        ClientEvent::FetchCompleted {
            uri: uri.into(),
            bytes,
            timestamp: Utc::now(),
        }
    }

    pub fn fetch_failed(uri: impl Into<String>, reason: impl Into<String>, fatal: bool) -> Self {
        ClientEvent::FetchFailed {
            uri: uri.into(),
            reason: reason.into(),
            fatal,
            timestamp: Utc::now(),
        }
    }

    pub fn insert_completed(root: impl Into<String>, bytes: u64, segments: usize) -> Self {
        ClientEvent::InsertCompleted {
            root: root.into(),
            bytes,
            segments,
            timestamp: Utc::now(),
        }
    }

    pub fn insert_failed(reason: impl Into<String>, fatal: bool) -> Self {
        ClientEvent::InsertFailed {
            reason: reason.into(),
            fatal,
            timestamp: Utc::now(),
        }
    }
}
