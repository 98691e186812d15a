//! Domain Layer
//!
//! Ports for the collaborators the engine depends on, and the events it
//! emits.
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for external dependencies
//! - **Events** (`events.rs`) - Progress and outcome events
//!
//! # Usage
//!
//! ```ignore
//! use splitfec::domain::ports::BlockNetwork;
//!
//! async fn probe<N: BlockNetwork>(network: &N, key: &ContentKey) -> bool {
//!     network.fetch(key).await.is_ok()
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::{ClientEvent, RequestKind};
pub use ports::{
    ArchiveExtractor, ArchiveType, BlockNetwork, EventPublisher, Job, JobHandle, JobPriority,
    JobQueue, NetworkFetchError, NetworkPutError,
};
