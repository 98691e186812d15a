//! Infrastructure Adapters
//!
//! Implementations of the domain ports, following the Port/Adapter
//! (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  BlockNetwork │ ArchiveExtractor │ JobQueue │ EventPublisher│ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ InMemoryNetwork │ BundleExtractor │ TokioJobQueue          │ │
//! │  │ LoggingEventPublisher │ InMemoryEventCollector             │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use splitfec::adapters::InMemoryNetwork;
//! use splitfec::domain::ports::BlockNetwork;
//!
//! let network = InMemoryNetwork::new();
//! let key = network.put(block, None).await?;
//! let data = network.fetch(&key).await?;
//! ```

pub mod bundle;
pub mod event_publisher;
pub mod memory_network;
pub mod tokio_jobs;

pub use bundle::{BundleBuilder, BundleExtractor};
pub use event_publisher::{InMemoryEventCollector, LoggingEventPublisher};
pub use memory_network::{FetchStep, InMemoryNetwork};
pub use tokio_jobs::{JobQueueConfig, TokioJobQueue};
