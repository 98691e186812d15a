//! Shared client context
//!
//! The collaborators every fetch and insert needs, bundled so segments,
//! splitfiles and the getter can be handed one value.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::adapters::event_publisher::LoggingEventPublisher;
use crate::adapters::tokio_jobs::TokioJobQueue;
use crate::buffer::{BufferFactory, InMemoryBufferFactory};
use crate::config::ClientConfig;
use crate::domain::events::ClientEvent;
use crate::domain::ports::{BlockNetwork, EventPublisher, JobQueue};
use crate::error::Result;
use crate::fec::{EngineCache, ErasureCodec, FecQueue};
use crate::metrics::ClientMetrics;

/// Collaborators and settings for one client.
#[derive(Clone)]
pub struct ClientContext {
    pub network: Arc<dyn BlockNetwork>,
    pub buffers: Arc<dyn BufferFactory>,
    pub fec: Arc<FecQueue>,
    pub jobs: Arc<dyn JobQueue>,
    pub events: Arc<dyn EventPublisher>,
    pub metrics: Option<Arc<ClientMetrics>>,
    pub config: ClientConfig,
}

impl ClientContext {
    /// Context with in-process defaults for everything but the network.
    ///
    /// Must be called inside a tokio runtime if healing is enabled, since
    /// healing jobs are spawned on it.
    pub fn new(network: Arc<dyn BlockNetwork>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let engines = Arc::new(EngineCache::new(config.fec.engine_cache_size));
        let codec = Arc::new(ErasureCodec::new(engines));
        let fec = Arc::new(FecQueue::from_config(codec, &config.fec));
        Ok(Self {
            network,
            buffers: Arc::new(InMemoryBufferFactory::new()),
            fec,
            jobs: Arc::new(TokioJobQueue::default()),
            events: Arc::new(LoggingEventPublisher::debug_level()),
            metrics: None,
            config,
        })
    }

    pub fn with_buffers(mut self, buffers: Arc<dyn BufferFactory>) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn with_jobs(mut self, jobs: Arc<dyn JobQueue>) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ClientMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Publish an event; failures are logged and otherwise ignored.
    pub(crate) async fn publish(&self, event: ClientEvent) {
        let event_type = event.event_type();
        if let Err(e) = self.events.publish(event).await {
            warn!(event_type, error = %e, "Failed to publish client event");
        }
    }

    pub(crate) fn record_block(&self, kind: &str, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_block(kind, outcome);
        }
    }

    pub(crate) fn record_segment(&self, kind: &str, success: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_segment(kind, success);
        }
    }

    pub(crate) fn record_fec_job(&self, op: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_fec_job(op);
        }
    }
}

impl fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientContext")
            .field("fec_workers", &self.fec.workers())
            .field("metrics", &self.metrics.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
