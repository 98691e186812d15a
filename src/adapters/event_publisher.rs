//! Event Publisher Adapters
//!
//! Implementations of the `EventPublisher` port: structured logging and an
//! in-memory collector for tests.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::domain::events::ClientEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

/// Publishes client events to the tracing subscriber.
#[derive(Debug, Clone, Default)]
pub struct LoggingEventPublisher {
    /// Log at info level (true) or debug level (false)
    info_level: bool,
}

impl LoggingEventPublisher {
    pub fn info_level() -> Self {
        Self { info_level: true }
    }

    pub fn debug_level() -> Self {
        Self { info_level: false }
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: ClientEvent) -> Result<()> {
        let event_type = event.event_type();
        let json = serde_json::to_string(&event)?;

        if self.info_level {
            info!(event_type = %event_type, event = %json, "Client event");
        } else {
            debug!(event_type = %event_type, event = %json, "Client event");
        }

        Ok(())
    }
}

/// Collects events in memory for later inspection.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: parking_lot::RwLock<Vec<ClientEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<ClientEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: ClientEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_logging_publisher() {
        let publisher = LoggingEventPublisher::info_level();
        publisher
            .publish(ClientEvent::healing_queued(0, 3))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_in_memory_collector() {
        let collector = InMemoryEventCollector::new();
        assert!(collector.is_empty());

        collector
            .publish(ClientEvent::fetch_completed("CHK@aa", 10))
            .await
            .unwrap();
        for segment in [1, 2] {
            collector
                .publish(ClientEvent::healing_queued(segment, 2))
                .await
                .unwrap();
        }

        assert_eq!(collector.len(), 3);
        assert_eq!(collector.events_of_type("HealingQueued").len(), 2);
        assert_eq!(collector.events_of_type("FetchCompleted").len(), 1);

        collector.clear();
        assert!(collector.is_empty());
    }
}
