use chrono::Utc;
use memory_graph_indexing::MessageBus;
use memory_graph_schemas::{subjects, ProcessedEvent, RelationshipsAnnouncement};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Announces processed memories on the bus. Best-effort: failures are logged
/// and never reach the caller.
pub struct EventPublisher {
    bus: Arc<dyn MessageBus>,
    processed_subject: String,
    relationships_subject: String,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            processed_subject: subjects::MEMORY_PROCESSED.to_string(),
            relationships_subject: subjects::MEMORY_RELATIONSHIPS.to_string(),
        }
    }

    pub fn with_subjects(
        mut self,
        processed: impl Into<String>,
        relationships: impl Into<String>,
    ) -> Self {
        self.processed_subject = processed.into();
        self.relationships_subject = relationships.into();
        self
    }

    pub async fn publish(&self, processed: &ProcessedEvent) {
        self.send(&self.processed_subject, processed).await;

        if processed.relationships.is_empty() {
            return;
        }
        let announcement = RelationshipsAnnouncement {
            relationships: processed.relationships.clone(),
            source_memory_id: processed.memory_id.clone(),
            created_at: Utc::now(),
        };
        self.send(&self.relationships_subject, &announcement).await;
    }

    async fn send<T: Serialize + Sync>(&self, subject: &str, event: &T) {
        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode event for {}: {}", subject, e);
                return;
            }
        };
        match self.bus.publish(subject, payload).await {
            Ok(()) => debug!("Published event on {}", subject),
            Err(e) => warn!("Failed to publish event on {}: {}", subject, e),
        }
    }
}
