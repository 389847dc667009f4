use memory_graph_schemas::{EmbeddingReply, EmbeddingRequest};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::backends::ModelServerClient;
use crate::messaging::BusMessage;

/// Background worker answering embedding requests from the bus by calling
/// the model server. Each request is handled on its own task.
pub struct EmbeddingResponder {
    client: Arc<ModelServerClient>,
    receiver: mpsc::UnboundedReceiver<BusMessage>,
}

impl EmbeddingResponder {
    pub fn new(client: Arc<ModelServerClient>, receiver: mpsc::UnboundedReceiver<BusMessage>) -> Self {
        Self { client, receiver }
    }

    /// Runs until the subscription closes.
    pub async fn run(mut self) {
        info!("Embedding responder started (model: {})", self.client.model());

        while let Some(message) = self.receiver.recv().await {
            let client = self.client.clone();
            tokio::spawn(async move {
                handle_request(&client, message).await;
            });
        }

        warn!("Embedding responder stopped - subscription closed");
    }
}

async fn handle_request(client: &ModelServerClient, message: BusMessage) {
    if !message.expects_reply() {
        warn!("Ignoring embedding request without reply channel");
        return;
    }

    let reply = match serde_json::from_slice::<EmbeddingRequest>(&message.payload) {
        Ok(request) => {
            debug!("Embedding request {} for {}", request.request_id, request.id);
            match client.embed_one(&request.text).await {
                Ok(embedding) => EmbeddingReply {
                    embedding,
                    error: None,
                },
                Err(e) => {
                    error!("Embedding request {} failed: {}", request.request_id, e);
                    EmbeddingReply {
                        embedding: Vec::new(),
                        error: Some(e.to_string()),
                    }
                }
            }
        }
        Err(e) => EmbeddingReply {
            embedding: Vec::new(),
            error: Some(format!("invalid embedding request: {}", e)),
        },
    };

    match serde_json::to_vec(&reply) {
        Ok(payload) => {
            if let Err(e) = message.respond(payload) {
                debug!("Embedding reply not delivered: {}", e);
            }
        }
        Err(e) => error!("Failed to encode embedding reply: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{InProcessBus, MessageBus};
    use memory_graph_schemas::subjects;
    use std::time::Duration;

    #[tokio::test]
    async fn test_invalid_request_gets_error_reply() {
        let bus = InProcessBus::new();
        let rx = bus.subscribe(subjects::EMBEDDING_REQUEST);
        // Unroutable address: the responder must never reach it for bad input.
        let client = Arc::new(ModelServerClient::new("http://127.0.0.1:9", "test-model"));
        tokio::spawn(EmbeddingResponder::new(client, rx).run());

        let raw = bus
            .request(
                subjects::EMBEDDING_REQUEST,
                b"{not json".to_vec(),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        let reply: EmbeddingReply = serde_json::from_slice(&raw).unwrap();
        assert!(reply.embedding.is_empty());
        assert!(reply.error.unwrap().starts_with("invalid embedding request"));
    }
}
