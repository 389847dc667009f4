use anyhow::{Context, Result};
use memory_graph_indexing::BusMessage;
use memory_graph_schemas::{MemoryEvent, ProcessedEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::orchestrator::MemoryProcessor;

/// Background worker that processes memory events from the bus
pub struct ProcessingWorker {
    processor: Arc<MemoryProcessor>,
    receiver: mpsc::UnboundedReceiver<BusMessage>,
}

impl ProcessingWorker {
    pub fn new(
        processor: Arc<MemoryProcessor>,
        receiver: mpsc::UnboundedReceiver<BusMessage>,
    ) -> Self {
        Self {
            processor,
            receiver,
        }
    }

    /// Runs until the subscription closes. One bad event never stops the loop.
    pub async fn run(mut self) {
        info!("Processing worker started");

        while let Some(message) = self.receiver.recv().await {
            let result = self.handle(&message.payload).await;

            if message.expects_reply() {
                let reply = match &result {
                    Ok(processed) => serde_json::to_vec(processed),
                    Err(e) => serde_json::to_vec(&serde_json::json!({ "error": e.to_string() })),
                };
                match reply {
                    Ok(reply) => {
                        if let Err(e) = message.respond(reply) {
                            warn!("Failed to reply to memory event: {}", e);
                        }
                    }
                    Err(e) => error!("Failed to encode worker reply: {}", e),
                }
            }

            if let Err(e) = result {
                error!("Failed to process memory event: {:#}", e);
            }
        }

        warn!("Processing worker stopped - subscription closed");
    }

    async fn handle(&self, payload: &[u8]) -> Result<ProcessedEvent> {
        let event: MemoryEvent =
            serde_json::from_slice(payload).context("invalid memory event")?;
        let processed = self.processor.process(&event).await?;
        self.processor.publish(&processed).await;
        Ok(processed)
    }
}
