/// Memory processing pipeline: analyze, embed, detect, persist, index, record.
use chrono::Utc;
use futures::future::join_all;
use memory_graph_indexing::{EmbeddingProvider, VectorStore};
use memory_graph_schemas::{MemoryEvent, MemoryId, ProcessedEvent};
use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::analyzer::ContentAnalyzer;
use crate::detector::{DetectorConfig, RelationshipDetector};
use crate::persistence::RelationshipStore;
use crate::publisher::EventPublisher;
use crate::stats::ProcessingStats;

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Items processed concurrently per batch window.
    pub batch_window: usize,
    /// Store each processed memory's vector so later memories can find it.
    pub index_embeddings: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_window: 5,
            index_embeddings: true,
        }
    }
}

fn is_zero_vector(vector: &[f32]) -> bool {
    vector.iter().all(|x| *x == 0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStage {
    Analyze,
    Embed,
    Detect,
    Persist,
    Index,
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ProcessingStage::Analyze => "analyze",
            ProcessingStage::Embed => "embed",
            ProcessingStage::Detect => "detect",
            ProcessingStage::Persist => "persist",
            ProcessingStage::Index => "index",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
#[error("failed to process memory {memory_id} during {stage}")]
pub struct ProcessingError {
    pub memory_id: MemoryId,
    pub stage: ProcessingStage,
    #[source]
    pub source: Option<Box<dyn StdError + Send + Sync>>,
}

impl ProcessingError {
    fn new(
        memory_id: &MemoryId,
        stage: ProcessingStage,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self {
            memory_id: memory_id.clone(),
            stage,
            source: Some(source.into()),
        }
    }
}

#[derive(Debug)]
pub struct BatchFailure {
    /// Position of the failed event in the input slice.
    pub index: usize,
    pub memory_id: MemoryId,
    pub error: ProcessingError,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    /// Successful results in input order.
    pub processed: Vec<ProcessedEvent>,
    pub failures: Vec<BatchFailure>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.processed.len() + self.failures.len()
    }
}

pub struct MemoryProcessor {
    analyzer: Arc<dyn ContentAnalyzer>,
    embeddings: Arc<EmbeddingProvider>,
    vector_store: Arc<dyn VectorStore>,
    detector: RelationshipDetector,
    relationship_store: Option<Arc<dyn RelationshipStore>>,
    publisher: Option<EventPublisher>,
    stats: Arc<Mutex<ProcessingStats>>,
    config: ProcessorConfig,
}

impl MemoryProcessor {
    pub fn new(
        analyzer: Arc<dyn ContentAnalyzer>,
        embeddings: Arc<EmbeddingProvider>,
        vector_store: Arc<dyn VectorStore>,
        detector_config: DetectorConfig,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            analyzer,
            embeddings,
            detector: RelationshipDetector::new(vector_store.clone(), detector_config),
            vector_store,
            relationship_store: None,
            publisher: None,
            stats: Arc::new(Mutex::new(ProcessingStats::new())),
            config,
        }
    }

    pub fn with_relationship_store(mut self, store: Arc<dyn RelationshipStore>) -> Self {
        self.relationship_store = Some(store);
        self
    }

    pub fn with_publisher(mut self, publisher: EventPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Shares an externally owned stats object.
    pub fn with_stats(mut self, stats: Arc<Mutex<ProcessingStats>>) -> Self {
        self.stats = stats;
        self
    }

    pub fn embeddings(&self) -> &Arc<EmbeddingProvider> {
        &self.embeddings
    }

    pub fn stats(&self) -> ProcessingStats {
        self.lock_stats().clone()
    }

    pub fn reset_stats(&self) {
        self.lock_stats().reset();
    }

    /// Runs the full pipeline for one memory. Does not publish.
    pub async fn process(&self, event: &MemoryEvent) -> Result<ProcessedEvent, ProcessingError> {
        let started = Instant::now();
        let memory = &event.memory;
        debug!("Processing memory {}", memory.id);

        let analysis = self
            .analyzer
            .analyze(memory)
            .await
            .map_err(|e| ProcessingError::new(&memory.id, ProcessingStage::Analyze, e))?;

        let embedding = match memory.embedding.as_ref().filter(|v| !v.is_empty()) {
            Some(existing) => existing.clone(),
            None => self
                .embeddings
                .embed(&memory.content)
                .await
                .map_err(|e| ProcessingError::new(&memory.id, ProcessingStage::Embed, e))?,
        };

        // Blank content embeds to zeros: nothing to compare, nothing to index,
        // and it must not fix the collection's dimension.
        let has_signal = !is_zero_vector(&embedding);
        let relationships = if has_signal {
            self.detector
                .detect(memory, &embedding)
                .await
                .map_err(|e| ProcessingError::new(&memory.id, ProcessingStage::Detect, e))?
        } else {
            debug!("Memory {} has a zero embedding, skipping detection", memory.id);
            Vec::new()
        };

        if let Some(store) = &self.relationship_store {
            store
                .save_relationships(&memory.id, &relationships)
                .await
                .map_err(|e| ProcessingError::new(&memory.id, ProcessingStage::Persist, e))?;
        }

        // Indexed last so a failed memory never becomes a candidate for others.
        if self.config.index_embeddings && has_signal {
            self.vector_store
                .upsert(&memory.id.0, embedding.clone(), memory.vector_payload())
                .await
                .map_err(|e| ProcessingError::new(&memory.id, ProcessingStage::Index, e))?;
        }

        let processed = ProcessedEvent {
            memory_id: memory.id.clone(),
            user_id: memory.user_id.clone(),
            project_id: memory.project_id.clone(),
            analysis,
            embedding_dimension: embedding.len(),
            relationships,
            processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            processed_at: Utc::now(),
        };

        self.lock_stats().record(&processed);
        info!(
            "Processed memory {} with {} relationships in {:.1}ms",
            processed.memory_id,
            processed.relationships.len(),
            processed.processing_time_ms
        );

        Ok(processed)
    }

    /// Processes events window by window; items inside a window run
    /// concurrently. Failures are reported per item.
    pub async fn process_batch(&self, events: &[MemoryEvent]) -> BatchReport {
        let window = self.config.batch_window.max(1);
        let mut report = BatchReport::default();

        for (window_idx, chunk) in events.chunks(window).enumerate() {
            let results = join_all(chunk.iter().map(|event| self.process(event))).await;

            for (offset, (event, result)) in chunk.iter().zip(results).enumerate() {
                match result {
                    Ok(processed) => report.processed.push(processed),
                    Err(error) => {
                        warn!("Batch item failed: {}", error);
                        report.failures.push(BatchFailure {
                            index: window_idx * window + offset,
                            memory_id: event.memory.id.clone(),
                            error,
                        });
                    }
                }
            }
        }

        info!(
            "Batch complete: {} processed, {} failed",
            report.processed.len(),
            report.failures.len()
        );
        report
    }

    /// Best-effort announcement; a no-op without a publisher.
    pub async fn publish(&self, processed: &ProcessedEvent) {
        match &self.publisher {
            Some(publisher) => publisher.publish(processed).await,
            None => debug!("No publisher configured, skipping {}", processed.memory_id),
        }
    }

    fn lock_stats(&self) -> MutexGuard<'_, ProcessingStats> {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
