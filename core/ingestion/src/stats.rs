use chrono::{DateTime, Utc};
use memory_graph_schemas::{ProcessedEvent, RelationshipType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Smoothing factor for the processing latency average.
pub const LATENCY_EMA_ALPHA: f64 = 0.1;

/// Running totals for processed memories. Owned by the processor and only
/// changed through `record` and `reset`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub total_processed: u64,
    pub relationships_by_type: BTreeMap<RelationshipType, u64>,
    pub languages: BTreeMap<String, u64>,
    pub topics: BTreeMap<String, u64>,
    /// `None` until the first sample.
    pub average_processing_time_ms: Option<f64>,
    pub last_processed_at: Option<DateTime<Utc>>,
}

impl ProcessingStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one successful result into the totals.
    pub fn record(&mut self, processed: &ProcessedEvent) {
        self.total_processed += 1;

        for relationship in &processed.relationships {
            *self
                .relationships_by_type
                .entry(relationship.relationship_type)
                .or_insert(0) += 1;
        }

        *self
            .languages
            .entry(processed.analysis.language.clone())
            .or_insert(0) += 1;
        for topic in &processed.analysis.topics {
            *self.topics.entry(topic.clone()).or_insert(0) += 1;
        }

        self.average_processing_time_ms = Some(ema(
            self.average_processing_time_ms,
            processed.processing_time_ms,
            LATENCY_EMA_ALPHA,
        ));
        self.last_processed_at = Some(processed.processed_at);
    }

    pub fn total_relationships(&self) -> u64 {
        self.relationships_by_type.values().sum()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Exponential moving average; the first sample becomes the average.
pub fn ema(previous: Option<f64>, sample: f64, alpha: f64) -> f64 {
    match previous {
        None => sample,
        Some(avg) => alpha * sample + (1.0 - alpha) * avg,
    }
}
