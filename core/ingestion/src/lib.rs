pub mod analyzer;
pub mod detector;
pub mod orchestrator;
pub mod persistence;
pub mod publisher;
pub mod stats;
pub mod worker;

pub use analyzer::{ContentAnalyzer, HeuristicAnalyzer};
pub use detector::{
    jaccard_similarity, temporal_strength, DetectError, DetectorConfig, RelationshipDetector,
};
pub use orchestrator::{
    BatchFailure, BatchReport, MemoryProcessor, ProcessingError, ProcessingStage, ProcessorConfig,
};
pub use persistence::{RelationshipStore, SqliteRelationshipStore};
pub use publisher::EventPublisher;
pub use stats::ProcessingStats;
pub use worker::ProcessingWorker;
