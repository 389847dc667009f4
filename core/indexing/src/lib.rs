pub mod backends;
pub mod embedding;
pub mod messaging;
pub mod qdrant;
pub mod responder;
pub mod retry;
pub mod vector_store;

pub use backends::{BusEmbeddingBackend, ModelServerClient};
pub use embedding::{
    CacheStats, EmbeddingBackend, EmbeddingConfig, EmbeddingError, EmbeddingProvider, MemoryUsage,
};
pub use messaging::{BusError, BusMessage, InProcessBus, MessageBus};
pub use qdrant::QdrantVectorStore;
pub use responder::EmbeddingResponder;
pub use retry::{retry_with_delay, RetryFailure, RetryPolicy};
pub use vector_store::{
    cosine_similarity, InMemoryVectorStore, Payload, ScoredPoint, SearchFilter, VectorPoint,
    VectorStore, VectorStoreError,
};
