/// Embedding provider: batching, bounded concurrency, retry, caching and
/// memory-budget tracking in front of an `EmbeddingBackend`.
use async_trait::async_trait;
use futures::future::try_join_all;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

use crate::retry::{retry_with_delay, RetryPolicy};

/// Hard ceiling on concurrently in-flight sub-batches, whatever the config says.
pub const MAX_CONCURRENT_BATCHES_CEILING: usize = 10;

/// Zero-vector length used before any response has fixed the dimension
/// (all-MiniLM-L6-v2 output size).
pub const DEFAULT_DIMENSION: usize = 384;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("no messaging connection configured for embedding requests")]
    NotConfigured,
    #[error("embedding request {request_id} timed out after {timeout:?}")]
    Timeout {
        request_id: String,
        timeout: Duration,
    },
    #[error("embedding transport error: {0}")]
    Transport(String),
    #[error("embedding model server error: {0}")]
    Remote(String),
    #[error("malformed embedding reply: {0}")]
    MalformedReply(String),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding call failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<EmbeddingError>,
    },
}

impl EmbeddingError {
    /// Transient failures are retried; configuration and validation errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EmbeddingError::Timeout { .. } | EmbeddingError::Transport(_) | EmbeddingError::Remote(_)
        )
    }
}

/// One network round-trip for a sub-batch of texts.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Must return one vector per input text, in input order.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    async fn health_check(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Texts per sub-batch.
    pub batch_size: usize,
    /// Sub-batches in flight at once; clamped to `MAX_CONCURRENT_BATCHES_CEILING`.
    pub max_concurrent_batches: usize,
    /// Backend calls per sub-batch, counting the first; 3 means up to 2 retries.
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// When set, this dimension is canonical from the start.
    pub expected_dimension: Option<usize>,
    pub cache_capacity: usize,
    /// Informative ceiling for `memory_usage()`; never enforced.
    pub memory_limit_bytes: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            max_concurrent_batches: 3,
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            expected_dimension: None,
            cache_capacity: 10_000,
            memory_limit_bytes: 512 * 1024 * 1024,
        }
    }
}

impl EmbeddingConfig {
    pub fn effective_concurrency(&self) -> usize {
        self.max_concurrent_batches
            .clamp(1, MAX_CONCURRENT_BATCHES_CEILING)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct MemoryUsage {
    pub in_flight_bytes: usize,
    pub cache_bytes: usize,
    pub limit_bytes: usize,
    pub utilization: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Default)]
struct EmbeddingCache {
    entries: HashMap<String, Vec<f32>>,
    order: VecDeque<String>,
    bytes: usize,
}

impl EmbeddingCache {
    fn get(&self, text: &str) -> Option<Vec<f32>> {
        self.entries.get(text).cloned()
    }

    fn insert(&mut self, text: String, vector: Vec<f32>, capacity: usize) {
        if capacity == 0 || self.entries.contains_key(&text) {
            return;
        }
        while self.entries.len() >= capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(evicted) = self.entries.remove(&oldest) {
                self.bytes = self.bytes.saturating_sub(entry_bytes(&oldest, &evicted));
            }
        }
        self.bytes += entry_bytes(&text, &vector);
        self.order.push_back(text.clone());
        self.entries.insert(text, vector);
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.bytes = 0;
    }
}

fn entry_bytes(text: &str, vector: &[f32]) -> usize {
    text.len() + std::mem::size_of_val(vector)
}

/// Keeps the in-flight byte estimate honest even when a call is dropped.
struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
    bytes: usize,
}

impl<'a> InFlightGuard<'a> {
    fn new(counter: &'a AtomicUsize, bytes: usize) -> Self {
        counter.fetch_add(bytes, Ordering::SeqCst);
        Self { counter, bytes }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(self.bytes, Ordering::SeqCst);
    }
}

pub struct EmbeddingProvider {
    backend: Arc<dyn EmbeddingBackend>,
    config: EmbeddingConfig,
    pool: Semaphore,
    dimension: OnceLock<usize>,
    cache: Mutex<EmbeddingCache>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    in_flight_bytes: AtomicUsize,
}

impl EmbeddingProvider {
    pub fn new(backend: Arc<dyn EmbeddingBackend>, config: EmbeddingConfig) -> Self {
        let permits = config.effective_concurrency();
        if permits != config.max_concurrent_batches {
            warn!(
                "max_concurrent_batches {} clamped to {}",
                config.max_concurrent_batches, permits
            );
        }

        let dimension = OnceLock::new();
        if let Some(expected) = config.expected_dimension {
            let _ = dimension.set(expected);
        }

        Self {
            backend,
            pool: Semaphore::new(permits),
            dimension,
            cache: Mutex::new(EmbeddingCache::default()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            in_flight_bytes: AtomicUsize::new(0),
            config,
        }
    }

    /// The canonical dimension, once known.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension.get().copied()
    }

    fn zero_vector(&self) -> Vec<f32> {
        vec![0.0; self.dimension().unwrap_or(DEFAULT_DIMENSION)]
    }

    /// Embeds one text, consulting the exact-text cache first.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Ok(self.zero_vector());
        }

        let cached = self.lock_cache().get(text);
        if let Some(hit) = cached {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!("Embedding cache hit ({} chars)", text.len());
            return Ok(hit);
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        // Single texts share the sub-batch pool.
        let texts = vec![text.to_string()];
        let mut vectors = {
            let _permit = self.acquire_slot().await?;
            self.call_backend(&texts).await?
        };
        let vector = vectors
            .pop()
            .ok_or_else(|| EmbeddingError::MalformedReply("empty embedding response".into()))?;

        self.lock_cache()
            .insert(text.to_string(), vector.clone(), self.config.cache_capacity);

        Ok(vector)
    }

    /// Embeds many texts. Output has the same length and order as `texts`;
    /// any sub-batch exhausting its retries fails the whole call.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let (positions, pending): (Vec<usize>, Vec<String>) = texts
            .iter()
            .enumerate()
            .filter(|(_, text)| !text.trim().is_empty())
            .map(|(idx, text)| (idx, text.clone()))
            .unzip();

        let batch_size = self.config.batch_size.max(1);
        debug!(
            "Embedding batch of {} texts ({} non-empty) in sub-batches of {}",
            texts.len(),
            pending.len(),
            batch_size
        );

        // try_join_all yields results in submission order regardless of
        // which sub-batch finishes first.
        let sub_batches = pending.chunks(batch_size).map(|chunk| async move {
            let _permit = self.acquire_slot().await?;
            self.call_backend(chunk).await
        });
        let embedded: Vec<Vec<f32>> = try_join_all(sub_batches).await?.into_iter().flatten().collect();

        if embedded.len() != pending.len() {
            return Err(EmbeddingError::MalformedReply(format!(
                "expected {} vectors, got {}",
                pending.len(),
                embedded.len()
            )));
        }

        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        for (position, vector) in positions.into_iter().zip(embedded) {
            results[position] = Some(vector);
        }

        Ok(results
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| self.zero_vector()))
            .collect())
    }

    pub async fn health_check(&self) -> bool {
        self.backend.health_check().await
    }

    async fn acquire_slot(&self) -> Result<SemaphorePermit<'_>, EmbeddingError> {
        self.pool
            .acquire()
            .await
            .map_err(|_| EmbeddingError::Transport("embedding pool closed".into()))
    }

    /// One backend call under the retry policy, with dimension validation.
    async fn call_backend(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let estimate = texts.iter().map(String::len).sum::<usize>()
            + texts.len() * self.dimension().unwrap_or(DEFAULT_DIMENSION) * std::mem::size_of::<f32>();
        let _in_flight = InFlightGuard::new(&self.in_flight_bytes, estimate);
        self.log_budget();

        let policy = RetryPolicy::new(self.config.max_attempts, self.config.retry_delay);
        let vectors = retry_with_delay(
            policy,
            |_| self.backend.embed_texts(texts),
            EmbeddingError::is_transient,
        )
        .await
        .map_err(|failure| {
            if failure.last_error.is_transient() {
                EmbeddingError::RetriesExhausted {
                    attempts: failure.attempts,
                    source: Box::new(failure.last_error),
                }
            } else {
                failure.last_error
            }
        })?;

        if vectors.len() != texts.len() {
            return Err(EmbeddingError::MalformedReply(format!(
                "expected {} vectors, got {}",
                texts.len(),
                vectors.len()
            )));
        }

        for vector in &vectors {
            self.validate_dimension(vector.len())?;
        }

        Ok(vectors)
    }

    fn validate_dimension(&self, actual: usize) -> Result<(), EmbeddingError> {
        if actual == 0 {
            return Err(EmbeddingError::MalformedReply("empty embedding vector".into()));
        }
        let expected = *self.dimension.get_or_init(|| {
            info!("Embedding dimension established: {}", actual);
            actual
        });
        if expected != actual {
            return Err(EmbeddingError::DimensionMismatch { expected, actual });
        }
        Ok(())
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, EmbeddingCache> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn log_budget(&self) {
        let usage = self.memory_usage();
        if usage.utilization > 0.9 {
            warn!(
                "Embedding memory usage at {:.0}% of budget ({} bytes in flight, {} cached)",
                usage.utilization * 100.0,
                usage.in_flight_bytes,
                usage.cache_bytes
            );
        }
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        let in_flight_bytes = self.in_flight_bytes.load(Ordering::SeqCst);
        let cache_bytes = self.lock_cache().bytes;
        let limit_bytes = self.config.memory_limit_bytes;
        let utilization = if limit_bytes == 0 {
            0.0
        } else {
            (in_flight_bytes + cache_bytes) as f64 / limit_bytes as f64
        };

        MemoryUsage {
            in_flight_bytes,
            cache_bytes,
            limit_bytes,
            utilization,
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            entries: self.lock_cache().entries.len(),
            hits: self.cache_hits.load(Ordering::Relaxed),
            misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }

    pub fn clear_cache(&self) {
        self.lock_cache().clear();
        info!("Embedding cache cleared");
    }

    pub fn config(&self) -> &EmbeddingConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_is_clamped() {
        let config = EmbeddingConfig {
            max_concurrent_batches: 64,
            ..Default::default()
        };
        assert_eq!(config.effective_concurrency(), MAX_CONCURRENT_BATCHES_CEILING);

        let config = EmbeddingConfig {
            max_concurrent_batches: 0,
            ..Default::default()
        };
        assert_eq!(config.effective_concurrency(), 1);
    }

    #[test]
    fn test_cache_evicts_oldest() {
        let mut cache = EmbeddingCache::default();
        cache.insert("a".into(), vec![1.0], 2);
        cache.insert("b".into(), vec![2.0], 2);
        cache.insert("c".into(), vec![3.0], 2);

        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b"), Some(vec![2.0]));
        assert_eq!(cache.get("c"), Some(vec![3.0]));
        assert_eq!(cache.bytes, 2 * (1 + 4));

        cache.clear();
        assert_eq!(cache.bytes, 0);
        assert!(cache.entries.is_empty());
    }

    #[test]
    fn test_transient_classification() {
        assert!(EmbeddingError::Transport("reset".into()).is_transient());
        assert!(EmbeddingError::Remote("busy".into()).is_transient());
        assert!(!EmbeddingError::NotConfigured.is_transient());
        assert!(!EmbeddingError::DimensionMismatch { expected: 8, actual: 4 }.is_transient());
        assert!(!EmbeddingError::MalformedReply("x".into()).is_transient());
    }
}
