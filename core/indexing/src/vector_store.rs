/// Vector similarity store interface (Qdrant-like, scoped by payload filters)
use async_trait::async_trait;
use memory_graph_schemas::{payload_keys, ProjectId, UserId};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub type Payload = Map<String, Value>;

#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error("vector dimension mismatch: collection uses {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("refusing to store an empty vector for {0}")]
    EmptyVector(String),
    #[error("vector store request failed: {0}")]
    Qdrant(#[from] qdrant_client::QdrantError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: Payload,
}

/// Equality conditions on payload fields; all must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilter {
    must: Vec<(String, String)>,
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn must_match(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.must.push((key.into(), value.into()));
        self
    }

    /// Owner scope, optionally narrowed to a project.
    pub fn scoped(user_id: &UserId, project_id: Option<&ProjectId>) -> Self {
        let filter = Self::new().must_match(payload_keys::USER_ID, user_id.0.clone());
        match project_id {
            Some(project) => filter.must_match(payload_keys::PROJECT_ID, project.0.clone()),
            None => filter,
        }
    }

    pub fn conditions(&self) -> &[(String, String)] {
        &self.must
    }

    pub fn matches(&self, payload: &Payload) -> bool {
        self.must.iter().all(|(key, expected)| {
            matches!(payload.get(key), Some(Value::String(actual)) if actual == expected)
        })
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Idempotent by id: replaces vector and payload together.
    async fn upsert(&self, id: &str, vector: Vec<f32>, payload: Payload) -> Result<(), VectorStoreError> {
        self.upsert_batch(vec![VectorPoint {
            id: id.to_string(),
            vector,
            payload,
        }])
        .await
    }

    async fn upsert_batch(&self, points: Vec<VectorPoint>) -> Result<(), VectorStoreError>;

    /// Filter first, then rank by cosine similarity. Scores below
    /// `score_threshold` are dropped.
    async fn search(
        &self,
        vector: &[f32],
        filter: &SearchFilter,
        limit: usize,
        score_threshold: f32,
    ) -> Result<Vec<ScoredPoint>, VectorStoreError>;

    async fn get(&self, id: &str) -> Result<Option<VectorPoint>, VectorStoreError>;

    /// Returns whether a point was removed.
    async fn delete(&self, id: &str) -> Result<bool, VectorStoreError>;
}

/// Collection dimension, fixed by the first write.
#[derive(Debug, Default)]
pub struct DimensionGuard {
    dimension: OnceLock<usize>,
}

impl DimensionGuard {
    pub fn new(dimension: Option<usize>) -> Self {
        let guard = Self::default();
        if let Some(dim) = dimension {
            let _ = guard.dimension.set(dim);
        }
        guard
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension.get().copied()
    }

    /// Checks a query vector without establishing anything.
    pub fn check(&self, actual: usize) -> Result<(), VectorStoreError> {
        match self.dimension() {
            Some(expected) if expected != actual => {
                Err(VectorStoreError::DimensionMismatch { expected, actual })
            }
            _ => Ok(()),
        }
    }

    /// Validates a write batch as a whole, establishing the dimension on first use.
    pub fn check_points(&self, points: &[VectorPoint]) -> Result<(), VectorStoreError> {
        let Some(first) = points.first() else {
            return Ok(());
        };
        if let Some(empty) = points.iter().find(|p| p.vector.is_empty()) {
            return Err(VectorStoreError::EmptyVector(empty.id.clone()));
        }
        let batch_dim = first.vector.len();
        if let Some(odd) = points.iter().find(|p| p.vector.len() != batch_dim) {
            return Err(VectorStoreError::DimensionMismatch {
                expected: batch_dim,
                actual: odd.vector.len(),
            });
        }

        self.establish(batch_dim)
    }

    /// Fixes the dimension if unset; errors if a different one is already fixed.
    pub fn establish(&self, actual: usize) -> Result<(), VectorStoreError> {
        let expected = *self.dimension.get_or_init(|| {
            info!("Vector collection dimension established: {}", actual);
            actual
        });
        if expected != actual {
            return Err(VectorStoreError::DimensionMismatch { expected, actual });
        }
        Ok(())
    }
}

// In-memory vector store for tests and single-process deployments
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    points: RwLock<HashMap<String, VectorPoint>>,
    dimension: DimensionGuard,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            points: RwLock::new(HashMap::new()),
            dimension: DimensionGuard::new(Some(dimension)),
        }
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension.dimension()
    }

    pub async fn len(&self) -> usize {
        self.points.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.points.read().await.is_empty()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert_batch(&self, points: Vec<VectorPoint>) -> Result<(), VectorStoreError> {
        self.dimension.check_points(&points)?;

        let mut stored = self.points.write().await;
        for point in points {
            debug!("Upserting vector {}", point.id);
            stored.insert(point.id.clone(), point);
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        filter: &SearchFilter,
        limit: usize,
        score_threshold: f32,
    ) -> Result<Vec<ScoredPoint>, VectorStoreError> {
        self.dimension.check(vector.len())?;

        let stored = self.points.read().await;
        let mut scored: Vec<ScoredPoint> = stored
            .values()
            .filter(|point| filter.matches(&point.payload))
            .map(|point| ScoredPoint {
                id: point.id.clone(),
                score: cosine_similarity(vector, &point.vector),
                payload: point.payload.clone(),
            })
            .filter(|point| point.score >= score_threshold)
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        scored.truncate(limit);

        Ok(scored)
    }

    async fn get(&self, id: &str) -> Result<Option<VectorPoint>, VectorStoreError> {
        Ok(self.points.read().await.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<bool, VectorStoreError> {
        Ok(self.points.write().await.remove(id).is_some())
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(user: &str, project: Option<&str>) -> Payload {
        let mut payload = Payload::new();
        payload.insert(payload_keys::USER_ID.into(), Value::from(user));
        if let Some(project) = project {
            payload.insert(payload_keys::PROJECT_ID.into(), Value::from(project));
        }
        payload
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];

        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);
        assert!((cosine_similarity(&a, &c) - 0.0).abs() < 0.001);
        assert_eq!(cosine_similarity(&a, &[0.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
    }

    #[tokio::test]
    async fn test_search_applies_filter_before_ranking() {
        let store = InMemoryVectorStore::new();
        store.upsert("mine", vec![1.0, 0.0], payload("u1", None)).await.unwrap();
        store.upsert("theirs", vec![1.0, 0.0], payload("u2", None)).await.unwrap();
        store.upsert("mine-far", vec![0.0, 1.0], payload("u1", None)).await.unwrap();

        let filter = SearchFilter::scoped(&UserId("u1".into()), None);
        let results = store.search(&[1.0, 0.1], &filter, 10, 0.3).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "mine");
    }

    #[tokio::test]
    async fn test_project_scope() {
        let store = InMemoryVectorStore::new();
        store.upsert("a", vec![1.0, 0.0], payload("u1", Some("p1"))).await.unwrap();
        store.upsert("b", vec![1.0, 0.0], payload("u1", Some("p2"))).await.unwrap();
        store.upsert("c", vec![1.0, 0.0], payload("u1", None)).await.unwrap();

        let project = ProjectId("p1".into());
        let filter = SearchFilter::scoped(&UserId("u1".into()), Some(&project));
        let results = store.search(&[1.0, 0.0], &filter, 10, 0.0).await.unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[tokio::test]
    async fn test_ranking_threshold_and_limit() {
        let store = InMemoryVectorStore::new();
        store.upsert("exact", vec![1.0, 0.0], payload("u1", None)).await.unwrap();
        store.upsert("close", vec![0.9, 0.1], payload("u1", None)).await.unwrap();
        store.upsert("orthogonal", vec![0.0, 1.0], payload("u1", None)).await.unwrap();

        let filter = SearchFilter::new();
        let results = store.search(&[1.0, 0.0], &filter, 10, 0.5).await.unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["exact", "close"]);

        let limited = store.search(&[1.0, 0.0], &filter, 1, 0.0).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, "exact");
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_by_id() {
        let store = InMemoryVectorStore::new();
        store.upsert("m", vec![1.0, 0.0], payload("u1", None)).await.unwrap();
        store.upsert("m", vec![0.0, 1.0], payload("u2", None)).await.unwrap();

        assert_eq!(store.len().await, 1);
        let point = store.get("m").await.unwrap().unwrap();
        assert_eq!(point.vector, vec![0.0, 1.0]);
        assert_eq!(point.payload[payload_keys::USER_ID], "u2");
    }

    #[tokio::test]
    async fn test_dimension_fixed_on_first_write() {
        let store = InMemoryVectorStore::new();
        store.upsert("a", vec![1.0; 8], Payload::new()).await.unwrap();
        assert_eq!(store.dimension(), Some(8));

        let err = store.upsert("b", vec![1.0; 4], Payload::new()).await.unwrap_err();
        assert!(matches!(
            err,
            VectorStoreError::DimensionMismatch { expected: 8, actual: 4 }
        ));
        assert!(store.get("b").await.unwrap().is_none());

        let err = store
            .search(&[1.0; 4], &SearchFilter::new(), 5, 0.0)
            .await
            .unwrap_err();
        assert!(matches!(err, VectorStoreError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_mixed_batch_rejected_atomically() {
        let store = InMemoryVectorStore::new();
        let points = vec![
            VectorPoint { id: "a".into(), vector: vec![1.0, 0.0], payload: Payload::new() },
            VectorPoint { id: "b".into(), vector: vec![1.0], payload: Payload::new() },
        ];
        assert!(store.upsert_batch(points).await.is_err());
        assert!(store.is_empty().await);
        assert_eq!(store.dimension(), None);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = InMemoryVectorStore::new();
        store.upsert("a", vec![1.0], Payload::new()).await.unwrap();
        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert!(store.get("a").await.unwrap().is_none());
    }
}
