/// Qdrant-backed `VectorStore`.
///
/// Qdrant point ids must be UUIDs or integers, so memory ids are mapped to
/// UUID v5 and the original id travels in the payload under `memory_id`.
/// The collection is created on the first write when its dimension is not
/// known up front.
use async_trait::async_trait;
use memory_graph_schemas::payload_keys;
use qdrant_client::qdrant::{
    point_id::PointIdOptions, value::Kind, vectors::VectorsOptions, Condition,
    CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, GetPointsBuilder, ListValue,
    PointId, PointStruct, PointsIdsList, SearchPointsBuilder, Struct, UpsertPointsBuilder,
    Value as QdrantValue, VectorParamsBuilder, Vectors,
};
use qdrant_client::Qdrant;
use serde_json::{Number, Value};
use std::collections::HashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use uuid::Uuid;

use crate::vector_store::{
    DimensionGuard, Payload, ScoredPoint, SearchFilter, VectorPoint, VectorStore, VectorStoreError,
};

/// Collection name for memory vectors
pub const DEFAULT_COLLECTION: &str = "memory_embeddings";

pub struct QdrantVectorStore {
    client: Qdrant,
    collection: String,
    dimension: DimensionGuard,
    ready: OnceCell<()>,
}

impl QdrantVectorStore {
    /// Builds the client; no request is made until first use.
    pub fn new(url: &str, collection: impl Into<String>) -> Result<Self, VectorStoreError> {
        debug!("Connecting to Qdrant at {}", url);
        let client = Qdrant::from_url(url).build()?;

        Ok(Self {
            client,
            collection: collection.into(),
            dimension: DimensionGuard::default(),
            ready: OnceCell::new(),
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Creates the collection (cosine distance) if it does not exist and
    /// fixes the dimension. Runs at most once per store.
    pub async fn ensure_collection(&self, dimension: usize) -> Result<(), VectorStoreError> {
        self.dimension.establish(dimension)?;

        self.ready
            .get_or_try_init(|| async {
                let exists = self.client.collection_exists(&self.collection).await?;
                if exists {
                    debug!("Collection {} already exists", self.collection);
                } else {
                    info!("Creating collection: {} ({} dims)", self.collection, dimension);
                    self.client
                        .create_collection(
                            CreateCollectionBuilder::new(&self.collection).vectors_config(
                                VectorParamsBuilder::new(dimension as u64, Distance::Cosine),
                            ),
                        )
                        .await?;
                }
                Ok::<(), VectorStoreError>(())
            })
            .await?;
        Ok(())
    }

    /// Whether the collection can be queried. Before the first write it may
    /// not exist yet, which reads treat as empty.
    async fn collection_available(&self) -> Result<bool, VectorStoreError> {
        if self.ready.initialized() {
            return Ok(true);
        }
        Ok(self.client.collection_exists(&self.collection).await?)
    }
}

pub fn point_id(memory_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, memory_id.as_bytes()).to_string()
}

/// Equality conditions as a Qdrant `must` filter; `None` when unfiltered.
pub fn qdrant_filter(filter: &SearchFilter) -> Option<Filter> {
    if filter.conditions().is_empty() {
        return None;
    }
    Some(Filter::must(
        filter
            .conditions()
            .iter()
            .map(|(key, value)| Condition::matches(key.clone(), value.clone())),
    ))
}

fn to_qdrant_value(value: Value) -> QdrantValue {
    let kind = match value {
        Value::Null => Kind::NullValue(0),
        Value::Bool(b) => Kind::BoolValue(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Kind::IntegerValue(i),
            None => Kind::DoubleValue(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Kind::StringValue(s),
        Value::Array(items) => Kind::ListValue(ListValue {
            values: items.into_iter().map(to_qdrant_value).collect(),
        }),
        Value::Object(map) => Kind::StructValue(Struct {
            fields: map
                .into_iter()
                .map(|(key, value)| (key, to_qdrant_value(value)))
                .collect(),
        }),
    };
    QdrantValue { kind: Some(kind) }
}

fn from_qdrant_value(value: QdrantValue) -> Value {
    match value.kind {
        None | Some(Kind::NullValue(_)) => Value::Null,
        Some(Kind::BoolValue(b)) => Value::Bool(b),
        Some(Kind::IntegerValue(i)) => Value::from(i),
        Some(Kind::DoubleValue(d)) => Number::from_f64(d).map(Value::Number).unwrap_or(Value::Null),
        Some(Kind::StringValue(s)) => Value::String(s),
        Some(Kind::ListValue(list)) => {
            Value::Array(list.values.into_iter().map(from_qdrant_value).collect())
        }
        Some(Kind::StructValue(object)) => Value::Object(
            object
                .fields
                .into_iter()
                .map(|(key, value)| (key, from_qdrant_value(value)))
                .collect(),
        ),
    }
}

fn to_qdrant_payload(payload: Payload) -> HashMap<String, QdrantValue> {
    payload
        .into_iter()
        .map(|(key, value)| (key, to_qdrant_value(value)))
        .collect()
}

fn from_qdrant_payload(payload: HashMap<String, QdrantValue>) -> Payload {
    payload
        .into_iter()
        .map(|(key, value)| (key, from_qdrant_value(value)))
        .collect()
}

/// Recovers the caller's id from the payload, falling back to Qdrant's id.
fn original_id(id: Option<PointId>, payload: &Payload) -> String {
    if let Some(Value::String(memory_id)) = payload.get(payload_keys::MEMORY_ID) {
        return memory_id.clone();
    }
    match id.and_then(|id| id.point_id_options) {
        Some(PointIdOptions::Uuid(uuid)) => uuid,
        Some(PointIdOptions::Num(num)) => num.to_string(),
        None => String::new(),
    }
}

fn dense_vector(vectors: Option<Vectors>) -> Vec<f32> {
    match vectors.and_then(|v| v.vectors_options) {
        Some(VectorsOptions::Vector(vector)) => vector.data,
        _ => Vec::new(),
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn upsert_batch(&self, points: Vec<VectorPoint>) -> Result<(), VectorStoreError> {
        self.dimension.check_points(&points)?;
        let Some(first) = points.first() else {
            return Ok(());
        };
        self.ensure_collection(first.vector.len()).await?;

        let structs: Vec<PointStruct> = points
            .into_iter()
            .map(|point| {
                let mut payload = point.payload;
                payload.insert(payload_keys::MEMORY_ID.into(), Value::from(point.id.clone()));
                PointStruct::new(point_id(&point.id), point.vector, to_qdrant_payload(payload))
            })
            .collect();

        debug!("Upserting {} points into {}", structs.len(), self.collection);
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, structs).wait(true))
            .await?;
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
        if !self.collection_available().await? {
            debug!("Collection {} not created yet, no candidates", self.collection);
            return Ok(Vec::new());
        }

        let mut request = SearchPointsBuilder::new(&self.collection, vector.to_vec(), limit as u64)
            .score_threshold(score_threshold)
            .with_payload(true);
        if let Some(filter) = qdrant_filter(filter) {
            request = request.filter(filter);
        }
        let response = self.client.search_points(request).await?;

        Ok(response
            .result
            .into_iter()
            .map(|point| {
                let payload = from_qdrant_payload(point.payload);
                ScoredPoint {
                    id: original_id(point.id, &payload),
                    score: point.score,
                    payload,
                }
            })
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Option<VectorPoint>, VectorStoreError> {
        if !self.collection_available().await? {
            return Ok(None);
        }

        let response = self
            .client
            .get_points(
                GetPointsBuilder::new(&self.collection, vec![PointId::from(point_id(id))])
                    .with_payload(true)
                    .with_vectors(true),
            )
            .await?;

        Ok(response.result.into_iter().next().map(|record| {
            let payload = from_qdrant_payload(record.payload);
            VectorPoint {
                id: original_id(record.id, &payload),
                vector: dense_vector(record.vectors),
                payload,
            }
        }))
    }

    async fn delete(&self, id: &str) -> Result<bool, VectorStoreError> {
        let existed = self.get(id).await?.is_some();
        if !existed {
            return Ok(false);
        }
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(PointsIdsList {
                        ids: vec![PointId::from(point_id(id))],
                    })
                    .wait(true),
            )
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory_graph_schemas::{ProjectId, UserId};
    use serde_json::json;

    #[test]
    fn test_point_id_is_deterministic_uuid() {
        let a = point_id("mem_01HZX");
        assert_eq!(a, point_id("mem_01HZX"));
        assert_ne!(a, point_id("mem_01HZY"));
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn test_filter_conditions() {
        assert!(qdrant_filter(&SearchFilter::new()).is_none());

        let project = ProjectId("p1".into());
        let filter = qdrant_filter(&SearchFilter::scoped(&UserId("u1".into()), Some(&project)))
            .unwrap();
        assert_eq!(filter.must.len(), 2);
        assert!(filter.should.is_empty());
    }

    #[test]
    fn test_payload_conversion_keeps_tags_and_timestamps() {
        let mut payload = Payload::new();
        payload.insert(payload_keys::USER_ID.into(), json!("u1"));
        payload.insert(payload_keys::TAGS.into(), json!(["rust", "async"]));
        payload.insert(payload_keys::CREATED_AT.into(), json!("2024-05-01T10:00:00+00:00"));
        payload.insert("weight".into(), json!(0.25));
        payload.insert("count".into(), json!(3));
        payload.insert("extra".into(), json!({ "nested": null }));

        let converted = to_qdrant_payload(payload.clone());
        assert!(matches!(
            converted[payload_keys::TAGS].kind,
            Some(Kind::ListValue(_))
        ));
        assert_eq!(from_qdrant_payload(converted), payload);
    }

    #[test]
    fn test_original_id_prefers_payload() {
        let mut payload = Payload::new();
        payload.insert(payload_keys::MEMORY_ID.into(), Value::from("mem_1"));
        let uuid = PointId::from(point_id("mem_1"));
        assert_eq!(original_id(Some(uuid.clone()), &payload), "mem_1");
        assert_eq!(original_id(Some(uuid), &Payload::new()), point_id("mem_1"));
    }

    #[tokio::test]
    async fn test_dimension_checked_before_network() {
        // Nothing listens here; validation must fail first.
        let store = QdrantVectorStore::new("http://127.0.0.1:9", DEFAULT_COLLECTION).unwrap();
        let points = vec![
            VectorPoint { id: "a".into(), vector: vec![1.0, 2.0], payload: Payload::new() },
            VectorPoint { id: "b".into(), vector: vec![1.0], payload: Payload::new() },
        ];
        let err = store.upsert_batch(points).await.unwrap_err();
        assert!(matches!(err, VectorStoreError::DimensionMismatch { .. }));
    }

    // Requires a running Qdrant instance (gRPC port).
    #[tokio::test]
    #[ignore]
    async fn test_collection_created_on_first_write() {
        let collection = format!("memory_graph_test_{}", Uuid::new_v4().simple());
        let store = QdrantVectorStore::new("http://localhost:6334", collection).unwrap();
        let filter = SearchFilter::scoped(&UserId("u1".into()), None);

        // Nothing written yet: reads are empty, not errors.
        assert!(store.search(&[1.0, 0.0], &filter, 5, 0.3).await.unwrap().is_empty());
        assert!(store.get("mem_a").await.unwrap().is_none());

        let mut payload = Payload::new();
        payload.insert(payload_keys::USER_ID.into(), json!("u1"));
        store.upsert("mem_a", vec![1.0, 0.0], payload).await.unwrap();

        let results = store.search(&[1.0, 0.0], &filter, 5, 0.3).await.unwrap();
        assert_eq!(results[0].id, "mem_a");
        assert!(store.delete("mem_a").await.unwrap());

        store.client.delete_collection(store.collection()).await.unwrap();
    }
}
