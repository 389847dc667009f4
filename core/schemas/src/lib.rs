use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ============================================================================
// ULID and ID Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemoryId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Memory Schema
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: MemoryId,
    pub user_id: UserId,
    #[serde(default)]
    pub project_id: Option<ProjectId>,
    pub content: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub memory_type: Option<String>,
    /// Attached lazily; `None` until the memory has been embedded.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

impl Memory {
    pub fn new(user_id: UserId, content: impl Into<String>) -> Self {
        Self {
            id: generate_memory_id(),
            user_id,
            project_id: None,
            content: content.into(),
            tags: BTreeSet::new(),
            topic: None,
            memory_type: None,
            embedding: None,
            created_at: Utc::now(),
        }
    }

    /// Scoping metadata stored next to this memory's vector.
    pub fn vector_payload(&self) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert(payload_keys::MEMORY_ID.into(), Value::from(self.id.0.clone()));
        payload.insert(payload_keys::USER_ID.into(), Value::from(self.user_id.0.clone()));
        if let Some(project) = &self.project_id {
            payload.insert(payload_keys::PROJECT_ID.into(), Value::from(project.0.clone()));
        }
        if let Some(topic) = &self.topic {
            payload.insert(payload_keys::TOPIC.into(), Value::from(topic.clone()));
        }
        if let Some(kind) = &self.memory_type {
            payload.insert(payload_keys::MEMORY_TYPE.into(), Value::from(kind.clone()));
        }
        payload.insert(
            payload_keys::TAGS.into(),
            Value::Array(self.tags.iter().cloned().map(Value::from).collect()),
        );
        payload.insert(
            payload_keys::CREATED_AT.into(),
            Value::from(self.created_at.to_rfc3339()),
        );
        payload
    }
}

/// Keys used in vector payloads. Search filters match on these.
pub mod payload_keys {
    pub const MEMORY_ID: &str = "memory_id";
    pub const USER_ID: &str = "user_id";
    pub const PROJECT_ID: &str = "project_id";
    pub const TOPIC: &str = "topic";
    pub const MEMORY_TYPE: &str = "memory_type";
    pub const TAGS: &str = "tags";
    pub const CREATED_AT: &str = "created_at";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentAnalysis {
    pub memory_id: MemoryId,
    pub word_count: usize,
    pub char_count: usize,
    pub topics: Vec<String>,
    pub entities: Vec<String>,
    pub sentiment: f32, // [-1, 1]
    pub language: String,
    pub keywords: Vec<String>,
    pub analyzed_at: DateTime<Utc>,
}

// ============================================================================
// Relationship Schema
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RelationshipType {
    #[serde(rename = "semantic_similarity")]
    SemanticSimilarity,
    #[serde(rename = "topic_overlap")]
    TopicOverlap,
    #[serde(rename = "tag_similarity")]
    TagSimilarity,
    #[serde(rename = "temporal_proximity")]
    TemporalProximity,
    #[serde(rename = "user_connection")]
    UserConnection,
    #[serde(rename = "project_connection")]
    ProjectConnection,
}

impl RelationshipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::SemanticSimilarity => "semantic_similarity",
            RelationshipType::TopicOverlap => "topic_overlap",
            RelationshipType::TagSimilarity => "tag_similarity",
            RelationshipType::TemporalProximity => "temporal_proximity",
            RelationshipType::UserConnection => "user_connection",
            RelationshipType::ProjectConnection => "project_connection",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "semantic_similarity" => Some(RelationshipType::SemanticSimilarity),
            "topic_overlap" => Some(RelationshipType::TopicOverlap),
            "tag_similarity" => Some(RelationshipType::TagSimilarity),
            "temporal_proximity" => Some(RelationshipType::TemporalProximity),
            "user_connection" => Some(RelationshipType::UserConnection),
            "project_connection" => Some(RelationshipType::ProjectConnection),
            _ => None,
        }
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-type detail carried by a relationship. Each variant holds only what
/// its signal produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelationshipMetadata {
    SemanticSimilarity {
        similarity_score: f32,
    },
    TopicOverlap {
        topic: String,
    },
    TagSimilarity {
        shared_tags: Vec<String>,
        jaccard: f32,
    },
    TemporalProximity {
        time_diff_hours: f64,
    },
    UserConnection {
        user_id: UserId,
    },
    ProjectConnection {
        project_id: ProjectId,
    },
}

impl RelationshipMetadata {
    pub fn relationship_type(&self) -> RelationshipType {
        match self {
            RelationshipMetadata::SemanticSimilarity { .. } => RelationshipType::SemanticSimilarity,
            RelationshipMetadata::TopicOverlap { .. } => RelationshipType::TopicOverlap,
            RelationshipMetadata::TagSimilarity { .. } => RelationshipType::TagSimilarity,
            RelationshipMetadata::TemporalProximity { .. } => RelationshipType::TemporalProximity,
            RelationshipMetadata::UserConnection { .. } => RelationshipType::UserConnection,
            RelationshipMetadata::ProjectConnection { .. } => RelationshipType::ProjectConnection,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub source_id: MemoryId,
    pub target_id: MemoryId,
    pub relationship_type: RelationshipType,
    pub strength: f32,
    pub created_at: DateTime<Utc>,
    pub metadata: RelationshipMetadata,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, Value>,
}

impl Relationship {
    /// Builds an edge; the type follows the metadata variant and the
    /// strength is clamped into [0, 1] (NaN becomes 0).
    pub fn new(
        source_id: MemoryId,
        target_id: MemoryId,
        strength: f32,
        metadata: RelationshipMetadata,
    ) -> Self {
        Self {
            source_id,
            target_id,
            relationship_type: metadata.relationship_type(),
            strength: clamp_strength(strength),
            created_at: Utc::now(),
            metadata,
            extensions: BTreeMap::new(),
        }
    }
}

pub fn clamp_strength(strength: f32) -> f32 {
    if strength.is_nan() {
        0.0
    } else {
        strength.clamp(0.0, 1.0)
    }
}

// ============================================================================
// Pipeline Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEvent {
    pub memory: Memory,
    pub emitted_at: DateTime<Utc>,
}

impl MemoryEvent {
    pub fn new(memory: Memory) -> Self {
        Self {
            memory,
            emitted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub memory_id: MemoryId,
    pub user_id: UserId,
    pub project_id: Option<ProjectId>,
    pub analysis: ContentAnalysis,
    pub embedding_dimension: usize,
    pub relationships: Vec<Relationship>,
    pub processing_time_ms: f64,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipsAnnouncement {
    pub relationships: Vec<Relationship>,
    pub source_memory_id: MemoryId,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Embedding Wire Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub id: String,
    pub text: String,
    pub request_id: RequestId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingReply {
    #[serde(default)]
    pub embedding: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body sent to the embedding model server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelServerRequest {
    pub input: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelServerResponse {
    pub vector: Vec<f32>,
}

/// Well-known bus subjects.
pub mod subjects {
    pub const EMBEDDING_REQUEST: &str = "memory.embedding.request";
    pub const MEMORY_CREATED: &str = "memory.created";
    pub const MEMORY_PROCESSED: &str = "memory.processed";
    pub const MEMORY_RELATIONSHIPS: &str = "memory.relationships";
}

// ============================================================================
// Helper Functions
// ============================================================================

pub fn generate_memory_id() -> MemoryId {
    MemoryId(format!("mem_{}", ulid::Ulid::new()))
}

pub fn generate_request_id() -> RequestId {
    RequestId(format!("req_{}", ulid::Ulid::new()))
}
