/// Relationship detection over a shared neighbor candidate pool
use chrono::{DateTime, Utc};
use memory_graph_indexing::{ScoredPoint, SearchFilter, VectorStore, VectorStoreError};
use memory_graph_schemas::{payload_keys, Memory, MemoryId, Relationship, RelationshipMetadata};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Score floor for the candidate search; signals apply their own thresholds.
pub const CANDIDATE_SCORE_THRESHOLD: f32 = 0.3;

/// Temporal edges at or below this strength are dropped.
pub const MIN_TEMPORAL_STRENGTH: f32 = 0.1;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("neighbor search failed: {0}")]
    Search(#[from] VectorStoreError),
    #[error("candidate {candidate} has invalid {field}: {reason}")]
    InvalidPayload {
        candidate: String,
        field: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub semantic_similarity_threshold: f32,
    /// Fixed strength of a topic overlap edge.
    pub topic_overlap_threshold: f32,
    pub tag_similarity_threshold: f32,
    pub temporal_proximity_window: Duration,
    pub max_similar_memories_to_check: usize,
    pub max_relationships_per_memory: usize,
    /// Restrict candidates to the memory's project when it has one.
    pub scope_by_project: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            semantic_similarity_threshold: 0.7,
            topic_overlap_threshold: 0.5,
            tag_similarity_threshold: 0.3,
            temporal_proximity_window: Duration::from_secs(24 * 3600),
            max_similar_memories_to_check: 50,
            max_relationships_per_memory: 20,
            scope_by_project: true,
        }
    }
}

pub struct RelationshipDetector {
    store: Arc<dyn VectorStore>,
    config: DetectorConfig,
}

impl RelationshipDetector {
    pub fn new(store: Arc<dyn VectorStore>, config: DetectorConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Runs one candidate search and scores every signal against it.
    /// Edges come back strongest first, capped at
    /// `max_relationships_per_memory`; equal strengths keep signal order
    /// (semantic, topic, tag, temporal).
    pub async fn detect(
        &self,
        memory: &Memory,
        embedding: &[f32],
    ) -> Result<Vec<Relationship>, DetectError> {
        let candidates = self.find_candidates(memory, embedding).await?;
        debug!(
            "Scoring {} candidates for memory {}",
            candidates.len(),
            memory.id
        );

        let mut relationships = Vec::new();
        let signals: [(&str, Result<Vec<Relationship>, DetectError>); 4] = [
            ("semantic", self.semantic_relationships(memory, &candidates)),
            ("topic", self.topic_relationships(memory, &candidates)),
            ("tag", self.tag_relationships(memory, &candidates)),
            ("temporal", self.temporal_relationships(memory, &candidates)),
        ];
        for (signal, result) in signals {
            match result {
                Ok(edges) => relationships.extend(edges),
                Err(e) => warn!("{} relationship detection failed for {}: {}", signal, memory.id, e),
            }
        }

        Ok(rank_and_cap(relationships, self.config.max_relationships_per_memory))
    }

    async fn find_candidates(
        &self,
        memory: &Memory,
        embedding: &[f32],
    ) -> Result<Vec<ScoredPoint>, DetectError> {
        let project = if self.config.scope_by_project {
            memory.project_id.as_ref()
        } else {
            None
        };
        let filter = SearchFilter::scoped(&memory.user_id, project);

        let mut candidates = self
            .store
            .search(
                embedding,
                &filter,
                // One extra slot in case the memory itself is indexed already.
                self.config.max_similar_memories_to_check + 1,
                CANDIDATE_SCORE_THRESHOLD,
            )
            .await?;
        candidates.retain(|candidate| candidate.id != memory.id.0);
        candidates.truncate(self.config.max_similar_memories_to_check);
        Ok(candidates)
    }

    fn semantic_relationships(
        &self,
        memory: &Memory,
        candidates: &[ScoredPoint],
    ) -> Result<Vec<Relationship>, DetectError> {
        Ok(candidates
            .iter()
            .filter(|c| c.score >= self.config.semantic_similarity_threshold)
            .map(|c| {
                Relationship::new(
                    memory.id.clone(),
                    MemoryId(c.id.clone()),
                    c.score,
                    RelationshipMetadata::SemanticSimilarity {
                        similarity_score: c.score,
                    },
                )
            })
            .collect())
    }

    fn topic_relationships(
        &self,
        memory: &Memory,
        candidates: &[ScoredPoint],
    ) -> Result<Vec<Relationship>, DetectError> {
        let Some(topic) = memory.topic.as_deref().map(str::trim).filter(|t| !t.is_empty()) else {
            return Ok(Vec::new());
        };

        let mut edges = Vec::new();
        for candidate in candidates {
            let other = match candidate.payload.get(payload_keys::TOPIC) {
                None | Some(Value::Null) => continue,
                Some(Value::String(other)) => other,
                Some(other) => return Err(invalid(candidate, payload_keys::TOPIC, other)),
            };
            if other.trim().eq_ignore_ascii_case(topic) {
                edges.push(Relationship::new(
                    memory.id.clone(),
                    MemoryId(candidate.id.clone()),
                    self.config.topic_overlap_threshold,
                    RelationshipMetadata::TopicOverlap {
                        topic: topic.to_string(),
                    },
                ));
            }
        }
        Ok(edges)
    }

    fn tag_relationships(
        &self,
        memory: &Memory,
        candidates: &[ScoredPoint],
    ) -> Result<Vec<Relationship>, DetectError> {
        let mut edges = Vec::new();
        for candidate in candidates {
            let tags = candidate_tags(candidate)?;
            let jaccard = jaccard_similarity(&memory.tags, &tags);
            if jaccard > 0.0 && jaccard >= self.config.tag_similarity_threshold {
                edges.push(Relationship::new(
                    memory.id.clone(),
                    MemoryId(candidate.id.clone()),
                    jaccard,
                    RelationshipMetadata::TagSimilarity {
                        shared_tags: memory.tags.intersection(&tags).cloned().collect(),
                        jaccard,
                    },
                ));
            }
        }
        Ok(edges)
    }

    fn temporal_relationships(
        &self,
        memory: &Memory,
        candidates: &[ScoredPoint],
    ) -> Result<Vec<Relationship>, DetectError> {
        let mut edges = Vec::new();
        for candidate in candidates {
            let Some(created_at) = candidate_created_at(candidate)? else {
                continue;
            };
            let delta = (memory.created_at - created_at).abs();
            let Ok(delta) = delta.to_std() else {
                continue;
            };
            if let Some(strength) = temporal_strength(delta, self.config.temporal_proximity_window) {
                edges.push(Relationship::new(
                    memory.id.clone(),
                    MemoryId(candidate.id.clone()),
                    strength,
                    RelationshipMetadata::TemporalProximity {
                        time_diff_hours: delta.as_secs_f64() / 3600.0,
                    },
                ));
            }
        }
        Ok(edges)
    }
}

/// |A ∩ B| / |A ∪ B|; two empty sets score 0.
pub fn jaccard_similarity(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / union as f32
}

/// exp(-Δt / (window / 3)) inside the window, `None` outside it or when the
/// strength does not exceed `MIN_TEMPORAL_STRENGTH`.
pub fn temporal_strength(delta: Duration, window: Duration) -> Option<f32> {
    if window.is_zero() || delta > window {
        return None;
    }
    let scale = window.as_secs_f64() / 3.0;
    let strength = (-delta.as_secs_f64() / scale).exp() as f32;
    (strength > MIN_TEMPORAL_STRENGTH).then_some(strength)
}

/// Stable sort, strongest first, then cap.
pub fn rank_and_cap(mut relationships: Vec<Relationship>, max: usize) -> Vec<Relationship> {
    relationships.sort_by(|a, b| b.strength.total_cmp(&a.strength));
    relationships.truncate(max);
    relationships
}

fn candidate_tags(candidate: &ScoredPoint) -> Result<BTreeSet<String>, DetectError> {
    match candidate.payload.get(payload_keys::TAGS) {
        None | Some(Value::Null) => Ok(BTreeSet::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(tag) => Ok(tag.clone()),
                other => Err(invalid(candidate, payload_keys::TAGS, other)),
            })
            .collect(),
        Some(other) => Err(invalid(candidate, payload_keys::TAGS, other)),
    }
}

fn candidate_created_at(candidate: &ScoredPoint) -> Result<Option<DateTime<Utc>>, DetectError> {
    match candidate.payload.get(payload_keys::CREATED_AT) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => DateTime::parse_from_rfc3339(raw)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|e| DetectError::InvalidPayload {
                candidate: candidate.id.clone(),
                field: payload_keys::CREATED_AT,
                reason: e.to_string(),
            }),
        Some(other) => Err(invalid(candidate, payload_keys::CREATED_AT, other)),
    }
}

fn invalid(candidate: &ScoredPoint, field: &'static str, value: &Value) -> DetectError {
    DetectError::InvalidPayload {
        candidate: candidate.id.clone(),
        field,
        reason: format!("unexpected value {}", value),
    }
}
