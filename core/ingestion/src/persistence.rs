use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use memory_graph_schemas::{MemoryId, Relationship, RelationshipType};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Durable home for detected relationships.
#[async_trait]
pub trait RelationshipStore: Send + Sync {
    /// Replaces every relationship whose source is `source_id`.
    async fn save_relationships(
        &self,
        source_id: &MemoryId,
        relationships: &[Relationship],
    ) -> Result<()>;

    /// Relationships from `source_id`, strongest first.
    async fn relationships_for(&self, source_id: &MemoryId) -> Result<Vec<Relationship>>;
}

pub struct SqliteRelationshipStore {
    conn: Mutex<Connection>,
}

impl SqliteRelationshipStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        info!("Relationship store initialized");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Relationships pointing at `target_id`, strongest first.
    pub async fn relationships_to(&self, target_id: &MemoryId) -> Result<Vec<Relationship>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT source_id, target_id, relationship_type, strength, metadata, extensions, created_at
             FROM relationships
             WHERE target_id = ?1
             ORDER BY strength DESC, source_id ASC",
        )?;
        let relationships = stmt
            .query_map(params![target_id.0], relationship_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(relationships)
    }

    pub async fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM relationships", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS relationships (
            source_id TEXT NOT NULL,
            target_id TEXT NOT NULL,
            relationship_type TEXT NOT NULL,
            position INTEGER NOT NULL,
            strength REAL NOT NULL,
            metadata TEXT NOT NULL,
            extensions TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            PRIMARY KEY (source_id, position)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_relationships_target ON relationships(target_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_relationships_type ON relationships(relationship_type)",
        [],
    )?;
    Ok(())
}

#[async_trait]
impl RelationshipStore for SqliteRelationshipStore {
    async fn save_relationships(
        &self,
        source_id: &MemoryId,
        relationships: &[Relationship],
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM relationships WHERE source_id = ?1",
            params![source_id.0],
        )?;
        for (position, relationship) in relationships.iter().enumerate() {
            tx.execute(
                "INSERT INTO relationships
                 (source_id, target_id, relationship_type, position, strength, metadata, extensions, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    source_id.0,
                    relationship.target_id.0,
                    relationship.relationship_type.as_str(),
                    position as i64,
                    relationship.strength as f64,
                    serde_json::to_string(&relationship.metadata)?,
                    serde_json::to_string(&relationship.extensions)?,
                    relationship.created_at.to_rfc3339(),
                ],
            )?;
        }
        tx.commit()?;

        debug!(
            "Stored {} relationships for {}",
            relationships.len(),
            source_id
        );
        Ok(())
    }

    async fn relationships_for(&self, source_id: &MemoryId) -> Result<Vec<Relationship>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT source_id, target_id, relationship_type, strength, metadata, extensions, created_at
             FROM relationships
             WHERE source_id = ?1
             ORDER BY position ASC",
        )?;
        let relationships = stmt
            .query_map(params![source_id.0], relationship_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(relationships)
    }
}

fn relationship_from_row(row: &Row<'_>) -> rusqlite::Result<Relationship> {
    let type_str: String = row.get(2)?;
    let relationship_type = RelationshipType::parse(&type_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            Type::Text,
            format!("unknown relationship type {}", type_str).into(),
        )
    })?;
    let strength: f64 = row.get(3)?;
    let metadata: String = row.get(4)?;
    let extensions: String = row.get(5)?;
    let created_at: String = row.get(6)?;

    Ok(Relationship {
        source_id: MemoryId(row.get(0)?),
        target_id: MemoryId(row.get(1)?),
        relationship_type,
        strength: strength as f32,
        metadata: serde_json::from_str(&metadata).map_err(|e| json_error(4, e))?,
        extensions: serde_json::from_str(&extensions).map_err(|e| json_error(5, e))?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e))
            })?,
    })
}

fn json_error(column: usize, err: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory_graph_schemas::RelationshipMetadata;
    use serde_json::json;
    use tempfile::TempDir;

    fn edge(source: &str, target: &str, strength: f32) -> Relationship {
        Relationship::new(
            MemoryId(source.into()),
            MemoryId(target.into()),
            strength,
            RelationshipMetadata::TagSimilarity {
                shared_tags: vec!["rust".into()],
                jaccard: strength,
            },
        )
    }

    #[tokio::test]
    async fn test_save_and_load_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("relationships.db");
        let source = MemoryId("mem_a".into());

        {
            let store = SqliteRelationshipStore::new(&db_path).unwrap();
            let mut first = edge("mem_a", "mem_b", 0.9);
            first.extensions.insert("origin".into(), json!("test"));
            store
                .save_relationships(&source, &[first, edge("mem_a", "mem_c", 0.4)])
                .await
                .unwrap();
        }

        let reopened = SqliteRelationshipStore::new(&db_path).unwrap();
        let loaded = reopened.relationships_for(&source).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].target_id.0, "mem_b");
        assert_eq!(loaded[0].relationship_type, RelationshipType::TagSimilarity);
        assert!((loaded[0].strength - 0.9).abs() < 1e-6);
        assert_eq!(loaded[0].extensions["origin"], json!("test"));
        assert_eq!(loaded[1].target_id.0, "mem_c");
    }

    #[tokio::test]
    async fn test_save_replaces_previous_set() {
        let store = SqliteRelationshipStore::in_memory().unwrap();
        let source = MemoryId("mem_a".into());

        store
            .save_relationships(&source, &[edge("mem_a", "mem_b", 0.9), edge("mem_a", "mem_c", 0.8)])
            .await
            .unwrap();
        store
            .save_relationships(&source, &[edge("mem_a", "mem_d", 0.7)])
            .await
            .unwrap();

        let loaded = store.relationships_for(&source).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].target_id.0, "mem_d");
        assert_eq!(store.count().await.unwrap(), 1);

        let incoming = store.relationships_to(&MemoryId("mem_d".into())).await.unwrap();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].source_id, source);
    }
}
