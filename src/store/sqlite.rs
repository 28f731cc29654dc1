//! SQLite-backed [`KnowledgeStore`] and [`DocumentSource`].
//!
//! Maps each operation onto the schema created by
//! [`migrate::apply`](crate::migrate::apply). Timestamps are Unix
//! milliseconds; vectors are little-endian f32 BLOBs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::documents::DocumentSource;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{
    Checkpoint, ContextChunk, DetailRecord, Document, Entity, EntityFilter, EntityKind, EntityPatch,
    KindFields,
};

use super::{rank_scored, KnowledgeStore, ParentLocks, ScoredEntity};

const ENTITY_COLUMNS: &str = "id, project_id, kind, text, category, priority, source_document_id, \
     created_at, deadline, impact, completion_status, final_completion_status, completion_fraction";

pub struct SqliteStore {
    pool: SqlitePool,
    locks: ParentLocks,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            locks: ParentLocks::default(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Write a document and its chunks, as the upload side does.
    pub async fn insert_document(&self, doc: &Document, chunks: &[ContextChunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, project_id, created_at) VALUES (?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.project_id)
        .bind(doc.created_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        for chunk in chunks {
            let blob = if chunk.vector.is_empty() {
                None
            } else {
                Some(vec_to_blob(&chunk.vector))
            };
            sqlx::query(
                r#"
                INSERT INTO document_chunks (document_id, chunk_index, text, embedding)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(document_id, chunk_index) DO UPDATE SET
                    text = excluded.text,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&doc.id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(blob)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn row_to_entity(row: &SqliteRow) -> Result<Entity> {
    let kind: String = row.get("kind");
    let kind: EntityKind = kind.parse()?;
    let fields = match kind {
        EntityKind::Milestone => KindFields::Milestone {
            deadline: row.get("deadline"),
        },
        EntityKind::Task => KindFields::Task {
            completion_status: row.get::<Option<i64>, _>("completion_status").unwrap_or(0) != 0,
            final_completion_status: row
                .get::<Option<i64>, _>("final_completion_status")
                .map(|v| v != 0),
            completion_fraction: row.get("completion_fraction"),
        },
        EntityKind::Bottleneck => KindFields::Bottleneck {
            impact: row.get("impact"),
        },
    };

    Ok(Entity {
        id: row.get("id"),
        project_id: row.get("project_id"),
        text: row.get("text"),
        category: row.get("category"),
        priority: row.get("priority"),
        source_document_id: row.get("source_document_id"),
        created_at: from_millis(row.get("created_at")),
        fields,
    })
}

fn row_to_detail(row: &SqliteRow) -> DetailRecord {
    DetailRecord {
        id: row.get("id"),
        parent_entity_id: row.get("parent_entity_id"),
        project_id: row.get("project_id"),
        source_document_id: row.get("source_document_id"),
        text: row.get("text"),
        created_at: from_millis(row.get("created_at")),
    }
}

#[async_trait]
impl KnowledgeStore for SqliteStore {
    async fn put_entity(&self, entity: &Entity, vector: Option<&[f32]>) -> Result<()> {
        let (deadline, impact, completion_status, final_status, fraction) = match &entity.fields {
            KindFields::Milestone { deadline } => (deadline.clone(), None, None, None, None),
            KindFields::Bottleneck { impact } => (None, impact.clone(), None, None, None),
            KindFields::Task {
                completion_status,
                final_completion_status,
                completion_fraction,
            } => (
                None,
                None,
                Some(*completion_status as i64),
                final_completion_status.map(|v| v as i64),
                *completion_fraction,
            ),
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO entities ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            ENTITY_COLUMNS
        ))
        .bind(&entity.id)
        .bind(&entity.project_id)
        .bind(entity.kind().as_str())
        .bind(&entity.text)
        .bind(&entity.category)
        .bind(&entity.priority)
        .bind(&entity.source_document_id)
        .bind(entity.created_at.timestamp_millis())
        .bind(deadline)
        .bind(impact)
        .bind(completion_status)
        .bind(final_status)
        .bind(fraction)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to insert entity {}", entity.id))?;

        if let Some(vec) = vector {
            sqlx::query(
                r#"
                INSERT INTO entity_vectors (entity_id, embedding) VALUES (?, ?)
                ON CONFLICT(entity_id) DO UPDATE SET embedding = excluded.embedding
                "#,
            )
            .bind(&entity.id)
            .bind(vec_to_blob(vec))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_entities(
        &self,
        project_id: &str,
        kind: EntityKind,
        filter: &EntityFilter,
    ) -> Result<Vec<Entity>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM entities
            WHERE project_id = ? AND kind = ?
              AND (? IS NULL OR category = ? COLLATE NOCASE)
              AND (? IS NULL OR priority = ? COLLATE NOCASE)
              AND (? IS NULL OR source_document_id = ?)
            ORDER BY created_at ASC, id ASC
            "#,
            ENTITY_COLUMNS
        ))
        .bind(project_id)
        .bind(kind.as_str())
        .bind(&filter.category)
        .bind(&filter.category)
        .bind(&filter.priority)
        .bind(&filter.priority)
        .bind(&filter.source_document_id)
        .bind(&filter.source_document_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_entity).collect()
    }

    async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        let row = sqlx::query(&format!("SELECT {} FROM entities WHERE id = ?", ENTITY_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_entity).transpose()
    }

    async fn append_detail(&self, parent_id: &str, detail: &DetailRecord) -> Result<bool> {
        let _guard = self.locks.acquire(parent_id).await;

        // seq is assigned inside the insert; no separate read transaction.
        let result = sqlx::query(
            r#"
            INSERT INTO entity_details
                (id, parent_entity_id, project_id, source_document_id, text, created_at, seq)
            SELECT ?, ?, ?, ?, ?, ?, COALESCE(MAX(seq), 0) + 1
            FROM entity_details
            WHERE parent_entity_id = ?
            ON CONFLICT(parent_entity_id, source_document_id) DO NOTHING
            "#,
        )
        .bind(&detail.id)
        .bind(parent_id)
        .bind(&detail.project_id)
        .bind(&detail.source_document_id)
        .bind(&detail.text)
        .bind(detail.created_at.timestamp_millis())
        .bind(parent_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_details(&self, parent_id: &str) -> Result<Vec<DetailRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, parent_entity_id, project_id, source_document_id, text, created_at
            FROM entity_details
            WHERE parent_entity_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_detail).collect())
    }

    async fn update_entity_fields(&self, id: &str, patch: &EntityPatch) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE entities SET
                category = COALESCE(?, category),
                priority = COALESCE(?, priority),
                final_completion_status = CASE WHEN kind = 'task'
                    THEN COALESCE(?, final_completion_status)
                    ELSE final_completion_status END,
                completion_fraction = CASE WHEN kind = 'task'
                    THEN COALESCE(?, completion_fraction)
                    ELSE completion_fraction END
            WHERE id = ?
            "#,
        )
        .bind(&patch.category)
        .bind(&patch.priority)
        .bind(patch.final_completion_status.map(|v| v as i64))
        .bind(patch.completion_fraction)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn vector_search_entities(
        &self,
        project_id: &str,
        kind: EntityKind,
        query: &[f32],
        limit: usize,
        exclude_document: Option<&str>,
    ) -> Result<Vec<ScoredEntity>> {
        let columns = ENTITY_COLUMNS
            .split(", ")
            .map(|c| format!("e.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}, v.embedding
            FROM entities e
            JOIN entity_vectors v ON v.entity_id = e.id
            WHERE e.project_id = ? AND e.kind = ?
              AND (? IS NULL OR e.source_document_id != ?)
            "#,
            columns
        ))
        .bind(project_id)
        .bind(kind.as_str())
        .bind(exclude_document)
        .bind(exclude_document)
        .fetch_all(&self.pool)
        .await?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let score = cosine_similarity(query, &blob_to_vec(&blob));
            scored.push(ScoredEntity {
                entity: row_to_entity(row)?,
                score,
            });
        }
        rank_scored(&mut scored);
        scored.truncate(limit);
        Ok(scored)
    }

    async fn get_checkpoint(
        &self,
        project_id: &str,
        kind: EntityKind,
    ) -> Result<Option<Checkpoint>> {
        let at: Option<i64> = sqlx::query_scalar(
            "SELECT last_update_at FROM checkpoints WHERE project_id = ? AND agent_kind = ?",
        )
        .bind(project_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(at.map(|ms| Checkpoint {
            project_id: project_id.to_string(),
            agent_kind: kind,
            last_update_at: from_millis(ms),
        }))
    }

    async fn set_checkpoint(
        &self,
        project_id: &str,
        kind: EntityKind,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let stored: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO checkpoints (project_id, agent_kind, last_update_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(project_id, agent_kind) DO UPDATE SET
                last_update_at = MAX(checkpoints.last_update_at, excluded.last_update_at),
                updated_at = excluded.updated_at
            RETURNING last_update_at
            "#,
        )
        .bind(project_id)
        .bind(kind.as_str())
        .bind(at.timestamp_millis())
        .bind(Utc::now().timestamp_millis())
        .fetch_one(&self.pool)
        .await?;

        Ok(from_millis(stored))
    }
}

#[async_trait]
impl DocumentSource for SqliteStore {
    async fn list(&self, project_id: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT id, project_id, created_at FROM documents WHERE project_id = ? ORDER BY created_at, id",
        )
            .bind(project_id)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("failed to list documents for project {}", project_id))?;

        Ok(rows
            .iter()
            .map(|row| Document {
                id: row.get("id"),
                project_id: row.get("project_id"),
                created_at: from_millis(row.get("created_at")),
            })
            .collect())
    }

    async fn context(&self, project_id: &str, document_id: &str) -> Result<Vec<ContextChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT c.chunk_index, c.text, c.embedding
            FROM document_chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE d.project_id = ? AND c.document_id = ? AND c.embedding IS NOT NULL
            ORDER BY c.chunk_index ASC
            "#,
        )
        .bind(project_id)
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                ContextChunk {
                    chunk_index: row.get("chunk_index"),
                    text: row.get("text"),
                    vector: blob_to_vec(&blob),
                }
            })
            .collect())
    }
}
