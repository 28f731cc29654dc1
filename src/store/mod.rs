//! Storage abstraction for the knowledge base.
//!
//! The [`KnowledgeStore`] trait covers every read and write the pipeline,
//! job layer, router and HTTP surface perform against entities, detail
//! records and checkpoints. Two backends implement it:
//!
//! - [`sqlite::SqliteStore`]: the persistent backend used by the binary.
//! - [`memory::InMemoryStore`]: `RwLock`-guarded maps for tests and
//!   embedding the core without a database.
//!
//! Both backends also implement
//! [`DocumentSource`](crate::documents::DocumentSource) over their document
//! tables.
//!
//! # Write discipline
//!
//! | Method | Semantics |
//! |--------|-----------|
//! | [`put_entity`](KnowledgeStore::put_entity) | insert once; duplicate ids are rejected |
//! | [`append_detail`](KnowledgeStore::append_detail) | append one row; serialized per parent |
//! | [`update_entity_fields`](KnowledgeStore::update_entity_fields) | patch named fields only |
//! | [`set_checkpoint`](KnowledgeStore::set_checkpoint) | `MAX(old, new)`; never moves backwards |

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{Checkpoint, DetailRecord, Entity, EntityFilter, EntityKind, EntityPatch};

/// An entity returned from similarity search, with its cosine score.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredEntity {
    pub entity: Entity,
    pub score: f32,
}

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Insert a new entity, optionally with the embedding of its text.
    async fn put_entity(&self, entity: &Entity, vector: Option<&[f32]>) -> Result<()>;

    /// Entities of one kind for a project, oldest first.
    async fn get_entities(
        &self,
        project_id: &str,
        kind: EntityKind,
        filter: &EntityFilter,
    ) -> Result<Vec<Entity>>;

    async fn get_entity(&self, id: &str) -> Result<Option<Entity>>;

    /// Append one detail record under `parent_id`.
    ///
    /// Returns `false` without writing when the parent already holds a
    /// record from the same source document. Calls for the same parent
    /// are serialized; calls for different parents may interleave.
    async fn append_detail(&self, parent_id: &str, detail: &DetailRecord) -> Result<bool>;

    /// Detail records for an entity in append order.
    async fn get_details(&self, parent_id: &str) -> Result<Vec<DetailRecord>>;

    /// Apply a partial update. Returns `false` if the entity does not exist.
    async fn update_entity_fields(&self, id: &str, patch: &EntityPatch) -> Result<bool>;

    /// Cosine search over stored entity vectors of one kind.
    ///
    /// Results are ordered by score descending, then `created_at`
    /// ascending. Entities introduced by `exclude_document` are skipped.
    async fn vector_search_entities(
        &self,
        project_id: &str,
        kind: EntityKind,
        query: &[f32],
        limit: usize,
        exclude_document: Option<&str>,
    ) -> Result<Vec<ScoredEntity>>;

    async fn get_checkpoint(&self, project_id: &str, kind: EntityKind)
        -> Result<Option<Checkpoint>>;

    /// Advance the watermark to `max(current, at)` and return the stored value.
    async fn set_checkpoint(
        &self,
        project_id: &str,
        kind: EntityKind,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>>;
}

/// Per-parent async mutexes used to serialize detail appends.
///
/// An entry lives only while some task holds or waits on it.
#[derive(Default)]
pub(crate) struct ParentLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ParentLocks {
    /// Wait for exclusive access to `parent_id`.
    pub(crate) async fn acquire(&self, parent_id: &str) -> ParentGuard<'_> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(parent_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        ParentGuard {
            locks: self,
            parent_id: parent_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    fn release(&self, parent_id: &str) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map's own handle left: nobody holds or waits on it.
        if map
            .get(parent_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(parent_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

pub(crate) struct ParentGuard<'a> {
    locks: &'a ParentLocks,
    parent_id: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for ParentGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.release(&self.parent_id);
    }
}

/// Order scored entities by score descending, then oldest first, then id.
pub(crate) fn rank_scored(scored: &mut [ScoredEntity]) {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.entity.created_at.cmp(&b.entity.created_at))
            .then_with(|| a.entity.id.cmp(&b.entity.id))
    });
}
