//! In-memory [`KnowledgeStore`] and [`DocumentSource`] for tests.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. Vector search is
//! brute-force cosine similarity over all stored entity vectors.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::documents::DocumentSource;
use crate::embedding::cosine_similarity;
use crate::models::{
    Checkpoint, ContextChunk, DetailRecord, Document, Entity, EntityFilter, EntityKind, EntityPatch,
};

use super::{rank_scored, KnowledgeStore, ParentLocks, ScoredEntity};

struct StoredEntity {
    entity: Entity,
    vector: Option<Vec<f32>>,
}

struct StoredDoc {
    doc: Document,
    chunks: Vec<ContextChunk>,
}

pub struct InMemoryStore {
    docs: RwLock<HashMap<String, StoredDoc>>,
    entities: RwLock<Vec<StoredEntity>>,
    details: RwLock<HashMap<String, Vec<DetailRecord>>>,
    checkpoints: RwLock<HashMap<(String, EntityKind), DateTime<Utc>>>,
    locks: ParentLocks,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            entities: RwLock::new(Vec::new()),
            details: RwLock::new(HashMap::new()),
            checkpoints: RwLock::new(HashMap::new()),
            locks: ParentLocks::default(),
        }
    }

    /// Register a document and its embedded chunks (empty for "not embedded yet").
    pub fn add_document(&self, doc: Document, chunks: Vec<ContextChunk>) {
        let mut docs = self.docs.write().unwrap_or_else(|e| e.into_inner());
        docs.insert(doc.id.clone(), StoredDoc { doc, chunks });
    }

    /// Replace the chunks of an existing document.
    pub fn set_chunks(&self, document_id: &str, chunks: Vec<ContextChunk>) {
        let mut docs = self.docs.write().unwrap_or_else(|e| e.into_inner());
        if let Some(stored) = docs.get_mut(document_id) {
            stored.chunks = chunks;
        }
    }

    pub fn entity_count(&self) -> usize {
        self.entities.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn detail_count(&self) -> usize {
        self.details
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(Vec::len)
            .sum()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryStore {
    async fn put_entity(&self, entity: &Entity, vector: Option<&[f32]>) -> Result<()> {
        let mut entities = self.entities.write().unwrap_or_else(|e| e.into_inner());
        if entities.iter().any(|s| s.entity.id == entity.id) {
            bail!("entity {} already exists", entity.id);
        }
        entities.push(StoredEntity {
            entity: entity.clone(),
            vector: vector.map(<[f32]>::to_vec),
        });
        Ok(())
    }

    async fn get_entities(
        &self,
        project_id: &str,
        kind: EntityKind,
        filter: &EntityFilter,
    ) -> Result<Vec<Entity>> {
        let entities = self.entities.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<Entity> = entities
            .iter()
            .map(|s| &s.entity)
            .filter(|e| e.project_id == project_id && e.kind() == kind && filter.matches(e))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        let entities = self.entities.read().unwrap_or_else(|e| e.into_inner());
        Ok(entities
            .iter()
            .find(|s| s.entity.id == id)
            .map(|s| s.entity.clone()))
    }

    async fn append_detail(&self, parent_id: &str, detail: &DetailRecord) -> Result<bool> {
        let _guard = self.locks.acquire(parent_id).await;

        let mut details = self.details.write().unwrap_or_else(|e| e.into_inner());
        let rows = details.entry(parent_id.to_string()).or_default();
        if rows
            .iter()
            .any(|d| d.source_document_id == detail.source_document_id)
        {
            return Ok(false);
        }
        let mut record = detail.clone();
        record.parent_entity_id = parent_id.to_string();
        rows.push(record);
        Ok(true)
    }

    async fn get_details(&self, parent_id: &str) -> Result<Vec<DetailRecord>> {
        let details = self.details.read().unwrap_or_else(|e| e.into_inner());
        Ok(details.get(parent_id).cloned().unwrap_or_default())
    }

    async fn update_entity_fields(&self, id: &str, patch: &EntityPatch) -> Result<bool> {
        let mut entities = self.entities.write().unwrap_or_else(|e| e.into_inner());
        match entities.iter_mut().find(|s| s.entity.id == id) {
            Some(stored) => {
                patch.apply(&mut stored.entity);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn vector_search_entities(
        &self,
        project_id: &str,
        kind: EntityKind,
        query: &[f32],
        limit: usize,
        exclude_document: Option<&str>,
    ) -> Result<Vec<ScoredEntity>> {
        let entities = self.entities.read().unwrap_or_else(|e| e.into_inner());
        let mut scored: Vec<ScoredEntity> = entities
            .iter()
            .filter(|s| s.entity.project_id == project_id && s.entity.kind() == kind)
            .filter(|s| exclude_document.map_or(true, |d| s.entity.source_document_id != d))
            .filter_map(|s| {
                s.vector.as_ref().map(|v| ScoredEntity {
                    entity: s.entity.clone(),
                    score: cosine_similarity(query, v),
                })
            })
            .collect();
        rank_scored(&mut scored);
        scored.truncate(limit);
        Ok(scored)
    }

    async fn get_checkpoint(
        &self,
        project_id: &str,
        kind: EntityKind,
    ) -> Result<Option<Checkpoint>> {
        let checkpoints = self.checkpoints.read().unwrap_or_else(|e| e.into_inner());
        Ok(checkpoints
            .get(&(project_id.to_string(), kind))
            .map(|at| Checkpoint {
                project_id: project_id.to_string(),
                agent_kind: kind,
                last_update_at: *at,
            }))
    }

    async fn set_checkpoint(
        &self,
        project_id: &str,
        kind: EntityKind,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let mut checkpoints = self.checkpoints.write().unwrap_or_else(|e| e.into_inner());
        let slot = checkpoints.entry((project_id.to_string(), kind)).or_insert(at);
        if at > *slot {
            *slot = at;
        }
        Ok(*slot)
    }
}

#[async_trait]
impl DocumentSource for InMemoryStore {
    async fn list(&self, project_id: &str) -> Result<Vec<Document>> {
        let docs = self.docs.read().unwrap_or_else(|e| e.into_inner());
        Ok(docs
            .values()
            .filter(|s| s.doc.project_id == project_id)
            .map(|s| s.doc.clone())
            .collect())
    }

    async fn context(&self, project_id: &str, document_id: &str) -> Result<Vec<ContextChunk>> {
        let docs = self.docs.read().unwrap_or_else(|e| e.into_inner());
        let mut chunks = docs
            .get(document_id)
            .filter(|s| s.doc.project_id == project_id)
            .map(|s| s.chunks.clone())
            .unwrap_or_default();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::KindFields;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn bottleneck(id: &str, doc: &str, at: i64) -> Entity {
        Entity {
            id: id.into(),
            project_id: "p".into(),
            text: format!("bottleneck {}", id),
            category: "General".into(),
            priority: "High".into(),
            source_document_id: doc.into(),
            created_at: ts(at),
            fields: KindFields::Bottleneck { impact: None },
        }
    }

    fn detail(doc: &str, text: &str) -> DetailRecord {
        DetailRecord {
            id: format!("det-{}", doc),
            parent_entity_id: String::new(),
            project_id: "p".into(),
            source_document_id: doc.into(),
            text: text.into(),
            created_at: ts(10),
        }
    }

    #[tokio::test]
    async fn details_append_in_order_and_ignore_repeats() {
        let store = InMemoryStore::new();
        store.put_entity(&bottleneck("b1", "d1", 1), None).await.unwrap();

        assert!(store.append_detail("b1", &detail("d2", "first")).await.unwrap());
        assert!(store.append_detail("b1", &detail("d3", "second")).await.unwrap());
        assert!(!store.append_detail("b1", &detail("d2", "again")).await.unwrap());

        let details = store.get_details("b1").await.unwrap();
        let texts: Vec<&str> = details.iter().map(|d| d.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second"]);
        assert!(details.iter().all(|d| d.parent_entity_id == "b1"));
    }

    #[tokio::test]
    async fn duplicate_entity_id_is_rejected() {
        let store = InMemoryStore::new();
        store.put_entity(&bottleneck("b1", "d1", 1), None).await.unwrap();
        assert!(store.put_entity(&bottleneck("b1", "d1", 1), None).await.is_err());
    }

    #[tokio::test]
    async fn checkpoint_never_moves_backwards() {
        let store = InMemoryStore::new();
        let kind = EntityKind::Task;
        assert!(store.get_checkpoint("p", kind).await.unwrap().is_none());
        assert_eq!(store.set_checkpoint("p", kind, ts(50)).await.unwrap(), ts(50));
        assert_eq!(store.set_checkpoint("p", kind, ts(20)).await.unwrap(), ts(50));
        assert!(store
            .get_checkpoint("p", EntityKind::Milestone)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn vector_search_skips_excluded_document_and_breaks_ties_by_age() {
        let store = InMemoryStore::new();
        store
            .put_entity(&bottleneck("late", "d2", 20), Some(&[1.0, 0.0]))
            .await
            .unwrap();
        store
            .put_entity(&bottleneck("early", "d1", 10), Some(&[1.0, 0.0]))
            .await
            .unwrap();
        store
            .put_entity(&bottleneck("same-doc", "d3", 5), Some(&[1.0, 0.0]))
            .await
            .unwrap();

        let hits = store
            .vector_search_entities("p", EntityKind::Bottleneck, &[1.0, 0.0], 10, Some("d3"))
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.entity.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_to_one_parent_keep_every_document_once() {
        let store = Arc::new(InMemoryStore::new());
        store.put_entity(&bottleneck("b1", "d0", 1), None).await.unwrap();

        let mut set = tokio::task::JoinSet::new();
        for i in 1..=24 {
            let store = store.clone();
            set.spawn(async move {
                let doc = format!("d{}", i);
                store.append_detail("b1", &detail(&doc, &doc)).await.unwrap()
            });
        }
        // Two racing writers for the same document: only one may land.
        for _ in 0..2 {
            let store = store.clone();
            set.spawn(async move { store.append_detail("b1", &detail("d-dup", "dup")).await.unwrap() });
        }

        let mut appended = 0;
        while let Some(res) = set.join_next().await {
            if res.unwrap() {
                appended += 1;
            }
        }
        assert_eq!(appended, 25);

        let details = store.get_details("b1").await.unwrap();
        assert_eq!(details.len(), 25);
        let dup = details.iter().filter(|d| d.source_document_id == "d-dup").count();
        assert_eq!(dup, 1);
    }
}
