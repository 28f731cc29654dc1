//! Incremental update pipeline.
//!
//! One run for a `(project, agent kind)` pair:
//!
//! ```text
//! new_documents ──► for each doc (oldest first)
//!                     extract ──► embed candidate ──► match?
//!                                                   ├─ yes: append_detail(parent)
//!                                                   └─ no:  put_entity
//!               ──► completion recompute (tasks only)
//!               ──► checkpoint = max(created_at) if any doc succeeded
//! ```
//!
//! Per-document failures are recorded in the [`RunSummary`] and the run
//! continues with the next document. Entities and details already written
//! by a failed run stay in place; a retry recognizes them by source document
//! and does not write them again.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::changes::new_documents;
use crate::completion::{CompletionEvaluator, CompletionReport};
use crate::config::Config;
use crate::documents::DocumentSource;
use crate::embedding::{create_embedder, Embedder};
use crate::error::PipelineError;
use crate::extract::{DecodePath, EntityExtractor};
use crate::jobs::JobRunner;
use crate::llm::{create_language_model, LanguageModel};
use crate::models::{DetailRecord, Document, Entity, EntityFilter, EntityKind};
use crate::store::sqlite::SqliteStore;
use crate::store::KnowledgeStore;
use crate::{db, migrate};

/// The collaborators a pipeline run talks to.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn KnowledgeStore>,
    pub documents: Arc<dyn DocumentSource>,
    pub llm: Arc<dyn LanguageModel>,
    pub embedder: Arc<dyn Embedder>,
}

impl Services {
    /// Connect to the configured database (migrating it) and build providers.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        let sqlite = Arc::new(SqliteStore::new(pool));

        Ok(Self {
            store: sqlite.clone(),
            documents: sqlite,
            llm: create_language_model(&config.llm)?,
            embedder: create_embedder(&config.embedding)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedDocument {
    pub document_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub project_id: String,
    pub agent_kind: EntityKind,
    pub had_checkpoint: bool,
    pub documents_seen: usize,
    pub processed_documents: Vec<String>,
    pub failed_documents: Vec<FailedDocument>,
    pub entities_created: usize,
    pub details_attached: usize,
    /// Matches whose (entity, document) detail already existed.
    pub details_ignored: usize,
    /// Candidates already stored as entities by an earlier run over the same document.
    pub entities_existing: usize,
    pub strict_decodes: usize,
    pub lenient_decodes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_advanced_to: Option<DateTime<Utc>>,
}

impl RunSummary {
    fn new(project_id: &str, kind: EntityKind, had_checkpoint: bool, seen: usize) -> Self {
        Self {
            project_id: project_id.to_string(),
            agent_kind: kind,
            had_checkpoint,
            documents_seen: seen,
            processed_documents: Vec::new(),
            failed_documents: Vec::new(),
            entities_created: 0,
            details_attached: 0,
            details_ignored: 0,
            entities_existing: 0,
            strict_decodes: 0,
            lenient_decodes: 0,
            completion: None,
            checkpoint_advanced_to: None,
        }
    }
}

#[derive(Default)]
struct DocumentStats {
    created: usize,
    attached: usize,
    ignored: usize,
    existing: usize,
}

pub struct Pipeline {
    services: Services,
    extractor: EntityExtractor,
    evaluator: CompletionEvaluator,
}

impl Pipeline {
    pub fn new(services: Services, config: &Config) -> Self {
        let extractor = EntityExtractor::new(
            services.store.clone(),
            services.documents.clone(),
            services.llm.clone(),
            services.embedder.clone(),
            config.extraction.clone(),
        );
        let evaluator = CompletionEvaluator::new(
            services.store.clone(),
            services.documents.clone(),
            services.llm.clone(),
            services.embedder.clone(),
            config.completion.clone(),
        );
        Self {
            services,
            extractor,
            evaluator,
        }
    }

    pub async fn run(&self, project_id: &str, kind: EntityKind) -> Result<RunSummary> {
        let store = self.services.store.as_ref();
        let batch = new_documents(store, self.services.documents.as_ref(), project_id, kind).await?;
        let mut summary = RunSummary::new(
            project_id,
            kind,
            batch.had_checkpoint,
            batch.documents.len(),
        );

        if batch.documents.is_empty() {
            tracing::info!(project_id, agent_kind = %kind, "no new documents");
            return Ok(summary);
        }

        tracing::info!(
            project_id,
            agent_kind = %kind,
            documents = batch.documents.len(),
            had_checkpoint = batch.had_checkpoint,
            "pipeline run started"
        );

        for doc in &batch.documents {
            match self.process_document(project_id, doc, kind, &mut summary).await {
                Ok(stats) => {
                    summary.entities_created += stats.created;
                    summary.details_attached += stats.attached;
                    summary.details_ignored += stats.ignored;
                    summary.entities_existing += stats.existing;
                    summary.processed_documents.push(doc.id.clone());
                }
                Err(err) => {
                    tracing::warn!(
                        project_id,
                        agent_kind = %kind,
                        document_id = %doc.id,
                        error = %err,
                        "document skipped"
                    );
                    summary.failed_documents.push(FailedDocument {
                        document_id: doc.id.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        if kind == EntityKind::Task {
            let report = self
                .evaluator
                .recompute(project_id)
                .await
                .context("completion recompute failed")?;
            summary.completion = Some(report);
        }

        if !summary.processed_documents.is_empty() {
            // Partial batches still advance past every attempted document.
            let newest = batch
                .documents
                .iter()
                .map(|d| d.created_at)
                .max()
                .context("non-empty batch has no timestamps")?;
            let stored = store.set_checkpoint(project_id, kind, newest).await?;
            tracing::info!(project_id, agent_kind = %kind, checkpoint = %stored, "checkpoint advanced");
            summary.checkpoint_advanced_to = Some(stored);
        }

        tracing::info!(
            project_id,
            agent_kind = %kind,
            processed = summary.processed_documents.len(),
            failed = summary.failed_documents.len(),
            entities_created = summary.entities_created,
            details_attached = summary.details_attached,
            "pipeline run finished"
        );
        Ok(summary)
    }

    async fn process_document(
        &self,
        project_id: &str,
        doc: &Document,
        kind: EntityKind,
        summary: &mut RunSummary,
    ) -> Result<DocumentStats, PipelineError> {
        let outcome = self.extractor.extract(project_id, &doc.id, kind).await?;
        match outcome.decode_path {
            DecodePath::Strict => summary.strict_decodes += 1,
            DecodePath::Lenient => summary.lenient_decodes += 1,
        }

        let store = &self.services.store;
        let mut stats = DocumentStats::default();
        let own_filter = EntityFilter {
            source_document_id: Some(doc.id.clone()),
            ..Default::default()
        };
        let mut already_stored = store
            .get_entities(project_id, kind, &own_filter)
            .await
            .map_err(PipelineError::storage)?;

        for candidate in outcome.candidates {
            if let Some(existing) = find_same_text(&already_stored, &candidate.text) {
                tracing::debug!(entity_id = %existing.id, document_id = %doc.id, "candidate already stored");
                stats.existing += 1;
                continue;
            }

            let vector = match self.services.embedder.embed(&candidate.text).await {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(document_id = %doc.id, error = %e, "candidate not embedded; stored without match");
                    None
                }
            };

            let hit = match &vector {
                Some(v) => self
                    .extractor
                    .match_vector(project_id, kind, v, Some(&doc.id))
                    .await
                    .map_err(PipelineError::storage)?,
                None => None,
            };

            let now = Utc::now();
            match hit {
                Some(hit) => {
                    let detail = DetailRecord {
                        id: uuid::Uuid::new_v4().to_string(),
                        parent_entity_id: hit.entity.id.clone(),
                        project_id: project_id.to_string(),
                        source_document_id: doc.id.clone(),
                        text: candidate.text,
                        created_at: now,
                    };
                    let appended = store
                        .append_detail(&hit.entity.id, &detail)
                        .await
                        .map_err(PipelineError::storage)?;
                    if appended {
                        tracing::debug!(entity_id = %hit.entity.id, document_id = %doc.id, score = hit.score, "detail attached");
                        stats.attached += 1;
                    } else {
                        stats.ignored += 1;
                    }
                }
                None => {
                    let entity = candidate.into_entity(
                        uuid::Uuid::new_v4().to_string(),
                        project_id,
                        &doc.id,
                        now,
                    );
                    store
                        .put_entity(&entity, vector.as_deref())
                        .await
                        .map_err(PipelineError::storage)?;
                    stats.created += 1;
                    already_stored.push(entity);
                }
            }
        }

        Ok(stats)
    }
}

/// Entity from the same document whose text matches `text`, ignoring case and
/// surrounding whitespace.
fn find_same_text<'a>(entities: &'a [Entity], text: &str) -> Option<&'a Entity> {
    let wanted = text.trim();
    entities
        .iter()
        .find(|e| e.text.trim().eq_ignore_ascii_case(wanted))
}

#[async_trait]
impl JobRunner for Pipeline {
    async fn run(&self, project_id: &str, kind: EntityKind) -> Result<serde_json::Value> {
        let summary = Pipeline::run(self, project_id, kind).await?;
        Ok(serde_json::to_value(summary)?)
    }
}
