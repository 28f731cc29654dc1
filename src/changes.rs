//! Document change detection.
//!
//! Compares a project's documents against the agent's checkpoint and
//! returns the ones that arrived since. Reads only; the checkpoint is
//! advanced by the pipeline after a run.

use anyhow::{Context, Result};

use crate::documents::DocumentSource;
use crate::models::{Document, EntityKind};
use crate::store::KnowledgeStore;

#[derive(Debug, Clone)]
pub struct NewDocuments {
    /// Documents newer than the checkpoint, oldest first (ties by id).
    pub documents: Vec<Document>,
    pub had_checkpoint: bool,
}

/// Documents for `project_id` created after the `(project_id, kind)` checkpoint.
///
/// With no checkpoint every document is new. A failure to list documents is
/// returned as an error, never as an empty batch.
pub async fn new_documents(
    store: &dyn KnowledgeStore,
    source: &dyn DocumentSource,
    project_id: &str,
    kind: EntityKind,
) -> Result<NewDocuments> {
    let checkpoint = store
        .get_checkpoint(project_id, kind)
        .await
        .with_context(|| format!("failed to read checkpoint for {}/{}", project_id, kind))?;
    let all = source
        .list(project_id)
        .await
        .with_context(|| format!("failed to list documents for project {}", project_id))?;

    let mut documents: Vec<Document> = match &checkpoint {
        Some(cp) => all
            .into_iter()
            .filter(|d| d.created_at > cp.last_update_at)
            .collect(),
        None => all,
    };
    documents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    tracing::debug!(
        project_id,
        agent_kind = %kind,
        had_checkpoint = checkpoint.is_some(),
        new = documents.len(),
        "change detection"
    );

    Ok(NewDocuments {
        documents,
        had_checkpoint: checkpoint.is_some(),
    })
}
