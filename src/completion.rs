//! Majority-vote completion verdicts for task entities.
//!
//! For every task in a project and every document the project has, the model
//! is asked whether that document shows the task as complete. Each usable
//! answer is a 0/1 signal; unusable answers are excluded from the
//! denominator. The verdict is `fraction = sum / len` and
//! `final_completion_status = fraction >= 0.5`.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::CompletionConfig;
use crate::documents::DocumentSource;
use crate::embedding::Embedder;
use crate::error::PipelineError;
use crate::extract::select_context;
use crate::llm::{strip_code_fences, LanguageModel};
use crate::models::{ContextChunk, Document, Entity, EntityFilter, EntityKind, EntityPatch};
use crate::store::KnowledgeStore;

const COMPLETION_CONTEXT_CHARS: usize = 6_000;

#[derive(Debug, Clone, Serialize)]
pub struct ExcludedSignal {
    pub document_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskVerdict {
    pub entity_id: String,
    pub signals: Vec<u8>,
    pub excluded: Vec<ExcludedSignal>,
    pub fraction: f64,
    pub final_completion_status: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedTask {
    pub entity_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompletionReport {
    pub tasks_evaluated: usize,
    pub documents_considered: usize,
    pub verdicts: Vec<TaskVerdict>,
    /// Tasks where every document was excluded; their stored verdict is unchanged.
    pub no_signal: Vec<String>,
    pub failed_tasks: Vec<FailedTask>,
}

/// Read a 0/1 judgment out of a model reply.
///
/// Accepts `1`/`0`, `yes`/`no`, `true`/`false`, `complete`/`incomplete`
/// (and `done`, `completed`, `not`) as the first word of the reply.
pub fn parse_signal(reply: &str) -> Result<u8, String> {
    let body = strip_code_fences(reply).to_ascii_lowercase();
    let first = body
        .split(|c: char| !c.is_ascii_alphanumeric())
        .find(|t| !t.is_empty())
        .ok_or_else(|| "empty judgment".to_string())?;
    match first {
        "1" | "yes" | "true" | "complete" | "completed" | "done" => Ok(1),
        "0" | "no" | "false" | "incomplete" | "not" => Ok(0),
        other => Err(format!("unrecognised judgment '{}'", other)),
    }
}

/// Fold signals into `(fraction, final_completion_status)`. `None` if empty.
pub fn fold_signals(signals: &[u8]) -> Option<(f64, bool)> {
    if signals.is_empty() {
        return None;
    }
    let sum: u32 = signals.iter().map(|&s| u32::from(s)).sum();
    let fraction = f64::from(sum) / signals.len() as f64;
    Some((fraction, fraction >= 0.5))
}

fn build_prompt(task: &str, context: &str) -> String {
    format!(
        "Based only on the document context below, has the following task been completed?\n\
         Task: {task}\n\
         Answer with a single digit: 1 if the document shows it is complete, 0 if not.\n\n\
         Document context:\n{context}\n"
    )
}

pub struct CompletionEvaluator {
    store: Arc<dyn KnowledgeStore>,
    documents: Arc<dyn DocumentSource>,
    llm: Arc<dyn LanguageModel>,
    embedder: Arc<dyn Embedder>,
    settings: CompletionConfig,
}

impl CompletionEvaluator {
    pub fn new(
        store: Arc<dyn KnowledgeStore>,
        documents: Arc<dyn DocumentSource>,
        llm: Arc<dyn LanguageModel>,
        embedder: Arc<dyn Embedder>,
        settings: CompletionConfig,
    ) -> Self {
        Self {
            store,
            documents,
            llm,
            embedder,
            settings,
        }
    }

    /// Recompute every task's verdict across every project document.
    pub async fn recompute(&self, project_id: &str) -> Result<CompletionReport> {
        let tasks = self
            .store
            .get_entities(project_id, EntityKind::Task, &EntityFilter::default())
            .await
            .context("failed to load tasks")?;
        let mut documents = self
            .documents
            .list(project_id)
            .await
            .context("failed to list documents")?;
        documents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut contexts: Vec<(Document, Result<Vec<ContextChunk>, String>)> =
            Vec::with_capacity(documents.len());
        for doc in documents {
            let chunks = match self.documents.context(project_id, &doc.id).await {
                Ok(chunks) if !chunks.is_empty() => Ok(chunks),
                Ok(_) => Err(PipelineError::MissingEmbeddings {
                    document_id: doc.id.clone(),
                }
                .to_string()),
                Err(e) => Err(format!("{:#}", e)),
            };
            contexts.push((doc, chunks));
        }

        let mut report = CompletionReport {
            tasks_evaluated: tasks.len(),
            documents_considered: contexts.len(),
            ..Default::default()
        };

        for task in &tasks {
            let (signals, excluded) = self.collect_signals(task, &contexts).await;

            let Some((fraction, final_status)) = fold_signals(&signals) else {
                tracing::warn!(project_id, entity_id = %task.id, "no usable completion signal");
                report.no_signal.push(task.id.clone());
                continue;
            };

            let patch = EntityPatch {
                final_completion_status: Some(final_status),
                completion_fraction: Some(fraction),
                ..Default::default()
            };
            match self.store.update_entity_fields(&task.id, &patch).await {
                Ok(true) => {}
                Ok(false) => {
                    report.failed_tasks.push(FailedTask {
                        entity_id: task.id.clone(),
                        reason: "task no longer exists".to_string(),
                    });
                    continue;
                }
                Err(e) => {
                    tracing::warn!(project_id, entity_id = %task.id, error = %e, "failed to store verdict");
                    report.failed_tasks.push(FailedTask {
                        entity_id: task.id.clone(),
                        reason: format!("{:#}", e),
                    });
                    continue;
                }
            }

            report.verdicts.push(TaskVerdict {
                entity_id: task.id.clone(),
                signals,
                excluded,
                fraction,
                final_completion_status: final_status,
            });
        }

        tracing::info!(
            project_id,
            tasks = report.tasks_evaluated,
            verdicts = report.verdicts.len(),
            failed = report.failed_tasks.len(),
            "completion recomputed"
        );
        Ok(report)
    }

    async fn collect_signals(
        &self,
        task: &Entity,
        contexts: &[(Document, Result<Vec<ContextChunk>, String>)],
    ) -> (Vec<u8>, Vec<ExcludedSignal>) {
        let task_vector = self.embedder.embed(&task.text).await.ok();
        let mut signals = Vec::new();
        let mut excluded = Vec::new();

        for (doc, chunks) in contexts {
            let outcome = match chunks {
                Ok(chunks) => {
                    let context = select_context(
                        chunks,
                        task_vector.as_deref(),
                        self.settings.context_chunks,
                        COMPLETION_CONTEXT_CHARS,
                    );
                    self.judge(&doc.id, &task.text, &context).await
                }
                Err(reason) => Err(PipelineError::EvaluatorSignal {
                    document_id: doc.id.clone(),
                    reason: reason.clone(),
                }),
            };
            match outcome {
                Ok(signal) => signals.push(signal),
                Err(err) => {
                    tracing::debug!(entity_id = %task.id, document_id = %doc.id, error = %err, "signal excluded");
                    excluded.push(ExcludedSignal {
                        document_id: doc.id.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        (signals, excluded)
    }

    async fn judge(&self, document_id: &str, task: &str, context: &str) -> Result<u8, PipelineError> {
        let reply = self
            .llm
            .chat(&build_prompt(task, context))
            .await
            .map_err(|e| PipelineError::EvaluatorSignal {
                document_id: document_id.to_string(),
                reason: e.to_string(),
            })?;
        parse_signal(&reply).map_err(|reason| PipelineError::EvaluatorSignal {
            document_id: document_id.to_string(),
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_of_three() {
        let (fraction, done) = fold_signals(&[1, 0, 1]).unwrap();
        assert!((fraction - 2.0 / 3.0).abs() < 1e-9);
        assert!(done);

        let (fraction, done) = fold_signals(&[1, 0, 0]).unwrap();
        assert!((fraction - 1.0 / 3.0).abs() < 1e-9);
        assert!(!done);
    }

    #[test]
    fn exactly_half_counts_as_complete() {
        assert_eq!(fold_signals(&[1, 0]), Some((0.5, true)));
        assert_eq!(fold_signals(&[]), None);
    }

    #[test]
    fn signal_parsing_accepts_common_answers() {
        assert_eq!(parse_signal("1"), Ok(1));
        assert_eq!(parse_signal("Yes, it was merged."), Ok(1));
        assert_eq!(parse_signal("```\n0\n```"), Ok(0));
        assert_eq!(parse_signal("Incomplete"), Ok(0));
        assert_eq!(parse_signal("Not yet"), Ok(0));
        assert!(parse_signal("maybe").is_err());
        assert!(parse_signal("   ").is_err());
    }
}
