//! Entity extraction from one document's embedded context.
//!
//! # Flow
//!
//! 1. Load the document's chunks from the [`DocumentSource`]. No chunks (or
//!    no vectors) fails with [`PipelineError::MissingEmbeddings`].
//! 2. Rank chunks against a kind-specific retrieval query, keep the top
//!    `context_chunks`, restore document order and cap at `max_context_chars`.
//! 3. Ask the [`LanguageModel`] for a JSON list of entities.
//! 4. Decode in two stages ([`decode`]): a strict JSON decode, then a
//!    line-pattern fallback over bulleted or numbered lines. The stage that
//!    produced the candidates is reported as a [`DecodePath`].
//!
//! Cross-document identity is decided by [`best_match`] under an explicit
//! [`MatchPolicy`]: the highest cosine score strictly above the threshold
//! wins, ties go to the earliest (or latest) `created_at`, then to the
//! smaller id.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ExtractionConfig;
use crate::documents::DocumentSource;
use crate::embedding::{cosine_similarity, Embedder};
use crate::error::PipelineError;
use crate::llm::{strip_code_fences, LanguageModel};
use crate::models::{
    ContextChunk, Entity, EntityKind, KindFields, DEFAULT_CATEGORY, DEFAULT_PRIORITY,
};
use crate::store::{KnowledgeStore, ScoredEntity};

/// How many nearest entities are fetched before the match policy is applied.
const MATCH_CANDIDATES: usize = 16;

static LIST_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?:[-*+•]|\d{1,3}[.)])\s+(.+?)\s*$").expect("valid list-line regex")
});

/// Which decoder stage produced the candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodePath {
    Strict,
    Lenient,
}

/// An extracted item before it is matched against existing entities.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityCandidate {
    pub text: String,
    pub category: String,
    pub priority: String,
    pub fields: KindFields,
}

impl EntityCandidate {
    fn with_defaults(kind: EntityKind, text: String) -> Self {
        Self {
            text,
            category: DEFAULT_CATEGORY.to_string(),
            priority: DEFAULT_PRIORITY.to_string(),
            fields: default_fields(kind),
        }
    }

    /// Promote the candidate to a new entity introduced by `document_id`.
    pub fn into_entity(
        self,
        id: String,
        project_id: &str,
        document_id: &str,
        created_at: DateTime<Utc>,
    ) -> Entity {
        Entity {
            id,
            project_id: project_id.to_string(),
            text: self.text,
            category: self.category,
            priority: self.priority,
            source_document_id: document_id.to_string(),
            created_at,
            fields: self.fields,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub document_id: String,
    pub candidates: Vec<EntityCandidate>,
    pub decode_path: DecodePath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    EarliestCreated,
    LatestCreated,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPolicy {
    /// Scores must be strictly greater than this to count as a match.
    pub threshold: f32,
    pub tie_break: TieBreak,
}

impl From<&ExtractionConfig> for MatchPolicy {
    fn from(settings: &ExtractionConfig) -> Self {
        Self {
            threshold: settings.match_threshold,
            tie_break: settings.tie_break,
        }
    }
}

/// Pick the entity a candidate should attach to, if any.
pub fn best_match<'a>(candidates: &'a [ScoredEntity], policy: &MatchPolicy) -> Option<&'a ScoredEntity> {
    candidates
        .iter()
        .filter(|c| c.score > policy.threshold)
        .min_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| match policy.tie_break {
                    TieBreak::EarliestCreated => a.entity.created_at.cmp(&b.entity.created_at),
                    TieBreak::LatestCreated => b.entity.created_at.cmp(&a.entity.created_at),
                })
                .then_with(|| a.entity.id.cmp(&b.entity.id))
        })
}

fn default_fields(kind: EntityKind) -> KindFields {
    match kind {
        EntityKind::Milestone => KindFields::Milestone { deadline: None },
        EntityKind::Task => KindFields::Task {
            completion_status: false,
            final_completion_status: None,
            completion_fraction: None,
        },
        EntityKind::Bottleneck => KindFields::Bottleneck { impact: None },
    }
}

fn retrieval_query(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Milestone => {
            "project milestones, deliverables, phases, release dates and deadlines"
        }
        EntityKind::Task => "tasks, action items, assignments, work in progress and completed work",
        EntityKind::Bottleneck => "bottlenecks, blockers, risks, delays, dependencies and issues",
    }
}

/// Build the extraction prompt for one kind.
pub fn build_prompt(kind: EntityKind, context: &str) -> String {
    let (what, extra) = match kind {
        EntityKind::Milestone => (
            "project milestones (significant deliverables or phase completions)",
            r#""deadline": target date as written in the document, or null"#,
        ),
        EntityKind::Task => (
            "concrete tasks or action items",
            r#""completion_status": true if the document says the task is done, otherwise false"#,
        ),
        EntityKind::Bottleneck => (
            "bottlenecks (blockers, risks or delays slowing the project)",
            r#""impact": short description of what is affected, or null"#,
        ),
    };

    format!(
        "You are analysing a project document. Identify all {what}.\n\
         Respond with a JSON array only. Each element must be an object with:\n\
         - \"text\": one sentence describing the item\n\
         - \"category\": a short label such as Engineering, Design or Operations\n\
         - \"priority\": High, Medium or Low\n\
         - {extra}\n\
         If there are none, respond with [].\n\n\
         Document context:\n{context}\n"
    )
}

#[derive(Deserialize)]
struct RawCandidate {
    #[serde(alias = "description", alias = "name", alias = "title")]
    text: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    deadline: Option<Value>,
    #[serde(default)]
    impact: Option<Value>,
    #[serde(default)]
    completion_status: Option<Value>,
}

fn non_blank(value: Option<String>, default: &str) -> String {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn text_value(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |v| v >= 0.5),
        Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "yes" | "1" | "done" | "complete" | "completed"
        ),
        _ => false,
    }
}

impl RawCandidate {
    fn into_candidate(self, kind: EntityKind) -> Option<EntityCandidate> {
        let text = self.text.trim().to_string();
        if text.is_empty() {
            return None;
        }
        let fields = match kind {
            EntityKind::Milestone => KindFields::Milestone {
                deadline: text_value(self.deadline),
            },
            EntityKind::Task => KindFields::Task {
                completion_status: self.completion_status.as_ref().map_or(false, truthy),
                final_completion_status: None,
                completion_fraction: None,
            },
            EntityKind::Bottleneck => KindFields::Bottleneck {
                impact: text_value(self.impact),
            },
        };
        Some(EntityCandidate {
            text,
            category: non_blank(self.category, DEFAULT_CATEGORY),
            priority: non_blank(self.priority, DEFAULT_PRIORITY),
            fields,
        })
    }
}

/// Strict stage: a JSON array, or an object holding the array under the
/// kind's plural name or `"entities"`.
///
/// Items that do not deserialize are dropped; the rest of the list is kept.
pub fn decode_strict(kind: EntityKind, raw: &str) -> Result<Vec<EntityCandidate>, PipelineError> {
    let body = strip_code_fences(raw);
    let value: Value =
        serde_json::from_str(body).map_err(|e| PipelineError::ExtractionDecode(e.to_string()))?;

    let list = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map
            .remove(kind.plural())
            .or_else(|| map.remove("entities"))
        {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(PipelineError::ExtractionDecode(format!(
                    "object has no '{}' or 'entities' array",
                    kind.plural()
                )))
            }
        },
        other => {
            return Err(PipelineError::ExtractionDecode(format!(
                "expected a list, got {}",
                other
            )))
        }
    };

    let mut out = Vec::with_capacity(list.len());
    for (index, item) in list.into_iter().enumerate() {
        match serde_json::from_value::<RawCandidate>(item) {
            Ok(raw) => out.extend(raw.into_candidate(kind)),
            Err(e) => {
                tracing::debug!(agent_kind = %kind, index, error = %e, "dropping malformed item");
            }
        }
    }
    Ok(out)
}

/// Lenient stage: one candidate per bulleted or numbered line.
pub fn decode_lenient(kind: EntityKind, raw: &str) -> Vec<EntityCandidate> {
    LIST_LINE
        .captures_iter(raw)
        .filter_map(|cap| {
            let text = cap[1].trim().trim_matches('*').trim();
            (!text.is_empty()).then(|| EntityCandidate::with_defaults(kind, text.to_string()))
        })
        .collect()
}

/// Two-stage decode of a model response.
pub fn decode(kind: EntityKind, raw: &str) -> (Vec<EntityCandidate>, DecodePath) {
    match decode_strict(kind, raw) {
        Ok(candidates) => (candidates, DecodePath::Strict),
        Err(err) => {
            tracing::debug!(agent_kind = %kind, error = %err, "falling back to line decoder");
            (decode_lenient(kind, raw), DecodePath::Lenient)
        }
    }
}

/// Keep the `limit` chunks closest to `query`, restored to document order,
/// joined and capped at `max_chars` characters.
pub fn select_context(
    chunks: &[ContextChunk],
    query: Option<&[f32]>,
    limit: usize,
    max_chars: usize,
) -> String {
    let mut picked: Vec<&ContextChunk> = chunks.iter().collect();
    if let Some(q) = query {
        picked.sort_by(|a, b| {
            cosine_similarity(q, &b.vector)
                .partial_cmp(&cosine_similarity(q, &a.vector))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_index.cmp(&b.chunk_index))
        });
    }
    picked.truncate(limit);
    picked.sort_by_key(|c| c.chunk_index);

    let joined = picked
        .iter()
        .map(|c| c.text.trim())
        .collect::<Vec<_>>()
        .join("\n\n");
    match joined.char_indices().nth(max_chars) {
        Some((cut, _)) => joined[..cut].to_string(),
        None => joined,
    }
}

fn top_score_fills_page(nearest: &[ScoredEntity]) -> bool {
    match (nearest.first(), nearest.last()) {
        (Some(first), Some(last)) => nearest.len() >= MATCH_CANDIDATES && last.score >= first.score,
        _ => false,
    }
}

pub struct EntityExtractor {
    store: Arc<dyn KnowledgeStore>,
    documents: Arc<dyn DocumentSource>,
    llm: Arc<dyn LanguageModel>,
    embedder: Arc<dyn Embedder>,
    settings: ExtractionConfig,
    policy: MatchPolicy,
}

impl EntityExtractor {
    pub fn new(
        store: Arc<dyn KnowledgeStore>,
        documents: Arc<dyn DocumentSource>,
        llm: Arc<dyn LanguageModel>,
        embedder: Arc<dyn Embedder>,
        settings: ExtractionConfig,
    ) -> Self {
        let policy = MatchPolicy::from(&settings);
        Self {
            store,
            documents,
            llm,
            embedder,
            settings,
            policy,
        }
    }

    pub async fn extract(
        &self,
        project_id: &str,
        document_id: &str,
        kind: EntityKind,
    ) -> Result<ExtractionOutcome, PipelineError> {
        let chunks = self
            .documents
            .context(project_id, document_id)
            .await
            .map_err(PipelineError::storage)?;
        if chunks.is_empty() || chunks.iter().all(|c| c.vector.is_empty()) {
            return Err(PipelineError::MissingEmbeddings {
                document_id: document_id.to_string(),
            });
        }

        let query = match self.embedder.embed(retrieval_query(kind)).await {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::debug!(document_id, error = %e, "retrieval query not embedded; using leading chunks");
                None
            }
        };
        let context = select_context(
            &chunks,
            query.as_deref(),
            self.settings.context_chunks,
            self.settings.max_context_chars,
        );

        let reply = self.llm.chat(&build_prompt(kind, &context)).await?;
        let (candidates, decode_path) = decode(kind, &reply);
        if decode_path == DecodePath::Lenient {
            tracing::warn!(
                project_id,
                document_id,
                agent_kind = %kind,
                candidates = candidates.len(),
                "structured decode failed; used line decoder"
            );
        }

        Ok(ExtractionOutcome {
            document_id: document_id.to_string(),
            candidates,
            decode_path,
        })
    }

    /// Best existing entity for an already-embedded candidate.
    ///
    /// Entities introduced by `exclude_document` are never returned.
    pub async fn match_vector(
        &self,
        project_id: &str,
        kind: EntityKind,
        vector: &[f32],
        exclude_document: Option<&str>,
    ) -> anyhow::Result<Option<ScoredEntity>> {
        let mut nearest = self
            .store
            .vector_search_entities(project_id, kind, vector, MATCH_CANDIDATES, exclude_document)
            .await?;
        // A full page tied at the top score may hide later-created ties.
        if self.policy.tie_break == TieBreak::LatestCreated && top_score_fills_page(&nearest) {
            nearest = self
                .store
                .vector_search_entities(project_id, kind, vector, usize::MAX, exclude_document)
                .await?;
        }
        Ok(best_match(&nearest, &self.policy).cloned())
    }

    /// Id of the existing entity that `candidate_text` describes, if any.
    pub async fn find_matching_entity(
        &self,
        project_id: &str,
        candidate_text: &str,
        kind: EntityKind,
    ) -> anyhow::Result<Option<String>> {
        let vector = self.embedder.embed(candidate_text).await?;
        Ok(self
            .match_vector(project_id, kind, &vector, None)
            .await?
            .map(|hit| hit.entity.id))
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn scored(id: &str, score: f32, created: i64) -> ScoredEntity {
        ScoredEntity {
            entity: EntityCandidate::with_defaults(EntityKind::Task, id.to_string()).into_entity(
                id.to_string(),
                "p",
                "d",
                Utc.timestamp_opt(created, 0).unwrap(),
            ),
            score,
        }
    }

    #[test]
    fn strict_decode_reads_array_with_defaults() {
        let raw = r#"```json
        [{"text": "Ship beta", "priority": "High", "completion_status": "yes", "owner": "ana"},
         {"text": "Write docs"}]
        ```"#;
        let (cands, path) = decode(EntityKind::Task, raw);
        assert_eq!(path, DecodePath::Strict);
        assert_eq!(cands.len(), 2);
        assert_eq!(cands[0].priority, "High");
        assert_eq!(cands[0].category, DEFAULT_CATEGORY);
        assert!(matches!(
            cands[0].fields,
            KindFields::Task {
                completion_status: true,
                ..
            }
        ));
        assert_eq!(cands[1].priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn strict_decode_accepts_wrapped_object() {
        let raw = r#"{"milestones": [{"text": "Alpha release", "deadline": "2024-03-01"}]}"#;
        let cands = decode_strict(EntityKind::Milestone, raw).unwrap();
        assert_eq!(
            cands[0].fields,
            KindFields::Milestone {
                deadline: Some("2024-03-01".into())
            }
        );
        assert!(decode_strict(EntityKind::Milestone, r#"{"tasks": []}"#).is_err());
    }

    #[test]
    fn bullet_list_falls_back_to_lenient() {
        let raw = "Here is what I found:\n- Vendor contract unsigned\n* **QA team understaffed**\n2. Build servers slow\n";
        let (cands, path) = decode(EntityKind::Bottleneck, raw);
        assert_eq!(path, DecodePath::Lenient);
        let texts: Vec<&str> = cands.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["Vendor contract unsigned", "QA team understaffed", "Build servers slow"]
        );
        assert!(cands.iter().all(|c| c.priority == DEFAULT_PRIORITY));
    }

    #[test]
    fn item_without_text_is_dropped_by_strict_stage() {
        let (cands, path) = decode(EntityKind::Task, r#"[{"priority": "High"}]"#);
        assert_eq!(path, DecodePath::Strict);
        assert!(cands.is_empty());
    }

    #[test]
    fn malformed_item_does_not_sink_its_neighbours() {
        let raw = r#"[
            {"text": "Write migration plan", "priority": "High"},
            {"priority": "Low"},
            "just a string",
            {"description": "Review rollout checklist"}
        ]"#;
        let (cands, path) = decode(EntityKind::Task, raw);
        assert_eq!(path, DecodePath::Strict);
        let texts: Vec<&str> = cands.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["Write migration plan", "Review rollout checklist"]);
        assert_eq!(cands[0].priority, "High");
    }

    #[test]
    fn best_match_requires_strictly_greater_score() {
        let policy = MatchPolicy {
            threshold: 0.5,
            tie_break: TieBreak::EarliestCreated,
        };
        let at_threshold = vec![scored("a", 0.5, 1)];
        assert!(best_match(&at_threshold, &policy).is_none());
        let above = vec![scored("a", 0.2, 1), scored("b", 0.51, 2)];
        assert_eq!(best_match(&above, &policy).unwrap().entity.id, "b");
    }

    #[test]
    fn best_match_tie_break_follows_policy() {
        let tied = vec![scored("late", 0.9, 20), scored("early", 0.9, 10)];
        let earliest = MatchPolicy::from(&ExtractionConfig::default());
        assert_eq!(best_match(&tied, &earliest).unwrap().entity.id, "early");
        let latest = MatchPolicy {
            threshold: 0.2,
            tie_break: TieBreak::LatestCreated,
        };
        assert_eq!(best_match(&tied, &latest).unwrap().entity.id, "late");
    }

    #[test]
    fn context_keeps_closest_chunks_in_document_order() {
        let chunk = |i: i64, text: &str, v: [f32; 2]| ContextChunk {
            chunk_index: i,
            text: text.into(),
            vector: v.to_vec(),
        };
        let chunks = vec![
            chunk(0, "intro", [0.0, 1.0]),
            chunk(1, "risk one", [1.0, 0.1]),
            chunk(2, "filler", [0.1, 1.0]),
            chunk(3, "risk two", [1.0, 0.0]),
        ];
        let ctx = select_context(&chunks, Some(&[1.0, 0.0]), 2, 1000);
        assert_eq!(ctx, "risk one\n\nrisk two");
        assert_eq!(select_context(&chunks, None, 1, 3), "int");
    }

    #[test]
    fn prompt_embeds_context() {
        let p = build_prompt(EntityKind::Milestone, "Beta ships in May.");
        assert!(p.contains("Document context:\nBeta ships in May."));
        assert!(p.contains("deadline"));
    }
}
