//! Core data models used throughout Progress Tracker.
//!
//! These types represent the documents, entities, detail records, and
//! checkpoints that flow through the incremental update pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_CATEGORY: &str = "General";
pub const DEFAULT_PRIORITY: &str = "Medium";

/// Metadata for a project document, as listed by the document source.
///
/// Documents are written by the upload side of the system; the core only
/// reads their ids and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub project_id: String,
    pub created_at: DateTime<Utc>,
}

/// One pre-computed embedding chunk of a document.
#[derive(Debug, Clone)]
pub struct ContextChunk {
    pub chunk_index: i64,
    pub text: String,
    pub vector: Vec<f32>,
}

/// The three entity families extracted from project documents.
///
/// Each kind is owned by its own extraction module ("agent"); the kind
/// doubles as the agent name in job keys and router registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Milestone,
    Task,
    Bottleneck,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Milestone, EntityKind::Task, EntityKind::Bottleneck];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Milestone => "milestone",
            EntityKind::Task => "task",
            EntityKind::Bottleneck => "bottleneck",
        }
    }

    pub fn plural(&self) -> &'static str {
        match self {
            EntityKind::Milestone => "milestones",
            EntityKind::Task => "tasks",
            EntityKind::Bottleneck => "bottlenecks",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "milestone" | "milestones" => Ok(EntityKind::Milestone),
            "task" | "tasks" => Ok(EntityKind::Task),
            "bottleneck" | "bottlenecks" => Ok(EntityKind::Bottleneck),
            other => anyhow::bail!(
                "Unknown agent kind: '{}'. Must be milestone, task, or bottleneck.",
                other
            ),
        }
    }
}

/// Fields that only exist for one entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KindFields {
    Milestone {
        deadline: Option<String>,
    },
    Task {
        /// Provisional status from the document that introduced the task.
        completion_status: bool,
        /// Majority verdict across every project document.
        final_completion_status: Option<bool>,
        completion_fraction: Option<f64>,
    },
    Bottleneck {
        impact: Option<String>,
    },
}

impl KindFields {
    pub fn kind(&self) -> EntityKind {
        match self {
            KindFields::Milestone { .. } => EntityKind::Milestone,
            KindFields::Task { .. } => EntityKind::Task,
            KindFields::Bottleneck { .. } => EntityKind::Bottleneck,
        }
    }
}

/// A structured item extracted from one source document.
///
/// Identity is fixed at extraction time. Later documents that describe the
/// same item contribute [`DetailRecord`]s instead of new entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub project_id: String,
    pub text: String,
    pub category: String,
    pub priority: String,
    pub source_document_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: KindFields,
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        self.fields.kind()
    }
}

/// One document's contribution of detail about an existing entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailRecord {
    pub id: String,
    pub parent_entity_id: String,
    pub project_id: String,
    pub source_document_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Watermark separating processed from new documents for one agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Checkpoint {
    pub project_id: String,
    pub agent_kind: EntityKind,
    pub last_update_at: DateTime<Utc>,
}

/// Optional filters for entity listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntityFilter {
    pub category: Option<String>,
    pub priority: Option<String>,
    pub source_document_id: Option<String>,
}

impl EntityFilter {
    pub fn matches(&self, entity: &Entity) -> bool {
        let eq = |want: &Option<String>, have: &str| {
            want.as_deref()
                .map_or(true, |w| w.eq_ignore_ascii_case(have))
        };
        eq(&self.category, &entity.category)
            && eq(&self.priority, &entity.priority)
            && self
                .source_document_id
                .as_deref()
                .map_or(true, |d| d == entity.source_document_id)
    }
}

/// Partial update applied by [`KnowledgeStore::update_entity_fields`](crate::store::KnowledgeStore::update_entity_fields).
///
/// `None` leaves a field untouched. Completion fields are ignored for
/// non-task entities.
#[derive(Debug, Clone, Default)]
pub struct EntityPatch {
    pub category: Option<String>,
    pub priority: Option<String>,
    pub final_completion_status: Option<bool>,
    pub completion_fraction: Option<f64>,
}

impl EntityPatch {
    pub fn apply(&self, entity: &mut Entity) {
        if let Some(category) = &self.category {
            entity.category = category.clone();
        }
        if let Some(priority) = &self.priority {
            entity.priority = priority.clone();
        }
        if let KindFields::Task {
            final_completion_status,
            completion_fraction,
            ..
        } = &mut entity.fields
        {
            if let Some(status) = self.final_completion_status {
                *final_completion_status = Some(status);
            }
            if let Some(fraction) = self.completion_fraction {
                *completion_fraction = Some(fraction);
            }
        }
    }
}
