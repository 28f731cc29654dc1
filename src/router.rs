//! Semantic function router.
//!
//! Extraction modules register named data-access functions with a
//! natural-language description. A query is embedded, compared by cosine
//! similarity against every description, and dispatched to the best
//! function when its score exceeds the router threshold. Anything else is
//! a miss: [`SemanticRouter::route`] returns `Ok(None)`.
//!
//! Registration happens once at startup; routing only reads.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::embedding::{cosine_similarity, Embedder};
use crate::models::{EntityFilter, EntityKind};
use crate::store::KnowledgeStore;

/// A data-access function callable through the router.
#[async_trait]
pub trait DataHandler: Send + Sync {
    async fn call(&self, project_id: &str, kwargs: &Value) -> Result<Value>;
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionDescriptor {
    pub agent_name: String,
    pub function_name: String,
    pub description: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteHit {
    pub agent_name: String,
    pub function_name: String,
    pub score: f32,
    pub data: Value,
}

struct Registration {
    descriptor: FunctionDescriptor,
    handler: Arc<dyn DataHandler>,
}

pub struct SemanticRouter {
    embedder: Arc<dyn Embedder>,
    threshold: f32,
    functions: Vec<Registration>,
}

impl SemanticRouter {
    pub fn new(embedder: Arc<dyn Embedder>, threshold: f32) -> Self {
        Self {
            embedder,
            threshold,
            functions: Vec::new(),
        }
    }

    /// Register a function. The description is embedded once, here.
    pub async fn register(
        &mut self,
        agent_name: &str,
        function_name: &str,
        description: &str,
        handler: Arc<dyn DataHandler>,
    ) -> Result<()> {
        if self
            .functions
            .iter()
            .any(|f| f.descriptor.agent_name == agent_name && f.descriptor.function_name == function_name)
        {
            bail!("function {}.{} is already registered", agent_name, function_name);
        }
        let embedding = self.embedder.embed(description).await?;
        self.functions.push(Registration {
            descriptor: FunctionDescriptor {
                agent_name: agent_name.to_string(),
                function_name: function_name.to_string(),
                description: description.to_string(),
                embedding,
            },
            handler,
        });
        tracing::debug!(agent = agent_name, function = function_name, "router function registered");
        Ok(())
    }

    /// Resolve `query` to a registered function and call it.
    ///
    /// Returns `Ok(None)` when no description scores above the threshold.
    /// Embedding and handler failures are errors.
    pub async fn route(
        &self,
        query: &str,
        requesting_agent: &str,
        project_id: &str,
        kwargs: &Value,
    ) -> Result<Option<RouteHit>> {
        let query_vec = self.embedder.embed(query).await?;

        let mut best: Option<(&Registration, f32)> = None;
        for reg in &self.functions {
            let score = cosine_similarity(&query_vec, &reg.descriptor.embedding);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((reg, score));
            }
        }

        let Some((reg, score)) = best else {
            tracing::info!(requesting_agent, query, "routing miss: no functions registered");
            return Ok(None);
        };
        let d = &reg.descriptor;
        if score <= self.threshold {
            tracing::info!(
                requesting_agent,
                query,
                best_function = %format!("{}.{}", d.agent_name, d.function_name),
                score,
                threshold = self.threshold,
                "routing miss"
            );
            return Ok(None);
        }

        tracing::info!(
            requesting_agent,
            project_id,
            function = %format!("{}.{}", d.agent_name, d.function_name),
            score,
            "routing hit"
        );
        let data = reg.handler.call(project_id, kwargs).await?;
        Ok(Some(RouteHit {
            agent_name: d.agent_name.clone(),
            function_name: d.function_name.clone(),
            score,
            data,
        }))
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &FunctionDescriptor> {
        self.functions.iter().map(|f| &f.descriptor)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

// ============ Store-backed functions ============

struct ListEntities {
    store: Arc<dyn KnowledgeStore>,
    kind: EntityKind,
}

#[async_trait]
impl DataHandler for ListEntities {
    async fn call(&self, project_id: &str, kwargs: &Value) -> Result<Value> {
        let filter: EntityFilter = match kwargs {
            Value::Null => EntityFilter::default(),
            other => serde_json::from_value(other.clone())?,
        };
        let entities = self.store.get_entities(project_id, self.kind, &filter).await?;
        Ok(serde_json::to_value(entities)?)
    }
}

struct EntityDetails {
    store: Arc<dyn KnowledgeStore>,
    kind: EntityKind,
}

#[async_trait]
impl DataHandler for EntityDetails {
    async fn call(&self, project_id: &str, kwargs: &Value) -> Result<Value> {
        let entity_id = kwargs
            .get("entity_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("entity_id is required"))?;
        match self.store.get_entity(entity_id).await? {
            Some(e) if e.project_id == project_id && e.kind() == self.kind => {}
            _ => bail!("{} {} not found in project {}", self.kind, entity_id, project_id),
        }
        let details = self.store.get_details(entity_id).await?;
        Ok(serde_json::to_value(details)?)
    }
}

fn list_description(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Milestone => {
            "Get the project milestones: major deliverables, phases, release dates and deadlines."
        }
        EntityKind::Task => {
            "Get the project tasks and action items with their completion status and priority."
        }
        EntityKind::Bottleneck => {
            "Get the project bottlenecks: blockers, risks and delays with their impact."
        }
    }
}

/// Register `get_<kind>s` and `get_<kind>_details` for every entity kind.
///
/// `get_<kind>s` accepts `category`, `priority` and `source_document_id`
/// kwargs; `get_<kind>_details` requires `entity_id`.
pub async fn register_store_functions(
    router: &mut SemanticRouter,
    store: Arc<dyn KnowledgeStore>,
) -> Result<()> {
    for kind in EntityKind::ALL {
        router
            .register(
                kind.as_str(),
                &format!("get_{}", kind.plural()),
                list_description(kind),
                Arc::new(ListEntities {
                    store: store.clone(),
                    kind,
                }),
            )
            .await?;
        router
            .register(
                kind.as_str(),
                &format!("get_{}_details", kind),
                &format!(
                    "Get the detailed notes gathered from every document about one {} by entity id.",
                    kind
                ),
                Arc::new(EntityDetails {
                    store: store.clone(),
                    kind,
                }),
            )
            .await?;
    }
    Ok(())
}
