//! Command implementations for the `ptrack` binary.
//!
//! Each `run_*` function opens its own services from the config and prints
//! results to stdout in `key: value` form.

use anyhow::{bail, Result};
use serde_json::{Map, Value};

use crate::config::Config;
use crate::models::{EntityFilter, EntityKind, KindFields};
use crate::pipeline::{Pipeline, Services};
use crate::router::{register_store_functions, SemanticRouter};

/// Run one pipeline pass in the foreground and print its summary.
pub async fn run_refresh(config: &Config, project_id: &str, kind: EntityKind) -> Result<()> {
    let services = Services::open(config).await?;
    let pipeline = Pipeline::new(services, config);
    let summary = pipeline.run(project_id, kind).await?;

    println!("project: {}", summary.project_id);
    println!("agent: {}", summary.agent_kind);
    println!("had_checkpoint: {}", summary.had_checkpoint);
    println!("documents_seen: {}", summary.documents_seen);
    println!("processed: {}", summary.processed_documents.len());
    println!("failed: {}", summary.failed_documents.len());
    for failed in &summary.failed_documents {
        println!("  {}: {}", failed.document_id, failed.reason);
    }
    println!("entities_created: {}", summary.entities_created);
    println!("details_attached: {}", summary.details_attached);
    if summary.entities_existing > 0 {
        println!("entities_existing: {}", summary.entities_existing);
    }
    println!(
        "decodes: {} strict, {} lenient",
        summary.strict_decodes, summary.lenient_decodes
    );
    if let Some(report) = &summary.completion {
        println!(
            "completion: {} verdicts, {} without signal, {} failed",
            report.verdicts.len(),
            report.no_signal.len(),
            report.failed_tasks.len()
        );
    }
    match summary.checkpoint_advanced_to {
        Some(at) => println!("checkpoint: {}", at.to_rfc3339()),
        None => println!("checkpoint: unchanged"),
    }
    Ok(())
}

pub async fn run_entities(
    config: &Config,
    project_id: &str,
    kind: EntityKind,
    filter: EntityFilter,
) -> Result<()> {
    let services = Services::open(config).await?;
    let entities = services.store.get_entities(project_id, kind, &filter).await?;

    if entities.is_empty() {
        println!("No {} found.", kind.plural());
        return Ok(());
    }

    for (i, e) in entities.iter().enumerate() {
        let extra = match &e.fields {
            KindFields::Milestone { deadline } => deadline
                .as_deref()
                .map(|d| format!(" deadline={}", d))
                .unwrap_or_default(),
            KindFields::Task {
                completion_status,
                final_completion_status,
                completion_fraction,
            } => match (final_completion_status, completion_fraction) {
                (Some(done), Some(fraction)) => format!(" done={} ({:.2})", done, fraction),
                _ => format!(" done={} (provisional)", completion_status),
            },
            KindFields::Bottleneck { impact } => impact
                .as_deref()
                .map(|d| format!(" impact={}", d))
                .unwrap_or_default(),
        };
        println!(
            "{}. [{}/{}] {}{}",
            i + 1,
            e.category,
            e.priority,
            e.text,
            extra
        );
        println!("    id: {}  source: {}", e.id, e.source_document_id);
    }
    Ok(())
}

pub async fn run_details(config: &Config, entity_id: &str) -> Result<()> {
    let services = Services::open(config).await?;
    let Some(entity) = services.store.get_entity(entity_id).await? else {
        bail!("entity not found: {}", entity_id);
    };
    let details = services.store.get_details(entity_id).await?;

    println!("id: {}", entity.id);
    println!("kind: {}", entity.kind());
    println!("text: {}", entity.text);
    println!("source: {}", entity.source_document_id);
    println!("details: {}", details.len());
    for d in &details {
        println!("--- {} ({})", d.source_document_id, d.created_at.to_rfc3339());
        println!("{}", d.text);
    }
    Ok(())
}

pub async fn run_route(
    config: &Config,
    query: &str,
    project_id: &str,
    requesting_agent: &str,
    args: Vec<(String, String)>,
) -> Result<()> {
    let services = Services::open(config).await?;
    let mut router = SemanticRouter::new(services.embedder.clone(), config.router.threshold);
    register_store_functions(&mut router, services.store.clone()).await?;

    let kwargs: Map<String, Value> = args.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
    match router
        .route(query, requesting_agent, project_id, &Value::Object(kwargs))
        .await?
    {
        Some(hit) => {
            println!("function: {}.{}", hit.agent_name, hit.function_name);
            println!("score: {:.3}", hit.score);
            println!("{}", serde_json::to_string_pretty(&hit.data)?);
        }
        None => println!("No function matched (threshold {:.2}).", router.threshold()),
    }
    Ok(())
}
