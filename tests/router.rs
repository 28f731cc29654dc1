mod common;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use common::*;
use progress_tracker::embedding::{Embedder, HashingEmbedder};
use progress_tracker::models::{DetailRecord, Entity, KindFields};
use progress_tracker::router::{register_store_functions, DataHandler, SemanticRouter};
use progress_tracker::store::memory::InMemoryStore;
use progress_tracker::store::KnowledgeStore;

struct WeeklyDigest;

#[async_trait]
impl DataHandler for WeeklyDigest {
    async fn call(&self, project_id: &str, kwargs: &Value) -> Result<Value> {
        Ok(json!({ "project": project_id, "week": kwargs["week"] }))
    }
}

fn bottleneck(id: &str, text: &str, priority: &str) -> Entity {
    Entity {
        id: id.to_string(),
        project_id: PROJECT.to_string(),
        text: text.to_string(),
        category: "General".to_string(),
        priority: priority.to_string(),
        source_document_id: "d1".to_string(),
        created_at: Utc::now(),
        fields: KindFields::Bottleneck {
            impact: Some("Delays launch".to_string()),
        },
    }
}

async fn store_router(store: Arc<InMemoryStore>) -> SemanticRouter {
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::default());
    let mut router = SemanticRouter::new(embedder, 0.45);
    register_store_functions(&mut router, store).await.unwrap();
    router
}

#[tokio::test]
async fn registers_list_and_detail_functions_per_kind() {
    let router = store_router(Arc::new(InMemoryStore::new())).await;
    assert_eq!(router.len(), 6);
    let names: Vec<String> = router
        .descriptors()
        .map(|d| format!("{}.{}", d.agent_name, d.function_name))
        .collect();
    assert!(names.contains(&"bottleneck.get_bottlenecks".to_string()));
    assert!(names.contains(&"task.get_task_details".to_string()));
}

#[tokio::test]
async fn unrelated_query_is_a_miss() {
    let router = store_router(Arc::new(InMemoryStore::new())).await;
    let hit = router
        .route("weather in Paris tomorrow", "milestone", PROJECT, &Value::Null)
        .await
        .unwrap();
    assert!(hit.is_none());
}

#[tokio::test]
async fn bottleneck_query_hits_list_function_with_filter() {
    let store = Arc::new(InMemoryStore::new());
    store
        .put_entity(&bottleneck("b1", "Vendor contract unsigned", "High"), None)
        .await
        .unwrap();
    store
        .put_entity(&bottleneck("b2", "Office move", "Low"), None)
        .await
        .unwrap();
    let router = store_router(store).await;

    let hit = router
        .route(
            "project bottlenecks blockers risks delays impact",
            "task",
            PROJECT,
            &json!({ "priority": "high" }),
        )
        .await
        .unwrap()
        .expect("bottleneck list should match");
    assert_eq!(hit.agent_name, "bottleneck");
    assert_eq!(hit.function_name, "get_bottlenecks");
    assert!(hit.score > 0.45);

    let items = hit.data.as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["id"], "b1");
    assert_eq!(items[0]["impact"], "Delays launch");
}

#[tokio::test]
async fn details_function_returns_records_in_order() {
    let store = Arc::new(InMemoryStore::new());
    let mut task = bottleneck("t1", "Publish API docs", "Medium");
    task.fields = KindFields::Task {
        completion_status: false,
        final_completion_status: None,
        completion_fraction: None,
    };
    store.put_entity(&task, None).await.unwrap();
    for doc_id in ["d2", "d3"] {
        let record = DetailRecord {
            id: format!("det-{}", doc_id),
            parent_entity_id: "t1".to_string(),
            project_id: PROJECT.to_string(),
            source_document_id: doc_id.to_string(),
            text: format!("Docs draft reviewed in {}", doc_id),
            created_at: Utc::now(),
        };
        assert!(store.append_detail("t1", &record).await.unwrap());
    }
    let router = store_router(store).await;

    let hit = router
        .route(
            "detailed notes gathered from every document about one task by entity id",
            "milestone",
            PROJECT,
            &json!({ "entity_id": "t1" }),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hit.function_name, "get_task_details");
    let records = hit.data.as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["source_document_id"], "d2");
    assert_eq!(records[1]["source_document_id"], "d3");

    // A details call without an entity id is an error, not a miss.
    let err = router
        .route(
            "detailed notes gathered from every document about one task by entity id",
            "milestone",
            PROJECT,
            &json!({}),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("entity_id"));
}

#[tokio::test]
async fn custom_handler_from_another_agent() {
    let mut router = store_router(Arc::new(InMemoryStore::new())).await;
    router
        .register(
            "reporting",
            "weekly_digest",
            "Summarize the weekly status report digest for stakeholders",
            Arc::new(WeeklyDigest),
        )
        .await
        .unwrap();

    let hit = router
        .route(
            "weekly status digest for stakeholders",
            "bottleneck",
            PROJECT,
            &json!({ "week": 42 }),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hit.agent_name, "reporting");
    assert_eq!(hit.data, json!({ "project": PROJECT, "week": 42 }));

    let dup = router
        .register("reporting", "weekly_digest", "anything", Arc::new(WeeklyDigest))
        .await;
    assert!(dup.is_err());
}
