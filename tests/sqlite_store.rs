mod common;

use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;

use common::*;
use progress_tracker::config::Config;
use progress_tracker::documents::DocumentSource;
use progress_tracker::embedding::{Embedder, HashingEmbedder};
use progress_tracker::models::{
    ContextChunk, DetailRecord, Entity, EntityFilter, EntityKind, EntityPatch, KindFields,
};
use progress_tracker::pipeline::{Pipeline, Services};
use progress_tracker::store::sqlite::SqliteStore;
use progress_tracker::store::KnowledgeStore;
use progress_tracker::{db, migrate};

async fn open_store() -> (TempDir, Config, Arc<SqliteStore>) {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config();
    config.db.path = tmp.path().join("data").join("ptrack.sqlite");
    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    (tmp, config, Arc::new(SqliteStore::new(pool)))
}

fn task(id: &str, secs: i64) -> Entity {
    Entity {
        id: id.to_string(),
        project_id: PROJECT.to_string(),
        text: format!("Task {}", id),
        category: "Engineering".to_string(),
        priority: "High".to_string(),
        source_document_id: "d1".to_string(),
        created_at: ts(secs),
        fields: KindFields::Task {
            completion_status: true,
            final_completion_status: None,
            completion_fraction: None,
        },
    }
}

fn detail(parent: &str, doc_id: &str, text: &str) -> DetailRecord {
    DetailRecord {
        id: uuid::Uuid::new_v4().to_string(),
        parent_entity_id: parent.to_string(),
        project_id: PROJECT.to_string(),
        source_document_id: doc_id.to_string(),
        text: text.to_string(),
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let (_tmp, config, store) = open_store().await;
    migrate::apply(store.pool()).await.unwrap();
    migrate::run_migrations(&config).await.unwrap();
}

#[tokio::test]
async fn entity_roundtrip_keeps_kind_fields() {
    let (_tmp, _config, store) = open_store().await;
    let milestone = Entity {
        id: "m1".to_string(),
        project_id: PROJECT.to_string(),
        text: "Public beta".to_string(),
        category: "Product".to_string(),
        priority: "High".to_string(),
        source_document_id: "d1".to_string(),
        created_at: ts(5),
        fields: KindFields::Milestone {
            deadline: Some("2024-06-30".to_string()),
        },
    };
    store.put_entity(&milestone, None).await.unwrap();
    store.put_entity(&task("t1", 20), None).await.unwrap();
    store.put_entity(&task("t0", 10), None).await.unwrap();

    assert_eq!(store.get_entity("m1").await.unwrap().unwrap(), milestone);
    assert!(store.put_entity(&milestone, None).await.is_err());

    let tasks = store
        .get_entities(PROJECT, EntityKind::Task, &EntityFilter::default())
        .await
        .unwrap();
    let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["t0", "t1"]);
    assert!(matches!(
        tasks[0].fields,
        KindFields::Task {
            completion_status: true,
            ..
        }
    ));

    let filter = EntityFilter {
        category: Some("engineering".to_string()),
        ..Default::default()
    };
    assert_eq!(
        store
            .get_entities(PROJECT, EntityKind::Task, &filter)
            .await
            .unwrap()
            .len(),
        2
    );
    let filter = EntityFilter {
        priority: Some("Low".to_string()),
        ..Default::default()
    };
    assert!(store
        .get_entities(PROJECT, EntityKind::Task, &filter)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn details_keep_append_order_and_ignore_repeats() {
    let (_tmp, _config, store) = open_store().await;
    store.put_entity(&task("t1", 0), None).await.unwrap();

    assert!(store.append_detail("t1", &detail("t1", "d2", "second")).await.unwrap());
    assert!(store.append_detail("t1", &detail("t1", "d3", "third")).await.unwrap());
    assert!(!store.append_detail("t1", &detail("t1", "d2", "again")).await.unwrap());

    let details = store.get_details("t1").await.unwrap();
    let texts: Vec<&str> = details.iter().map(|d| d.text.as_str()).collect();
    assert_eq!(texts, vec!["second", "third"]);
    assert!(store.get_details("missing").await.unwrap().is_empty());
}

#[tokio::test]
async fn checkpoint_never_moves_backwards() {
    let (_tmp, _config, store) = open_store().await;
    assert!(store
        .get_checkpoint(PROJECT, EntityKind::Task)
        .await
        .unwrap()
        .is_none());

    assert_eq!(store.set_checkpoint(PROJECT, EntityKind::Task, ts(50)).await.unwrap(), ts(50));
    assert_eq!(store.set_checkpoint(PROJECT, EntityKind::Task, ts(20)).await.unwrap(), ts(50));
    let cp = store
        .get_checkpoint(PROJECT, EntityKind::Task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cp.last_update_at, ts(50));
    assert!(store
        .get_checkpoint(PROJECT, EntityKind::Milestone)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn patch_updates_only_task_verdicts() {
    let (_tmp, _config, store) = open_store().await;
    store.put_entity(&task("t1", 0), None).await.unwrap();

    let patch = EntityPatch {
        final_completion_status: Some(false),
        completion_fraction: Some(0.25),
        ..Default::default()
    };
    assert!(store.update_entity_fields("t1", &patch).await.unwrap());
    assert!(!store.update_entity_fields("nope", &patch).await.unwrap());

    let updated = store.get_entity("t1").await.unwrap().unwrap();
    assert_eq!(updated.category, "Engineering");
    assert_eq!(
        updated.fields,
        KindFields::Task {
            completion_status: true,
            final_completion_status: Some(false),
            completion_fraction: Some(0.25),
        }
    );
}

#[tokio::test]
async fn context_skips_chunks_without_embeddings() {
    let (_tmp, _config, store) = open_store().await;
    let mut parts = chunks("d1", "Embedded part.");
    parts.push(ContextChunk {
        chunk_index: 1,
        text: "Not embedded yet.".to_string(),
        vector: Vec::new(),
    });
    store.insert_document(&doc("d1", 10), &parts).await.unwrap();
    store.insert_document(&doc("d2", 20), &[]).await.unwrap();

    let listed = store.list(PROJECT).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].created_at, ts(10));

    let context = store.context(PROJECT, "d1").await.unwrap();
    assert_eq!(context.len(), 1);
    assert_eq!(context[0].text, "[d1] Embedded part.");
    assert!(!context[0].vector.is_empty());
    assert!(store.context(PROJECT, "d2").await.unwrap().is_empty());
}

#[tokio::test]
async fn vector_search_ranks_and_excludes_document() {
    let (_tmp, _config, store) = open_store().await;
    let embedder = HashingEmbedder::default();

    let mut near = task("near", 0);
    near.text = "Migrate billing database".to_string();
    let mut far = task("far", 1);
    far.text = "Plan team offsite".to_string();
    far.source_document_id = "d2".to_string();
    store
        .put_entity(&near, Some(&embedder.vectorize(&near.text)))
        .await
        .unwrap();
    store
        .put_entity(&far, Some(&embedder.vectorize(&far.text)))
        .await
        .unwrap();
    store.put_entity(&task("plain", 2), None).await.unwrap();

    let query = embedder.embed("billing database migration").await.unwrap();
    let hits = store
        .vector_search_entities(PROJECT, EntityKind::Task, &query, 5, None)
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].entity.id, "near");
    assert!(hits[0].score > hits[1].score);

    let hits = store
        .vector_search_entities(PROJECT, EntityKind::Task, &query, 5, Some("d1"))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].entity.id, "far");
}

#[tokio::test]
async fn pipeline_runs_end_to_end_on_sqlite() {
    let (_tmp, config, store) = open_store().await;
    store
        .insert_document(&doc("d1", 10), &chunks("d1", "Auth service rewrite kicked off."))
        .await
        .unwrap();
    store
        .insert_document(&doc("d2", 20), &chunks("d2", "Auth rewrite half done."))
        .await
        .unwrap();

    let llm = ScriptedLlm::new(|prompt| {
        if is_completion_prompt(prompt) {
            return Ok(if doc_tag(prompt) == Some("d2") { "1" } else { "0" }.to_string());
        }
        Ok(format!(
            r#"[{{"text": "Rewrite auth service {}", "category": "Backend"}}]"#,
            doc_tag(prompt).unwrap_or("")
        ))
    });
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::default());
    let services = Services {
        store: store.clone(),
        documents: store.clone(),
        llm,
        embedder,
    };
    let pipeline = Pipeline::new(services, &config);

    let summary = pipeline.run(PROJECT, EntityKind::Task).await.unwrap();
    assert_eq!(summary.entities_created, 1);
    assert_eq!(summary.details_attached, 1);
    assert_eq!(summary.checkpoint_advanced_to, Some(ts(20)));

    let tasks = store
        .get_entities(PROJECT, EntityKind::Task, &EntityFilter::default())
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].category, "Backend");
    // One of two documents says done: exactly half counts as complete.
    assert!(matches!(
        tasks[0].fields,
        KindFields::Task {
            final_completion_status: Some(true),
            ..
        }
    ));
    let details = store.get_details(&tasks[0].id).await.unwrap();
    assert_eq!(details.len(), 1);
    assert_eq!(details[0].source_document_id, "d2");

    let again = pipeline.run(PROJECT, EntityKind::Task).await.unwrap();
    assert_eq!(again.documents_seen, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_serialize_per_parent() {
    let (_tmp, _config, store) = open_store().await;
    store.put_entity(&task("t1", 0), None).await.unwrap();
    store.put_entity(&task("t2", 1), None).await.unwrap();

    let mut set = tokio::task::JoinSet::new();
    for i in 0..12 {
        for parent in ["t1", "t2"] {
            let store = store.clone();
            set.spawn(async move {
                let doc_id = format!("d{}", i);
                store
                    .append_detail(parent, &detail(parent, &doc_id, &doc_id))
                    .await
                    .unwrap()
            });
        }
    }
    // Same (parent, document) from two writers at once.
    for _ in 0..2 {
        let store = store.clone();
        set.spawn(async move {
            store
                .append_detail("t1", &detail("t1", "d-dup", "dup"))
                .await
                .unwrap()
        });
    }

    let mut appended = 0;
    while let Some(res) = set.join_next().await {
        if res.unwrap() {
            appended += 1;
        }
    }
    assert_eq!(appended, 25);

    for (parent, rows) in [("t1", 13), ("t2", 12)] {
        let seqs: Vec<i64> = sqlx::query_scalar(
            "SELECT seq FROM entity_details WHERE parent_entity_id = ? ORDER BY rowid",
        )
        .bind(parent)
        .fetch_all(store.pool())
        .await
        .unwrap();
        assert_eq!(seqs.len(), rows);
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "seq not increasing: {:?}", seqs);
        assert_eq!(seqs, (1..=rows as i64).collect::<Vec<_>>());
    }

    let dups = store
        .get_details("t1")
        .await
        .unwrap()
        .into_iter()
        .filter(|d| d.source_document_id == "d-dup")
        .count();
    assert_eq!(dups, 1);
}
