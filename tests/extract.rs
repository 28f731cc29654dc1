mod common;

use std::sync::Arc;

use common::*;
use progress_tracker::config::ExtractionConfig;
use progress_tracker::embedding::{Embedder, HashingEmbedder};
use progress_tracker::extract::{EntityExtractor, TieBreak};
use progress_tracker::models::{Entity, EntityKind, KindFields};
use progress_tracker::store::memory::InMemoryStore;
use progress_tracker::store::KnowledgeStore;

fn milestone(id: &str, text: &str, doc_id: &str, secs: i64) -> Entity {
    Entity {
        id: id.to_string(),
        project_id: PROJECT.to_string(),
        text: text.to_string(),
        category: "Product".to_string(),
        priority: "Medium".to_string(),
        source_document_id: doc_id.to_string(),
        created_at: ts(secs),
        fields: KindFields::Milestone { deadline: None },
    }
}

async fn seed(store: &InMemoryStore, entity: &Entity) {
    let vector = HashingEmbedder::default().vectorize(&entity.text);
    store.put_entity(entity, Some(&vector)).await.unwrap();
}

fn extractor(store: Arc<InMemoryStore>, tie_break: TieBreak) -> EntityExtractor {
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::default());
    let settings = ExtractionConfig {
        tie_break,
        ..ExtractionConfig::default()
    };
    EntityExtractor::new(
        store.clone(),
        store,
        ScriptedLlm::new(|_| Ok("[]".to_string())),
        embedder,
        settings,
    )
}

#[tokio::test]
async fn finds_entity_describing_the_same_thing() {
    let store = Arc::new(InMemoryStore::new());
    seed(&store, &milestone("m-beta", "Launch public beta", "d1", 10)).await;
    seed(&store, &milestone("m-offsite", "Plan team offsite", "d2", 20)).await;
    let extractor = extractor(store, TieBreak::EarliestCreated);

    let hit = extractor
        .find_matching_entity(PROJECT, "launch the public beta", EntityKind::Milestone)
        .await
        .unwrap();
    assert_eq!(hit.as_deref(), Some("m-beta"));
}

#[tokio::test]
async fn unrelated_text_or_other_kind_is_a_miss() {
    let store = Arc::new(InMemoryStore::new());
    seed(&store, &milestone("m-beta", "Launch public beta", "d1", 10)).await;
    let extractor = extractor(store, TieBreak::EarliestCreated);

    let miss = extractor
        .find_matching_entity(PROJECT, "Hire security auditor", EntityKind::Milestone)
        .await
        .unwrap();
    assert!(miss.is_none());

    let other_kind = extractor
        .find_matching_entity(PROJECT, "Launch public beta", EntityKind::Task)
        .await
        .unwrap();
    assert!(other_kind.is_none());

    let other_project = extractor
        .find_matching_entity("proj-2", "Launch public beta", EntityKind::Milestone)
        .await
        .unwrap();
    assert!(other_project.is_none());
}

#[tokio::test]
async fn tie_break_setting_picks_earliest_or_latest() {
    let store = Arc::new(InMemoryStore::new());
    seed(&store, &milestone("m-late", "Ship mobile app", "d2", 20)).await;
    seed(&store, &milestone("m-early", "Ship mobile app", "d1", 10)).await;

    let earliest = extractor(store.clone(), TieBreak::EarliestCreated);
    let hit = earliest
        .find_matching_entity(PROJECT, "Ship mobile app", EntityKind::Milestone)
        .await
        .unwrap();
    assert_eq!(hit.as_deref(), Some("m-early"));

    let latest = extractor(store, TieBreak::LatestCreated);
    let hit = latest
        .find_matching_entity(PROJECT, "Ship mobile app", EntityKind::Milestone)
        .await
        .unwrap();
    assert_eq!(hit.as_deref(), Some("m-late"));
}

#[tokio::test]
async fn latest_created_sees_past_a_full_page_of_ties() {
    let store = Arc::new(InMemoryStore::new());
    for i in 0..40 {
        let id = format!("m-{:02}", i);
        seed(&store, &milestone(&id, "Quarterly release", &format!("d{}", i), i)).await;
    }

    let latest = extractor(store.clone(), TieBreak::LatestCreated);
    let hit = latest
        .find_matching_entity(PROJECT, "Quarterly release", EntityKind::Milestone)
        .await
        .unwrap();
    assert_eq!(hit.as_deref(), Some("m-39"));

    let earliest = extractor(store, TieBreak::EarliestCreated);
    let hit = earliest
        .find_matching_entity(PROJECT, "Quarterly release", EntityKind::Milestone)
        .await
        .unwrap();
    assert_eq!(hit.as_deref(), Some("m-00"));
}
