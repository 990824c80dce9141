//! Per-kind runs that load entities from the graph store.

mod helpers;

use std::sync::Arc;

use brick_classifier::services::{GraphStore, InMemoryGraphStore};
use brick_classifier::vocabulary::Vocabulary;
use brick_classifier::{
    ClusterOutcome, Coordinator, Entity, EntityId, EntityKind, PipelineConfig, PipelineState,
};
use helpers::*;

fn seeded_store(with_embeddings: bool) -> Arc<InMemoryGraphStore> {
    let (entities, vectors) = two_groups_with_outlier();
    let store = Arc::new(InMemoryGraphStore::new());
    for (i, (entity, vector)) in entities.into_iter().zip(vectors).enumerate() {
        // Odd entities arrive without embeddings unless asked otherwise.
        let embedding = (with_embeddings || i % 2 == 0).then_some(vector);
        store.insert_entity(entity, embedding);
    }
    store
}

fn embedder_for_fixture() -> MockEmbedder {
    let (entities, vectors) = two_groups_with_outlier();
    let pairs: Vec<(&str, Vec<f32>)> = entities
        .iter()
        .zip(vectors.iter())
        .map(|(e, v)| (e.name.as_str(), v.clone()))
        .collect();
    MockEmbedder::new(&pairs)
}

#[tokio::test]
async fn test_run_kind_embeds_missing_vectors() {
    let store = seeded_store(false);
    let embedder = Arc::new(embedder_for_fixture());
    let coordinator = Coordinator::new(
        PipelineConfig::default(),
        Arc::new(MockRetriever::new(&["AHU", "VAV"])),
        Arc::new(MockLlm::always("AHU")),
        store.clone(),
    )
    .with_embedder(embedder.clone());

    let report = coordinator.run_kind(EntityKind::Device).await.unwrap();

    assert_eq!(report.state, PipelineState::Done);
    assert_eq!(report.entities, 7);
    assert_eq!(report.unembedded, 0);
    assert_eq!(report.total, 2);
    assert_eq!(report.noise, 1);
    assert!(report.timings.hydration_ms.is_some());
    // Three missing vectors fit in one batch.
    assert_eq!(embedder.calls(), 1);
    assert_eq!(
        store.embedding_of(&EntityId::from("dev:1")),
        Some(vec![0.0, 1.0])
    );
}

#[tokio::test]
async fn test_run_kind_without_embedder_skips_unembedded() {
    let store = seeded_store(false);
    let coordinator = Coordinator::new(
        PipelineConfig::default(),
        Arc::new(MockRetriever::new(&["AHU"])),
        Arc::new(MockLlm::always("AHU")),
        store,
    );

    let report = coordinator.run_kind(EntityKind::Device).await.unwrap();

    assert_eq!(report.entities, 4);
    assert_eq!(report.unembedded, 3);
}

#[tokio::test]
async fn test_run_all_processes_devices_then_points() {
    let store = seeded_store(true);
    store.insert_entity(Entity::point("pt:0", "SAT-1"), Some(vec![0.0, 0.0]));
    store.insert_entity(Entity::point("pt:1", "SAT-2"), Some(vec![0.0, 0.5]));
    store.insert_entity(Entity::point("pt:2", "SAT-3"), Some(vec![0.5, 0.0]));

    let mut config = PipelineConfig::default();
    config.clustering.eps = Some(1.0);
    let coordinator = Coordinator::new(
        config,
        Arc::new(MockRetriever::new(&["AHU", "Supply_Air_Temperature_Sensor"])),
        Arc::new(MockLlm::new(|_, user| {
            Ok(if user.starts_with("SAT") {
                "Supply_Air_Temperature_Sensor"
            } else {
                "AHU"
            }
            .to_string())
        })),
        store.clone(),
    );

    let reports = coordinator.run_all().await.unwrap();

    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].kind, EntityKind::Device);
    assert_eq!(reports[1].kind, EntityKind::Point);
    assert_eq!(reports[1].total, 1);
    assert_eq!(
        reports[1].results[0].outcome,
        ClusterOutcome::Classified {
            label: "Supply_Air_Temperature_Sensor".to_string()
        }
    );
    assert_eq!(
        store.classes_of(&EntityId::from("pt:2")),
        vec!["Supply_Air_Temperature_Sensor".to_string()]
    );
}

#[tokio::test]
async fn test_point_names_cleaned_before_classification() {
    let store = Arc::new(InMemoryGraphStore::new());
    for (i, name) in ["B1.F2.SAT", "B1.F3.SAT", "B2.F1.SAT"].iter().enumerate() {
        store.insert_entity(Entity::point(format!("pt:{}", i), *name), None);
    }
    let embedder = Arc::new(MockEmbedder::new(&[("SAT", vec![1.0, 1.0])]));
    let llm = Arc::new(MockLlm::new(|system, user| {
        if system.starts_with("You streamline") {
            Ok(user
                .lines()
                .map(|l| l.rsplit('.').next().unwrap_or(l))
                .collect::<Vec<_>>()
                .join("\n"))
        } else {
            Ok("Supply_Air_Temperature_Sensor".to_string())
        }
    }));

    let mut config = PipelineConfig::default();
    config.clean_point_names = true;
    let coordinator = Coordinator::new(
        config,
        Arc::new(MockRetriever::new(&["Supply_Air_Temperature_Sensor"])),
        llm.clone(),
        store.clone(),
    )
    .with_embedder(embedder);

    let report = coordinator.run_kind(EntityKind::Point).await.unwrap();

    // Identical cleaned names embed to one vector; the fallback radius
    // still groups them.
    assert_eq!(report.total, 1);
    assert_eq!(report.classified, 1);
    let users = llm.users.lock().unwrap().clone();
    assert_eq!(users.last().map(String::as_str), Some("SAT\nSAT\nSAT"));
}

#[tokio::test]
async fn test_cleaned_names_are_stored_and_reused() {
    let store = Arc::new(InMemoryGraphStore::new());
    for (i, name) in ["B1.F2.SAT", "B1.F3.SAT", "B2.F1.SAT"].iter().enumerate() {
        store.insert_entity(Entity::point(format!("pt:{}", i), *name), None);
    }
    // Already embedded before cleaning was switched on: keeps its raw name.
    store.insert_entity(Entity::point("pt:9", "B9.F9.RAT"), Some(vec![50.0, 50.0]));
    let embedder = Arc::new(MockEmbedder::new(&[("SAT", vec![1.0, 1.0])]));
    let llm = Arc::new(MockLlm::new(|system, user| {
        if system.starts_with("You streamline") {
            Ok(user
                .lines()
                .map(|l| l.rsplit('.').next().unwrap_or(l))
                .collect::<Vec<_>>()
                .join("\n"))
        } else {
            Ok("Supply_Air_Temperature_Sensor".to_string())
        }
    }));

    let mut config = PipelineConfig::default();
    config.clean_point_names = true;
    let coordinator = Coordinator::new(
        config,
        Arc::new(MockRetriever::new(&["Supply_Air_Temperature_Sensor"])),
        llm.clone(),
        store.clone(),
    )
    .with_embedder(embedder.clone());

    let first = coordinator.run_kind(EntityKind::Point).await.unwrap();
    assert_eq!(first.classified, 1);
    // One cleaning call covering only the three unembedded points.
    let cleaning: Vec<String> = llm
        .users
        .lock()
        .unwrap()
        .iter()
        .filter(|u| u.contains("B1.F2.SAT"))
        .cloned()
        .collect();
    assert_eq!(cleaning, vec!["B1.F2.SAT\nB1.F3.SAT\nB2.F1.SAT".to_string()]);
    assert_eq!(llm.calls(), 2);

    let stored = store.fetch_embeddings(EntityKind::Point).await.unwrap();
    let names: Vec<&str> = stored.iter().map(|s| s.effective_name()).collect();
    assert_eq!(names, vec!["SAT", "SAT", "SAT", "B9.F9.RAT"]);

    let second = coordinator.run_kind(EntityKind::Point).await.unwrap();

    assert_eq!(second.unembedded, 0);
    assert_eq!(second.classified, 1);
    // Only the classification call: nothing was cleaned or embedded again.
    assert_eq!(llm.calls(), 3);
    assert_eq!(embedder.calls(), 1);
    let users = llm.users.lock().unwrap().clone();
    assert_eq!(users.last().map(String::as_str), Some("SAT\nSAT\nSAT"));
}

#[tokio::test]
async fn test_vocabulary_index_drives_retrieval() {
    let vocabulary = Vocabulary::from_texts("AHU\nVAV", "Zone_Air_Temperature_Sensor");
    let embedder = Arc::new(MockEmbedder::new(&[
        ("AHU", vec![1.0, 0.0]),
        ("VAV", vec![0.0, 1.0]),
        ("Zone_Air_Temperature_Sensor", vec![1.0, 1.0]),
        ("AHU-1\nAHU-2\nAHU-3", vec![0.9, 0.1]),
        ("VAV-1\nVAV-2\nVAV-3", vec![0.1, 0.9]),
    ]));
    let index = vocabulary
        .build_index(
            embedder.clone(),
            &Default::default(),
            &brick_classifier::retry::RetryPolicy::none(),
        )
        .await
        .unwrap();

    let (entities, vectors) = two_groups_with_outlier();
    let mut config = PipelineConfig::default();
    config.retrieval.top_k = 1;
    let graph = Arc::new(InMemoryGraphStore::new());
    // Echo the single candidate back, whatever it is.
    let llm = Arc::new(MockLlm::new(|system, _| {
        Ok(system
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or_default()
            .to_string())
    }));
    let coordinator = Coordinator::new(config, Arc::new(index), llm, graph.clone());

    let report = coordinator
        .run(EntityKind::Device, &entities, &vectors)
        .await
        .unwrap();

    assert_eq!(report.classified, 2);
    assert_eq!(report.results[0].candidates, vec!["AHU".to_string()]);
    assert_eq!(report.results[1].candidates, vec!["VAV".to_string()]);
    assert_eq!(graph.classes_of(&EntityId::from("dev:5")), vec!["VAV".to_string()]);
}
