//! Mock collaborators shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use brick_classifier::services::{
    CandidateRetriever, EmbeddingService, EmbeddingUpdate, GenerativeClassificationService,
    GraphStore, InMemoryGraphStore, StoredEntity,
};
use brick_classifier::{EmbeddingVector, Entity, EntityId, EntityKind, ServiceError};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Two tight triangles of devices plus one far outlier.
///
/// Auto-selected radius is 1.0: clusters {AHU-*} and {VAV-*}, outlier noise.
pub fn two_groups_with_outlier() -> (Vec<Entity>, Vec<EmbeddingVector>) {
    let data = [
        ("AHU-1", [0.0, 0.0]),
        ("AHU-2", [0.0, 1.0]),
        ("AHU-3", [1.0, 0.0]),
        ("VAV-1", [10.0, 10.0]),
        ("VAV-2", [10.0, 11.0]),
        ("VAV-3", [11.0, 10.0]),
        ("Weird-Thing", [100.0, 100.0]),
    ];
    let entities = data
        .iter()
        .enumerate()
        .map(|(i, (name, _))| Entity::device(format!("dev:{}", i), *name))
        .collect();
    let vectors = data.iter().map(|(_, v)| v.to_vec()).collect();
    (entities, vectors)
}

/// `groups` triangles of three devices, 20 units apart. Needs `eps = 1.5`.
pub fn device_groups(groups: usize) -> (Vec<Entity>, Vec<EmbeddingVector>) {
    let mut entities = Vec::new();
    let mut vectors = Vec::new();
    for g in 0..groups {
        let base = g as f32 * 20.0;
        for (j, offset) in [[0.0, 0.0], [0.0, 1.0], [1.0, 0.0]].iter().enumerate() {
            let i = g * 3 + j;
            entities.push(Entity::device(format!("dev:{}", i), format!("G{}-{}", g, j)));
            vectors.push(vec![base + offset[0], offset[1]]);
        }
    }
    (entities, vectors)
}

pub fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Retriever
// ---------------------------------------------------------------------------

pub struct MockRetriever {
    candidates: Vec<String>,
    /// Queries containing this text fail permanently.
    fail_on: Option<String>,
    pub queries: Mutex<Vec<String>>,
}

impl MockRetriever {
    pub fn new(candidates: &[&str]) -> Self {
        Self {
            candidates: strings(candidates),
            fail_on: None,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_on(mut self, needle: &str) -> Self {
        self.fail_on = Some(needle.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.queries.lock().unwrap().len()
    }
}

#[async_trait]
impl CandidateRetriever for MockRetriever {
    async fn retrieve(
        &self,
        query: &str,
        _kind: EntityKind,
        top_k: usize,
    ) -> Result<Vec<String>, ServiceError> {
        self.queries.lock().unwrap().push(query.to_string());
        if let Some(needle) = &self.fail_on {
            if query.contains(needle.as_str()) {
                return Err(ServiceError::rejected("retriever", "index offline"));
            }
        }
        Ok(self.candidates.iter().take(top_k).cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Generative service
// ---------------------------------------------------------------------------

type Reply = Box<dyn Fn(&str, &str) -> Result<String, ServiceError> + Send + Sync>;

pub struct MockLlm {
    reply: Reply,
    pub calls: AtomicUsize,
    pub users: Mutex<Vec<String>>,
}

impl MockLlm {
    pub fn new<F>(reply: F) -> Self
    where
        F: Fn(&str, &str) -> Result<String, ServiceError> + Send + Sync + 'static,
    {
        Self {
            reply: Box::new(reply),
            calls: AtomicUsize::new(0),
            users: Mutex::new(Vec::new()),
        }
    }

    pub fn always(text: &str) -> Self {
        let text = text.to_string();
        Self::new(move |_, _| Ok(text.clone()))
    }

    pub fn failing() -> Self {
        Self::new(|_, _| Err(ServiceError::rejected("llm", "invalid api key")))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerativeClassificationService for MockLlm {
    async fn complete(&self, system: &str, user: &str) -> Result<String, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.users.lock().unwrap().push(user.to_string());
        (self.reply)(system, user)
    }

    fn model_name(&self) -> &str {
        "mock-llm"
    }
}

// ---------------------------------------------------------------------------
// Embedding service
// ---------------------------------------------------------------------------

pub struct MockEmbedder {
    vectors: HashMap<String, EmbeddingVector>,
    pub calls: AtomicUsize,
}

impl MockEmbedder {
    pub fn new(pairs: &[(&str, EmbeddingVector)]) -> Self {
        Self {
            vectors: pairs
                .iter()
                .map(|(name, v)| (name.to_string(), v.clone()))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingService for MockEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        texts
            .iter()
            .map(|t| {
                self.vectors.get(t).cloned().ok_or_else(|| {
                    ServiceError::rejected("embedder", format!("unknown text {}", t))
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Graph store
// ---------------------------------------------------------------------------

/// In-memory store whose `upsert_many` fails a set number of times first.
pub struct FlakyGraphStore {
    pub inner: InMemoryGraphStore,
    transient_failures: AtomicUsize,
    permanent: bool,
    pub upsert_many_calls: AtomicUsize,
}

impl FlakyGraphStore {
    pub fn transient(failures: usize) -> Self {
        Self {
            inner: InMemoryGraphStore::new(),
            transient_failures: AtomicUsize::new(failures),
            permanent: false,
            upsert_many_calls: AtomicUsize::new(0),
        }
    }

    pub fn permanent() -> Self {
        Self {
            permanent: true,
            ..Self::transient(0)
        }
    }

    pub fn upsert_many_calls(&self) -> usize {
        self.upsert_many_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GraphStore for FlakyGraphStore {
    async fn upsert(&self, entity_id: &EntityId, class: &str) -> Result<(), ServiceError> {
        self.inner.upsert(entity_id, class).await
    }

    async fn upsert_many(&self, entity_ids: &[EntityId], class: &str) -> Result<(), ServiceError> {
        self.upsert_many_calls.fetch_add(1, Ordering::SeqCst);
        if self.permanent {
            return Err(ServiceError::rejected("graph", "constraint violation"));
        }
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ServiceError::unavailable("graph", "connection reset"));
        }
        self.inner.upsert_many(entity_ids, class).await
    }

    async fn fetch_embeddings(&self, kind: EntityKind) -> Result<Vec<StoredEntity>, ServiceError> {
        self.inner.fetch_embeddings(kind).await
    }

    async fn store_embeddings(&self, updates: &[EmbeddingUpdate]) -> Result<(), ServiceError> {
        self.inner.store_embeddings(updates).await
    }
}
