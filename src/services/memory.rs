//! In-memory collaborators
//!
//! Good for tests, small vocabularies and one-shot runs where the label set
//! fits in memory and nothing needs to survive the process.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{CandidateRetriever, EmbeddingService, EmbeddingUpdate, GraphStore, StoredEntity};
use crate::clustering::cosine_distance;
use crate::error::ServiceError;
use crate::types::{EmbeddingVector, Entity, EntityId, EntityKind};

/// Brick labels with their embeddings, partitioned by entity kind.
///
/// Queries are embedded through the injected [`EmbeddingService`] and ranked
/// by cosine similarity. Ties keep insertion order.
pub struct InMemoryLabelIndex {
    embedder: Arc<dyn EmbeddingService>,
    partitions: HashMap<EntityKind, Vec<(String, EmbeddingVector)>>,
}

impl InMemoryLabelIndex {
    pub fn new(embedder: Arc<dyn EmbeddingService>) -> Self {
        Self {
            embedder,
            partitions: HashMap::new(),
        }
    }

    /// Add a label. A label already present in the partition is ignored.
    pub fn insert(
        &mut self,
        kind: EntityKind,
        label: impl Into<String>,
        embedding: EmbeddingVector,
    ) {
        let label = label.into();
        let partition = self.partitions.entry(kind).or_default();
        if !partition.iter().any(|(l, _)| *l == label) {
            partition.push((label, embedding));
        }
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        self.partitions.get(&kind).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.values().all(Vec::is_empty)
    }

    pub fn labels(&self, kind: EntityKind) -> Vec<&str> {
        self.partitions
            .get(&kind)
            .map(|p| p.iter().map(|(l, _)| l.as_str()).collect())
            .unwrap_or_default()
    }

    /// Rank a partition against an already-embedded query.
    pub fn nearest(&self, query: &[f32], kind: EntityKind, top_k: usize) -> Vec<String> {
        let Some(partition) = self.partitions.get(&kind) else {
            return Vec::new();
        };
        let mut scored: Vec<(usize, f64)> = partition
            .iter()
            .enumerate()
            .map(|(i, (_, emb))| (i, cosine_distance(query, emb)))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        scored
            .into_iter()
            .take(top_k)
            .map(|(i, _)| partition[i].0.clone())
            .collect()
    }
}

#[async_trait]
impl CandidateRetriever for InMemoryLabelIndex {
    async fn retrieve(
        &self,
        query: &str,
        kind: EntityKind,
        top_k: usize,
    ) -> Result<Vec<String>, ServiceError> {
        if self.len(kind) == 0 || top_k == 0 {
            return Ok(Vec::new());
        }
        let embedded = self.embedder.embed(&[query.to_string()]).await?;
        let query_vec = embedded
            .into_iter()
            .next()
            .ok_or(ServiceError::Empty { service: "embedding" })?;
        Ok(self.nearest(&query_vec, kind, top_k))
    }
}

#[derive(Default)]
struct GraphState {
    entities: BTreeMap<EntityId, StoredEntity>,
    assertions: BTreeSet<(EntityId, String)>,
}

/// Entity/assertion store kept in process memory.
#[derive(Default)]
pub struct InMemoryGraphStore {
    state: Mutex<GraphState>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, GraphState>, ServiceError> {
        self.state
            .lock()
            .map_err(|_| ServiceError::rejected("graph", "store lock poisoned"))
    }

    /// Register an entity, replacing any previous record with the same id.
    pub fn insert_entity(&self, entity: Entity, embedding: Option<EmbeddingVector>) {
        if let Ok(mut state) = self.state.lock() {
            state
                .entities
                .insert(entity.id.clone(), StoredEntity::new(entity, embedding));
        }
    }

    /// Classes asserted for one entity.
    pub fn classes_of(&self, entity_id: &EntityId) -> Vec<String> {
        self.state
            .lock()
            .map(|state| {
                state
                    .assertions
                    .iter()
                    .filter(|(id, _)| id == entity_id)
                    .map(|(_, class)| class.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn assertion_count(&self) -> usize {
        self.state.lock().map(|s| s.assertions.len()).unwrap_or(0)
    }

    pub fn embedding_of(&self, entity_id: &EntityId) -> Option<EmbeddingVector> {
        self.state
            .lock()
            .ok()?
            .entities
            .get(entity_id)
            .and_then(|s| s.embedding.clone())
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn upsert(&self, entity_id: &EntityId, class: &str) -> Result<(), ServiceError> {
        self.lock()?
            .assertions
            .insert((entity_id.clone(), class.to_string()));
        Ok(())
    }

    async fn upsert_many(&self, entity_ids: &[EntityId], class: &str) -> Result<(), ServiceError> {
        // One lock for the whole batch: readers see all or none of it.
        let mut state = self.lock()?;
        for id in entity_ids {
            state.assertions.insert((id.clone(), class.to_string()));
        }
        Ok(())
    }

    async fn fetch_embeddings(&self, kind: EntityKind) -> Result<Vec<StoredEntity>, ServiceError> {
        Ok(self
            .lock()?
            .entities
            .values()
            .filter(|s| s.entity.kind == kind)
            .cloned()
            .collect())
    }

    async fn store_embeddings(&self, updates: &[EmbeddingUpdate]) -> Result<(), ServiceError> {
        let mut state = self.lock()?;
        for update in updates {
            if let Some(stored) = state.entities.get_mut(&update.id) {
                stored.embedding = Some(update.embedding.clone());
                stored.cleaned_name = update.cleaned_name.clone();
            }
        }
        Ok(())
    }
}
