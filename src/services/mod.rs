//! External collaborators
//!
//! The pipeline only ever talks to these traits. Implementations:
//!
//! | Trait                             | In-memory              | Remote                      |
//! |-----------------------------------|------------------------|-----------------------------|
//! | [`EmbeddingService`]              |                        | `openai::OpenAiClient`      |
//! | [`CandidateRetriever`]            | `InMemoryLabelIndex`   | `postgres::PgLabelIndex`    |
//! | [`GenerativeClassificationService`] |                      | `openai::OpenAiClient`      |
//! | [`GraphStore`]                    | `InMemoryGraphStore`   | `postgres::PgGraphStore`    |

pub mod memory;
pub mod openai;
#[cfg(feature = "database")]
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::EmbeddingBatchConfig;
use crate::error::ServiceError;
use crate::retry::RetryPolicy;
use crate::types::{EmbeddingVector, Entity, EntityId, EntityKind};

pub use memory::{InMemoryGraphStore, InMemoryLabelIndex};
pub use openai::OpenAiClient;

/// Text → vector. One output per input, same order.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>, ServiceError>;
}

/// Nearest Brick classes for a query, restricted to one label partition.
#[async_trait]
pub trait CandidateRetriever: Send + Sync {
    /// At most `top_k` labels, most similar first.
    async fn retrieve(
        &self,
        query: &str,
        kind: EntityKind,
        top_k: usize,
    ) -> Result<Vec<String>, ServiceError>;
}

/// Low-temperature text completion.
#[async_trait]
pub trait GenerativeClassificationService: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, ServiceError>;

    fn model_name(&self) -> &str;
}

/// An entity as held by the graph store, with its embedding if computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntity {
    pub entity: Entity,
    pub embedding: Option<EmbeddingVector>,
    /// Cleaned name the embedding was computed from, if names were cleaned.
    pub cleaned_name: Option<String>,
}

impl StoredEntity {
    pub fn new(entity: Entity, embedding: Option<EmbeddingVector>) -> Self {
        Self {
            entity,
            embedding,
            cleaned_name: None,
        }
    }

    /// Text that represents the entity downstream: the cleaned name when one
    /// was stored, the raw name otherwise.
    pub fn effective_name(&self) -> &str {
        self.cleaned_name.as_deref().unwrap_or(&self.entity.name)
    }
}

/// A freshly computed embedding, with the cleaned name it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingUpdate {
    pub id: EntityId,
    pub embedding: EmbeddingVector,
    pub cleaned_name: Option<String>,
}

/// Knowledge graph holding entities, their embeddings and class assertions.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Assert `class` for one entity. Repeating an assertion is a no-op.
    async fn upsert(&self, entity_id: &EntityId, class: &str) -> Result<(), ServiceError>;

    /// Assert `class` for every entity, all or nothing.
    async fn upsert_many(&self, entity_ids: &[EntityId], class: &str)
        -> Result<(), ServiceError>;

    /// Entities of one kind, ordered by id.
    async fn fetch_embeddings(&self, kind: EntityKind) -> Result<Vec<StoredEntity>, ServiceError>;

    /// Persist embeddings computed for entities that had none, along with
    /// any cleaned name so later runs reuse it.
    async fn store_embeddings(&self, updates: &[EmbeddingUpdate]) -> Result<(), ServiceError>;
}

/// Rough token count used for request sizing.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4).max(1)
}

/// Split `texts` into request-sized index ranges.
///
/// A batch closes when adding the next text would exceed the token budget or
/// the batch is full. A single text over budget still gets its own batch.
pub fn plan_batches(
    texts: &[String],
    limits: &EmbeddingBatchConfig,
) -> Vec<std::ops::Range<usize>> {
    let mut batches = Vec::new();
    let mut start = 0;
    let mut tokens = 0;
    for (i, text) in texts.iter().enumerate() {
        let t = estimate_tokens(text);
        let len = i - start;
        if len > 0 && (tokens + t > limits.max_tokens_per_batch || len >= limits.max_batch_len) {
            batches.push(start..i);
            start = i;
            tokens = 0;
        }
        tokens += t;
    }
    if start < texts.len() {
        batches.push(start..texts.len());
    }
    batches
}

/// Embed `texts` in bounded requests, each retried under `retry`.
///
/// Results are concatenated in input order.
pub async fn embed_in_batches(
    service: &dyn EmbeddingService,
    texts: &[String],
    limits: &EmbeddingBatchConfig,
    retry: &RetryPolicy,
) -> Result<Vec<EmbeddingVector>, ServiceError> {
    let mut out = Vec::with_capacity(texts.len());
    for range in plan_batches(texts, limits) {
        let batch = &texts[range.clone()];
        debug!(start = range.start, len = batch.len(), "Embedding batch");
        let vectors = retry.run("embed", || service.embed(batch)).await?;
        if vectors.len() != batch.len() {
            return Err(ServiceError::rejected(
                "embedding",
                format!("expected {} vectors, got {}", batch.len(), vectors.len()),
            ));
        }
        out.extend(vectors);
    }
    Ok(out)
}
