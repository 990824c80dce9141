//! Postgres + pgvector collaborators
//!
//! Schema (created by [`ensure_schema`]):
//!
//! ```sql
//! brick_labels     (kind, label, embedding vector)                -- candidate vocabulary
//! bacnet_entities  (id, name, kind, embedding vector, clean_name) -- harvested entities
//! entity_classes   (entity_id, class)                             -- asserted Brick classes
//! ```

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::{CandidateRetriever, EmbeddingService, EmbeddingUpdate, GraphStore, StoredEntity};
use crate::error::ServiceError;
use crate::types::{EmbeddingVector, Entity, EntityId, EntityKind};

/// Create the tables used by [`PgLabelIndex`] and [`PgGraphStore`].
pub async fn ensure_schema(pool: &PgPool) -> Result<(), ServiceError> {
    let statements = [
        "CREATE EXTENSION IF NOT EXISTS vector",
        r#"
        CREATE TABLE IF NOT EXISTS brick_labels (
            kind TEXT NOT NULL,
            label TEXT NOT NULL,
            embedding vector NOT NULL,
            PRIMARY KEY (kind, label)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS bacnet_entities (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            embedding vector
        )
        "#,
        "ALTER TABLE bacnet_entities ADD COLUMN IF NOT EXISTS clean_name TEXT",
        r#"
        CREATE TABLE IF NOT EXISTS entity_classes (
            entity_id TEXT NOT NULL,
            class TEXT NOT NULL,
            PRIMARY KEY (entity_id, class)
        )
        "#,
    ];
    for sql in statements {
        sqlx::query(sql).execute(pool).await?;
    }
    Ok(())
}

/// Label vocabulary searched by cosine distance in Postgres.
pub struct PgLabelIndex {
    pool: PgPool,
    embedder: Arc<dyn EmbeddingService>,
}

impl PgLabelIndex {
    pub fn new(pool: PgPool, embedder: Arc<dyn EmbeddingService>) -> Self {
        Self { pool, embedder }
    }

    /// Store label embeddings. Existing labels are left untouched.
    pub async fn insert_labels(
        &self,
        kind: EntityKind,
        labels: &[(String, EmbeddingVector)],
    ) -> Result<usize, ServiceError> {
        let names: Vec<&str> = labels.iter().map(|(l, _)| l.as_str()).collect();
        let vectors: Vec<Vector> = labels.iter().map(|(_, e)| Vector::from(e.clone())).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO brick_labels (kind, label, embedding)
            SELECT $1, u.label, u.embedding
            FROM UNNEST($2::text[], $3::vector[]) AS u(label, embedding)
            ON CONFLICT (kind, label) DO NOTHING
            "#,
        )
        .bind(kind.as_str())
        .bind(&names)
        .bind(&vectors)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() as usize;
        info!(%kind, inserted, "Inserted label embeddings");
        Ok(inserted)
    }
}

#[async_trait]
impl CandidateRetriever for PgLabelIndex {
    #[instrument(skip(self, query), fields(query_len = query.len()))]
    async fn retrieve(
        &self,
        query: &str,
        kind: EntityKind,
        top_k: usize,
    ) -> Result<Vec<String>, ServiceError> {
        let embedded = self.embedder.embed(&[query.to_string()]).await?;
        let query_vec = embedded
            .into_iter()
            .next()
            .ok_or(ServiceError::Empty { service: "embedding" })?;

        let rows = sqlx::query_as::<_, (String,)>(
            r#"
            SELECT label
            FROM brick_labels
            WHERE kind = $1
            ORDER BY embedding <=> $2::vector, label
            LIMIT $3
            "#,
        )
        .bind(kind.as_str())
        .bind(Vector::from(query_vec))
        .bind(top_k as i64)
        .fetch_all(&self.pool)
        .await?;

        debug!(hits = rows.len(), "Label search complete");
        Ok(rows.into_iter().map(|(label,)| label).collect())
    }
}

/// Entity and class-assertion store in Postgres.
pub struct PgGraphStore {
    pool: PgPool,
}

impl PgGraphStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register harvested entities. Existing rows keep their embeddings.
    pub async fn insert_entities(&self, entities: &[Entity]) -> Result<usize, ServiceError> {
        let ids: Vec<&str> = entities.iter().map(|e| e.id.as_str()).collect();
        let names: Vec<&str> = entities.iter().map(|e| e.name.as_str()).collect();
        let kinds: Vec<&str> = entities.iter().map(|e| e.kind.as_str()).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO bacnet_entities (id, name, kind)
            SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[])
            ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, kind = EXCLUDED.kind
            "#,
        )
        .bind(&ids)
        .bind(&names)
        .bind(&kinds)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl GraphStore for PgGraphStore {
    async fn upsert(&self, entity_id: &EntityId, class: &str) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO entity_classes (entity_id, class)
            VALUES ($1, $2)
            ON CONFLICT (entity_id, class) DO NOTHING
            "#,
        )
        .bind(entity_id.as_str())
        .bind(class)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, entity_ids), fields(members = entity_ids.len()))]
    async fn upsert_many(&self, entity_ids: &[EntityId], class: &str) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;
        for id in entity_ids {
            sqlx::query(
                r#"
                INSERT INTO entity_classes (entity_id, class)
                VALUES ($1, $2)
                ON CONFLICT (entity_id, class) DO NOTHING
                "#,
            )
            .bind(id.as_str())
            .bind(class)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn fetch_embeddings(&self, kind: EntityKind) -> Result<Vec<StoredEntity>, ServiceError> {
        let rows = sqlx::query_as::<_, (String, String, Option<Vector>, Option<String>)>(
            r#"
            SELECT id, name, embedding, clean_name
            FROM bacnet_entities
            WHERE kind = $1
            ORDER BY id
            "#,
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, name, embedding, cleaned_name)| StoredEntity {
                entity: Entity::new(id, name, kind),
                embedding: embedding.map(|v| v.to_vec()),
                cleaned_name,
            })
            .collect())
    }

    async fn store_embeddings(&self, updates: &[EmbeddingUpdate]) -> Result<(), ServiceError> {
        let ids: Vec<&str> = updates.iter().map(|u| u.id.as_str()).collect();
        let vectors: Vec<Vector> = updates
            .iter()
            .map(|u| Vector::from(u.embedding.clone()))
            .collect();
        let names: Vec<Option<&str>> = updates.iter().map(|u| u.cleaned_name.as_deref()).collect();

        sqlx::query(
            r#"
            UPDATE bacnet_entities AS e
            SET embedding = u.embedding, clean_name = u.clean_name
            FROM UNNEST($1::text[], $2::vector[], $3::text[]) AS u(id, embedding, clean_name)
            WHERE e.id = u.id
            "#,
        )
        .bind(&ids)
        .bind(&vectors)
        .bind(&names)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
