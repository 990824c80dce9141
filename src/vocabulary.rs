//! Brick class vocabulary
//!
//! Equipment classes ship as one class per line; point classes as a single
//! comma-separated list. Both are trimmed and de-duplicated in first-seen
//! order before they are embedded into a label index.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::config::EmbeddingBatchConfig;
use crate::error::ServiceError;
use crate::retry::RetryPolicy;
use crate::services::{embed_in_batches, EmbeddingService, InMemoryLabelIndex};
use crate::types::EntityKind;

/// Candidate Brick classes per label partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vocabulary {
    pub equipment: Vec<String>,
    pub points: Vec<String>,
}

impl Vocabulary {
    pub fn from_texts(equipment: &str, points: &str) -> Self {
        Self {
            equipment: parse_list(equipment.lines()),
            points: parse_list(points.split(',')),
        }
    }

    pub fn from_files(equipment: impl AsRef<Path>, points: impl AsRef<Path>) -> Result<Self> {
        let equipment = equipment.as_ref();
        let points = points.as_ref();
        let equipment_text = std::fs::read_to_string(equipment)
            .with_context(|| format!("Failed to read equipment list {}", equipment.display()))?;
        let point_text = std::fs::read_to_string(points)
            .with_context(|| format!("Failed to read point list {}", points.display()))?;

        let vocabulary = Self::from_texts(&equipment_text, &point_text);
        info!(
            equipment = vocabulary.equipment.len(),
            points = vocabulary.points.len(),
            "Loaded Brick vocabulary"
        );
        Ok(vocabulary)
    }

    pub fn labels(&self, kind: EntityKind) -> &[String] {
        match kind {
            EntityKind::Device => &self.equipment,
            EntityKind::Point => &self.points,
        }
    }

    /// Embed every label and load it into an in-memory index.
    pub async fn build_index(
        &self,
        embedder: Arc<dyn EmbeddingService>,
        limits: &EmbeddingBatchConfig,
        retry: &RetryPolicy,
    ) -> Result<InMemoryLabelIndex, ServiceError> {
        let mut index = InMemoryLabelIndex::new(embedder.clone());
        for kind in EntityKind::all() {
            let labels = self.labels(kind);
            let vectors = embed_in_batches(embedder.as_ref(), labels, limits, retry).await?;
            for (label, vector) in labels.iter().zip(vectors) {
                index.insert(kind, label.clone(), vector);
            }
            info!(%kind, labels = labels.len(), "Indexed label partition");
        }
        Ok(index)
    }
}

fn parse_list<'a>(items: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.to_string()))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EmbeddingVector;
    use async_trait::async_trait;

    struct LengthEmbedder;

    #[async_trait]
    impl EmbeddingService for LengthEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>, ServiceError> {
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    #[test]
    fn test_parse_formats() {
        let vocabulary = Vocabulary::from_texts(
            "AHU\nChiller\n\n  VAV  \nAHU\n",
            "Supply_Air_Temperature_Sensor, Zone_Air_Temperature_Sensor,,\
             Supply_Air_Temperature_Sensor",
        );
        assert_eq!(vocabulary.equipment, vec!["AHU", "Chiller", "VAV"]);
        assert_eq!(
            vocabulary.points,
            vec!["Supply_Air_Temperature_Sensor", "Zone_Air_Temperature_Sensor"]
        );
    }

    #[test]
    fn test_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let eq = dir.path().join("equipment.txt");
        let pt = dir.path().join("points.txt");
        std::fs::write(&eq, "AHU\nBoiler\n").unwrap();
        std::fs::write(&pt, "Damper_Position_Command").unwrap();

        let vocabulary = Vocabulary::from_files(&eq, &pt).unwrap();
        assert_eq!(vocabulary.labels(EntityKind::Device), ["AHU", "Boiler"]);
        assert_eq!(
            vocabulary.labels(EntityKind::Point),
            ["Damper_Position_Command"]
        );
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Vocabulary::from_files(dir.path().join("nope.txt"), dir.path().join("nope2.txt"))
            .unwrap_err();
        assert!(err.to_string().contains("equipment list"));
    }

    #[tokio::test]
    async fn test_build_index_partitions() {
        let vocabulary = Vocabulary::from_texts("AHU\nChiller", "Zone_Air_Temperature_Sensor");
        let index = vocabulary
            .build_index(
                Arc::new(LengthEmbedder),
                &EmbeddingBatchConfig::default(),
                &RetryPolicy::none(),
            )
            .await
            .unwrap();
        assert_eq!(index.len(EntityKind::Device), 2);
        assert_eq!(index.len(EntityKind::Point), 1);
        assert_eq!(index.labels(EntityKind::Device), vec!["AHU", "Chiller"]);
    }
}
