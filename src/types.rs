//! Core data model shared by the clustering engines and the pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Brick schema namespace used to turn a class token into a class URI.
pub const BRICK_NAMESPACE: &str = "https://brickschema.org/schema/Brick#";

/// Opaque entity identifier (usually the BACnet device/point URI).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What an entity represents on the BACnet network. Also selects the label
/// partition (equipment classes vs point classes) used for retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Device,
    Point,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Device => "device",
            EntityKind::Point => "point",
        }
    }

    /// Both kinds, devices first.
    pub fn all() -> [EntityKind; 2] {
        [EntityKind::Device, EntityKind::Point]
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "device" | "equipment" => Ok(EntityKind::Device),
            "point" => Ok(EntityKind::Point),
            other => Err(format!(
                "Unknown entity kind '{}'. Valid values: device, point",
                other
            )),
        }
    }
}

/// A named building-automation entity harvested by an external ingestion step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub kind: EntityKind,
}

impl Entity {
    pub fn new(id: impl Into<EntityId>, name: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
        }
    }

    pub fn device(id: impl Into<EntityId>, name: impl Into<String>) -> Self {
        Self::new(id, name, EntityKind::Device)
    }

    pub fn point(id: impl Into<EntityId>, name: impl Into<String>) -> Self {
        Self::new(id, name, EntityKind::Point)
    }
}

/// Embedding of an entity name. Dimension is fixed by the embedding model.
pub type EmbeddingVector = Vec<f32>;

/// Cluster membership of a single point.
///
/// `Noise` orders before every real cluster so that ordered maps keyed by
/// `ClusterId` list the reserved noise bucket first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterId {
    Noise,
    Cluster(usize),
}

impl ClusterId {
    /// Integer sentinel for noise membership.
    pub const NOISE_LABEL: i64 = -1;

    pub fn is_noise(&self) -> bool {
        matches!(self, ClusterId::Noise)
    }

    /// Integer form: cluster index, or `-1` for noise.
    pub fn as_label(&self) -> i64 {
        match self {
            ClusterId::Noise => Self::NOISE_LABEL,
            ClusterId::Cluster(id) => *id as i64,
        }
    }

    pub fn from_label(label: i64) -> Self {
        if label < 0 {
            ClusterId::Noise
        } else {
            ClusterId::Cluster(label as usize)
        }
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterId::Noise => f.write_str("noise"),
            ClusterId::Cluster(id) => write!(f, "{}", id),
        }
    }
}

/// Answer of the constrained classifier for one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Label {
    /// Brick class token (candidate text with whitespace runs joined by `_`).
    Class(String),
    Unknown,
}

impl Label {
    pub fn class(&self) -> Option<&str> {
        match self {
            Label::Class(c) => Some(c),
            Label::Unknown => None,
        }
    }

    /// Full Brick class URI, if a class was assigned.
    pub fn class_uri(&self) -> Option<String> {
        self.class().map(|c| format!("{}{}", BRICK_NAMESPACE, c))
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Class(c) => f.write_str(c),
            Label::Unknown => f.write_str("UNKNOWN"),
        }
    }
}

/// Stage of the per-cluster triple at which a hard failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Retrieving,
    Classifying,
    Persisting,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureStage::Retrieving => "retrieving",
            FailureStage::Classifying => "classifying",
            FailureStage::Persisting => "persisting",
        };
        f.write_str(s)
    }
}

/// Final outcome of one cluster's retrieve → classify → persist triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ClusterOutcome {
    Classified { label: String },
    Unknown,
    Error { stage: FailureStage, message: String },
}

impl ClusterOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, ClusterOutcome::Error { .. })
    }
}

/// One entry of the append-only result log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub cluster_id: ClusterId,
    pub kind: EntityKind,
    #[serde(flatten)]
    pub outcome: ClusterOutcome,
    pub member_ids: Vec<EntityId>,
    /// Candidates retrieved for the cluster (empty if retrieval failed).
    pub candidates: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noise_orders_first() {
        let mut ids = vec![
            ClusterId::Cluster(2),
            ClusterId::Noise,
            ClusterId::Cluster(0),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![ClusterId::Noise, ClusterId::Cluster(0), ClusterId::Cluster(2)]
        );
    }

    #[test]
    fn test_cluster_id_labels() {
        assert_eq!(ClusterId::Noise.as_label(), -1);
        assert_eq!(ClusterId::Cluster(3).as_label(), 3);
        assert_eq!(ClusterId::from_label(-1), ClusterId::Noise);
        assert_eq!(ClusterId::from_label(7), ClusterId::Cluster(7));
    }

    #[test]
    fn test_entity_kind_from_str() {
        assert_eq!("device".parse::<EntityKind>().unwrap(), EntityKind::Device);
        assert_eq!("POINT".parse::<EntityKind>().unwrap(), EntityKind::Point);
        assert_eq!(
            "equipment".parse::<EntityKind>().unwrap(),
            EntityKind::Device
        );
        assert!("zone".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_label_class_uri() {
        let label = Label::Class("Air_Handling_Unit".to_string());
        assert_eq!(
            label.class_uri().as_deref(),
            Some("https://brickschema.org/schema/Brick#Air_Handling_Unit")
        );
        assert_eq!(Label::Unknown.class_uri(), None);
        assert_eq!(Label::Unknown.to_string(), "UNKNOWN");
    }

    #[test]
    fn test_outcome_serializes_tagged() {
        let result = ClassificationResult {
            cluster_id: ClusterId::Cluster(0),
            kind: EntityKind::Device,
            outcome: ClusterOutcome::Classified {
                label: "AHU".to_string(),
            },
            member_ids: vec![EntityId::from("dev:1")],
            candidates: vec!["AHU".to_string()],
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["outcome"], "classified");
        assert_eq!(json["label"], "AHU");
        assert_eq!(json["cluster_id"]["cluster"], 0);
    }
}
