//! Clustering of entity embeddings
//!
//! Two interchangeable strategies:
//!
//! - [`DensityClusterer`]: density-reachability clustering whose radius is
//!   picked at the knee of the sorted k-distance curve. Produces noise.
//! - [`PartitionClusterer`]: seeded k-means with `k` picked by silhouette
//!   score and early stopping. Every point lands in a cluster.
//!
//! Both are synchronous and deterministic for a fixed input order.

pub mod density;
pub mod knee;
pub mod partition;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ClusterError;
use crate::types::ClusterId;

pub use density::{DensityClusterer, DensityClustering, EpsSource};
pub use knee::{find_knee, Knee};
pub use partition::{PartitionClusterer, PartitionClustering};

/// Distance function over the embedding space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Euclidean,
    /// `1 - cos(a, b)`; zero vectors are at distance 1 from everything.
    Cosine,
}

impl Metric {
    #[inline]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f64 {
        match self {
            Metric::Euclidean => euclidean_distance(a, b),
            Metric::Cosine => cosine_distance(a, b),
        }
    }
}

/// Compute squared Euclidean distance between two vectors.
#[inline]
pub fn euclidean_distance_squared(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = *x as f64 - *y as f64;
            d * d
        })
        .sum()
}

#[inline]
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f64 {
    euclidean_distance_squared(a, b).sqrt()
}

#[inline]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    (1.0 - dot / (na.sqrt() * nb.sqrt())).max(0.0)
}

/// Check that all vectors share one dimension and are finite.
///
/// Returns the common dimension (0 for empty input).
pub fn validate_vectors(vectors: &[Vec<f32>]) -> Result<usize, ClusterError> {
    let Some(first) = vectors.first() else {
        return Ok(0);
    };
    let dim = first.len();
    for (index, v) in vectors.iter().enumerate() {
        if v.len() != dim {
            return Err(ClusterError::DimensionMismatch {
                index,
                expected: dim,
                found: v.len(),
            });
        }
        if v.iter().any(|x| !x.is_finite()) {
            return Err(ClusterError::NonFinite { index });
        }
    }
    Ok(dim)
}

/// Ordered grouping of point indices by cluster id.
///
/// Indices refer to the flat entity/vector arena the assignment was computed
/// over. The noise bucket sorts before every real cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterMap {
    groups: BTreeMap<ClusterId, Vec<usize>>,
}

impl ClusterMap {
    pub fn from_assignment(assignment: &[ClusterId]) -> Self {
        let mut groups: BTreeMap<ClusterId, Vec<usize>> = BTreeMap::new();
        for (i, id) in assignment.iter().enumerate() {
            groups.entry(*id).or_default().push(i);
        }
        Self { groups }
    }

    /// Noise member indices (empty if none).
    pub fn noise(&self) -> &[usize] {
        self.groups
            .get(&ClusterId::Noise)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Real clusters in ascending id order.
    pub fn clusters(&self) -> impl Iterator<Item = (usize, &[usize])> {
        self.groups.iter().filter_map(|(id, members)| match id {
            ClusterId::Cluster(c) => Some((*c, members.as_slice())),
            ClusterId::Noise => None,
        })
    }

    pub fn members(&self, id: ClusterId) -> Option<&[usize]> {
        self.groups.get(&id).map(Vec::as_slice)
    }

    pub fn cluster_count(&self) -> usize {
        self.groups.keys().filter(|id| !id.is_noise()).count()
    }

    /// Total number of points across clusters and noise.
    pub fn point_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Which engine produced an assignment, with its auto-selected parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ClusteringSummary {
    Density { eps: f64, eps_source: EpsSource },
    Partition { chosen_k: usize },
}
