//! Density-reachability clustering with a knee-selected radius
//!
//! ```text
//! vectors ──► k-th neighbour distance per point ──► sort ──► knee ──► eps
//!                                                              │
//!                                      (no knee) fallback eps ─┤
//!                                                              ▼
//!                                   core points: |N_eps(p)| >= min_points
//!                                   clusters:    chains of core points
//!                                   border:      non-core within eps of a core
//!                                   noise:       everything else
//! ```

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info};

use super::knee::find_knee;
use super::{validate_vectors, Metric};
use crate::error::ClusterError;
use crate::types::ClusterId;

/// Radius used when the k-distance curve has no knee. A tunable default with
/// no derivation behind it; override it per deployment.
pub const DEFAULT_FALLBACK_EPS: f64 = 0.1;

/// Minimum neighbourhood size (the point itself included) for a core point.
pub const DEFAULT_MIN_POINTS: usize = 3;

/// Neighbour rank used for the k-distance curve (self excluded).
pub const DEFAULT_K: usize = 1;

/// How the clustering radius was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum EpsSource {
    /// Value of the sorted k-distance curve at `index`.
    Knee { index: usize },
    /// Curve was degenerate; the configured fallback was used.
    Fallback,
    /// Caller pinned the radius.
    Fixed,
}

/// Result of a density clustering run.
#[derive(Debug, Clone, PartialEq)]
pub struct DensityClustering {
    /// One entry per input vector, in input order.
    pub assignment: Vec<ClusterId>,
    pub eps: f64,
    pub eps_source: EpsSource,
}

impl DensityClustering {
    pub fn cluster_count(&self) -> usize {
        self.assignment
            .iter()
            .filter_map(|id| match id {
                ClusterId::Cluster(c) => Some(*c + 1),
                ClusterId::Noise => None,
            })
            .max()
            .unwrap_or(0)
    }

    pub fn noise_count(&self) -> usize {
        self.assignment.iter().filter(|id| id.is_noise()).count()
    }
}

/// Density cluster engine.
#[derive(Debug, Clone, PartialEq)]
pub struct DensityClusterer {
    /// Neighbourhood size (self included) that makes a point core.
    pub min_points: usize,
    /// Neighbour rank for the k-distance curve; clamped to `[1, N-1]`.
    pub k: usize,
    pub metric: Metric,
    pub fallback_eps: f64,
    /// Skip knee detection and use this radius.
    pub eps_override: Option<f64>,
}

impl Default for DensityClusterer {
    fn default() -> Self {
        Self {
            min_points: DEFAULT_MIN_POINTS,
            k: DEFAULT_K,
            metric: Metric::Euclidean,
            fallback_eps: DEFAULT_FALLBACK_EPS,
            eps_override: None,
        }
    }
}

impl DensityClusterer {
    pub fn new(min_points: usize, k: usize) -> Self {
        Self {
            min_points,
            k,
            ..Self::default()
        }
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_fallback_eps(mut self, eps: f64) -> Self {
        self.fallback_eps = eps;
        self
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps_override = Some(eps);
        self
    }

    fn validate(&self) -> Result<(), ClusterError> {
        if self.min_points == 0 {
            return Err(ClusterError::invalid("min_points", "must be >= 1"));
        }
        if !(self.fallback_eps.is_finite() && self.fallback_eps > 0.0) {
            return Err(ClusterError::invalid(
                "fallback_eps",
                format!("must be a positive finite number, got {}", self.fallback_eps),
            ));
        }
        if let Some(eps) = self.eps_override {
            if !(eps.is_finite() && eps > 0.0) {
                return Err(ClusterError::invalid(
                    "eps",
                    format!("must be a positive finite number, got {}", eps),
                ));
            }
        }
        Ok(())
    }

    /// Cluster `vectors`, auto-selecting the radius unless one is pinned.
    pub fn cluster(&self, vectors: &[Vec<f32>]) -> Result<DensityClustering, ClusterError> {
        self.validate()?;
        validate_vectors(vectors)?;

        if vectors.is_empty() {
            return Ok(DensityClustering {
                assignment: Vec::new(),
                eps: self.eps_override.unwrap_or(self.fallback_eps),
                eps_source: if self.eps_override.is_some() {
                    EpsSource::Fixed
                } else {
                    EpsSource::Fallback
                },
            });
        }

        let (eps, eps_source) = match self.eps_override {
            Some(eps) => (eps, EpsSource::Fixed),
            None => self.select_eps(vectors),
        };

        let assignment = self.expand_clusters(vectors, eps);
        let result = DensityClustering {
            assignment,
            eps,
            eps_source,
        };

        info!(
            points = vectors.len(),
            eps,
            ?eps_source,
            clusters = result.cluster_count(),
            noise = result.noise_count(),
            "Density clustering complete"
        );

        Ok(result)
    }

    /// Pick the radius at the knee of the sorted k-distance curve.
    pub fn select_eps(&self, vectors: &[Vec<f32>]) -> (f64, EpsSource) {
        let curve = self.k_distance_curve(vectors);
        match find_knee(&curve) {
            Some(knee) if knee.value > 0.0 => {
                debug!(index = knee.index, eps = knee.value, "Knee found on k-distance curve");
                (knee.value, EpsSource::Knee { index: knee.index })
            }
            _ => {
                debug!(
                    points = curve.len(),
                    fallback = self.fallback_eps,
                    "No usable knee on k-distance curve, using fallback eps"
                );
                (self.fallback_eps, EpsSource::Fallback)
            }
        }
    }

    /// Distance from every point to its k-th nearest neighbour, ascending.
    ///
    /// Empty for fewer than two points.
    pub fn k_distance_curve(&self, vectors: &[Vec<f32>]) -> Vec<f64> {
        let n = vectors.len();
        if n < 2 {
            return Vec::new();
        }
        let k = self.k.clamp(1, n - 1);

        let mut curve = Vec::with_capacity(n);
        let mut row = Vec::with_capacity(n - 1);
        for (i, v) in vectors.iter().enumerate() {
            row.clear();
            row.extend(
                vectors
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, w)| self.metric.distance(v, w)),
            );
            let (_, kth, _) = row.select_nth_unstable_by(k - 1, f64::total_cmp);
            curve.push(*kth);
        }
        curve.sort_by(f64::total_cmp);
        curve
    }

    fn expand_clusters(&self, vectors: &[Vec<f32>], eps: f64) -> Vec<ClusterId> {
        let n = vectors.len();

        // Neighbourhoods include the point itself.
        let neighbours: Vec<Vec<usize>> = vectors
            .iter()
            .map(|v| {
                vectors
                    .iter()
                    .enumerate()
                    .filter(|(_, w)| self.metric.distance(v, w) <= eps)
                    .map(|(j, _)| j)
                    .collect()
            })
            .collect();
        let is_core: Vec<bool> = neighbours
            .iter()
            .map(|nb| nb.len() >= self.min_points)
            .collect();

        let mut labels: Vec<Option<ClusterId>> = vec![None; n];
        let mut next_id = 0usize;
        let mut queue = VecDeque::new();

        for start in 0..n {
            if labels[start].is_some() || !is_core[start] {
                continue;
            }

            let id = ClusterId::Cluster(next_id);
            next_id += 1;
            labels[start] = Some(id);
            queue.push_back(start);

            while let Some(p) = queue.pop_front() {
                if !is_core[p] {
                    continue;
                }
                for &q in &neighbours[p] {
                    if labels[q].is_none() {
                        labels[q] = Some(id);
                        queue.push_back(q);
                    }
                }
            }
        }

        labels
            .into_iter()
            .map(|l| l.unwrap_or(ClusterId::Noise))
            .collect()
    }
}
