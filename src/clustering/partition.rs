//! Partition clustering with automatic `k` selection
//!
//! For each candidate `k` a seeded k-means is fitted (k-means++ seeding,
//! several restarts, lowest inertia kept) and scored by the mean silhouette
//! coefficient. The sweep stops once the score has failed to improve for
//! `patience` consecutive candidates; the best-scoring `k` wins.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{euclidean_distance, validate_vectors};
use crate::error::ClusterError;
use crate::types::ClusterId;

pub const DEFAULT_K_MIN: usize = 2;
pub const DEFAULT_K_MAX: usize = 200;
pub const DEFAULT_STEP: usize = 1;
pub const DEFAULT_PATIENCE: usize = 5;
pub const DEFAULT_SEED: u64 = 0;
pub const DEFAULT_RESTARTS: usize = 10;
pub const DEFAULT_MAX_ITERATIONS: usize = 300;

/// Silhouette score of one evaluated `k`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KScore {
    pub k: usize,
    pub score: f64,
}

/// Result of a partition clustering run. Never contains noise.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionClustering {
    pub assignment: Vec<ClusterId>,
    pub chosen_k: usize,
    /// Every evaluated `k` in sweep order.
    pub scores: Vec<KScore>,
}

/// Partition cluster engine.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionClusterer {
    pub k_min: usize,
    pub k_max: usize,
    pub step: usize,
    pub patience: usize,
    pub seed: u64,
    pub restarts: usize,
    pub max_iterations: usize,
}

impl Default for PartitionClusterer {
    fn default() -> Self {
        Self {
            k_min: DEFAULT_K_MIN,
            k_max: DEFAULT_K_MAX,
            step: DEFAULT_STEP,
            patience: DEFAULT_PATIENCE,
            seed: DEFAULT_SEED,
            restarts: DEFAULT_RESTARTS,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

struct KMeansFit {
    assignment: Vec<usize>,
    inertia: f64,
}

impl PartitionClusterer {
    pub fn new(k_min: usize, k_max: usize, step: usize, patience: usize) -> Self {
        Self {
            k_min,
            k_max,
            step,
            patience,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_restarts(mut self, restarts: usize) -> Self {
        self.restarts = restarts;
        self
    }

    fn validate(&self) -> Result<(), ClusterError> {
        if self.k_min < 2 {
            return Err(ClusterError::invalid("k_min", "must be >= 2"));
        }
        if self.k_max < self.k_min {
            return Err(ClusterError::invalid(
                "k_max",
                format!("must be >= k_min ({}), got {}", self.k_min, self.k_max),
            ));
        }
        if self.step == 0 {
            return Err(ClusterError::invalid("step", "must be >= 1"));
        }
        if self.patience == 0 {
            return Err(ClusterError::invalid("patience", "must be >= 1"));
        }
        if self.restarts == 0 {
            return Err(ClusterError::invalid("restarts", "must be >= 1"));
        }
        if self.max_iterations == 0 {
            return Err(ClusterError::invalid("max_iterations", "must be >= 1"));
        }
        Ok(())
    }

    /// Sweep `k` and return the best-scoring assignment.
    pub fn cluster(&self, vectors: &[Vec<f32>]) -> Result<PartitionClustering, ClusterError> {
        self.validate()?;
        validate_vectors(vectors)?;

        let n = vectors.len();
        if n == 0 {
            return Ok(PartitionClustering {
                assignment: Vec::new(),
                chosen_k: 0,
                scores: Vec::new(),
            });
        }

        // Silhouette needs 2 <= k <= n - 1.
        let upper = self.k_max.min(n.saturating_sub(1));
        if self.k_min > upper {
            warn!(
                points = n,
                k_min = self.k_min,
                "Too few points to score any k, returning a single cluster"
            );
            return Ok(PartitionClustering {
                assignment: vec![ClusterId::Cluster(0); n],
                chosen_k: 1,
                scores: Vec::new(),
            });
        }

        let mut scores = Vec::new();
        let mut best: Option<(usize, f64, Vec<usize>)> = None;
        let mut stale = 0usize;

        for k in (self.k_min..=upper).step_by(self.step) {
            let fit = self.kmeans(vectors, k);
            let score = silhouette_score(vectors, &fit.assignment);
            debug!(k, score, inertia = fit.inertia, "Evaluated k");
            scores.push(KScore { k, score });

            let improved = best.as_ref().map_or(true, |(_, s, _)| score > *s);
            if improved {
                best = Some((k, score, fit.assignment));
                stale = 0;
            } else {
                stale += 1;
                if stale >= self.patience {
                    debug!(k, patience = self.patience, "Silhouette stopped improving");
                    break;
                }
            }
        }

        let (best_k, best_score, assignment) = match best {
            Some(b) => b,
            None => return Err(ClusterError::invalid("k_min", "no k evaluated")),
        };

        // A fit can leave clusters empty; report what is actually populated.
        let assignment = relabel_by_discovery(&assignment);
        let chosen_k = populated_clusters(&assignment);
        if chosen_k < best_k {
            debug!(requested = best_k, populated = chosen_k, "Fit left clusters empty");
        }

        info!(
            points = n,
            chosen_k,
            silhouette = best_score,
            evaluated = scores.len(),
            "Partition clustering complete"
        );

        Ok(PartitionClustering {
            assignment,
            chosen_k,
            scores,
        })
    }

    /// Fit exactly `k` clusters without any selection sweep.
    pub fn fit(&self, vectors: &[Vec<f32>], k: usize) -> Result<Vec<ClusterId>, ClusterError> {
        validate_vectors(vectors)?;
        if k == 0 || k > vectors.len() {
            return Err(ClusterError::invalid(
                "k",
                format!("must be in 1..={}, got {}", vectors.len(), k),
            ));
        }
        if self.restarts == 0 || self.max_iterations == 0 {
            return Err(ClusterError::invalid(
                "restarts",
                "restarts and max_iterations must be >= 1",
            ));
        }
        let fit = self.kmeans(vectors, k);
        Ok(relabel_by_discovery(&fit.assignment))
    }

    /// Seeded k-means; the restart with the lowest inertia wins.
    fn kmeans(&self, vectors: &[Vec<f32>], k: usize) -> KMeansFit {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut best: Option<KMeansFit> = None;

        for _ in 0..self.restarts {
            let centroids = kmeans_plus_plus_init(vectors, k, &mut rng);
            let fit = lloyd(vectors, centroids, self.max_iterations);
            if best.as_ref().map_or(true, |b| fit.inertia < b.inertia) {
                best = Some(fit);
            }
        }

        best.unwrap_or(KMeansFit {
            assignment: vec![0; vectors.len()],
            inertia: 0.0,
        })
    }
}

/// Mean silhouette coefficient over all points (Euclidean).
///
/// Points in singleton clusters score 0. Returns -1 when fewer than two
/// clusters are populated, since the coefficient is undefined there.
pub fn silhouette_score(vectors: &[Vec<f32>], assignment: &[usize]) -> f64 {
    let n = vectors.len();
    let k = assignment.iter().copied().max().map_or(0, |m| m + 1);
    let mut sizes = vec![0usize; k];
    for &c in assignment {
        sizes[c] += 1;
    }
    if sizes.iter().filter(|&&s| s > 0).count() < 2 {
        return -1.0;
    }

    let mut sums = vec![0.0f64; k];
    let mut total = 0.0f64;
    for i in 0..n {
        let own = assignment[i];
        if sizes[own] <= 1 {
            continue;
        }

        sums.iter_mut().for_each(|s| *s = 0.0);
        for j in 0..n {
            if i != j {
                sums[assignment[j]] += euclidean_distance(&vectors[i], &vectors[j]);
            }
        }

        let a = sums[own] / (sizes[own] - 1) as f64;
        let b = (0..k)
            .filter(|&c| c != own && sizes[c] > 0)
            .map(|c| sums[c] / sizes[c] as f64)
            .fold(f64::INFINITY, f64::min);

        let denom = a.max(b);
        if denom > 0.0 {
            total += (b - a) / denom;
        }
    }

    total / n as f64
}

fn squared_distance_to(point: &[f32], centroid: &[f64]) -> f64 {
    point
        .iter()
        .zip(centroid.iter())
        .map(|(x, c)| {
            let d = *x as f64 - c;
            d * d
        })
        .sum()
}

/// k-means++ seeding: first centroid uniform, the rest drawn with
/// probability proportional to squared distance from the nearest centroid.
fn kmeans_plus_plus_init(vectors: &[Vec<f32>], k: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    let n = vectors.len();
    let to_f64 = |v: &Vec<f32>| v.iter().map(|x| *x as f64).collect::<Vec<f64>>();

    let mut centroids = Vec::with_capacity(k);
    centroids.push(to_f64(&vectors[rng.gen_range(0..n)]));

    let mut min_distances: Vec<f64> = vectors
        .iter()
        .map(|v| squared_distance_to(v, &centroids[0]))
        .collect();

    while centroids.len() < k {
        let total: f64 = min_distances.iter().sum();
        let next = if total > 0.0 {
            let target = rng.gen::<f64>() * total;
            let mut acc = 0.0;
            let mut chosen = n - 1;
            for (i, d) in min_distances.iter().enumerate() {
                acc += d;
                if acc > target {
                    chosen = i;
                    break;
                }
            }
            chosen
        } else {
            // Every point coincides with a centroid.
            rng.gen_range(0..n)
        };

        let centroid = to_f64(&vectors[next]);
        for (i, v) in vectors.iter().enumerate() {
            let d = squared_distance_to(v, &centroid);
            if d < min_distances[i] {
                min_distances[i] = d;
            }
        }
        centroids.push(centroid);
    }

    centroids
}

/// Lloyd iterations until assignments stop changing.
fn lloyd(vectors: &[Vec<f32>], mut centroids: Vec<Vec<f64>>, max_iterations: usize) -> KMeansFit {
    let n = vectors.len();
    let k = centroids.len();
    let dim = vectors.first().map_or(0, Vec::len);
    let mut assignment = vec![usize::MAX; n];

    for _ in 0..max_iterations {
        let mut changed = false;
        for (i, v) in vectors.iter().enumerate() {
            let nearest = nearest_centroid(v, &centroids);
            if assignment[i] != nearest {
                assignment[i] = nearest;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        let mut sums = vec![vec![0.0f64; dim]; k];
        let mut counts = vec![0usize; k];
        for (v, &c) in vectors.iter().zip(assignment.iter()) {
            counts[c] += 1;
            for (s, x) in sums[c].iter_mut().zip(v.iter()) {
                *s += *x as f64;
            }
        }

        for c in 0..k {
            if counts[c] > 0 {
                centroids[c] = sums[c].iter().map(|s| s / counts[c] as f64).collect();
            } else {
                // Re-seed an empty cluster at the point worst served by its centroid.
                let far = (0..n)
                    .max_by(|&a, &b| {
                        squared_distance_to(&vectors[a], &centroids[assignment[a]])
                            .total_cmp(&squared_distance_to(&vectors[b], &centroids[assignment[b]]))
                    })
                    .unwrap_or(0);
                centroids[c] = vectors[far].iter().map(|x| *x as f64).collect();
            }
        }
    }

    let inertia = vectors
        .iter()
        .zip(assignment.iter())
        .map(|(v, &c)| squared_distance_to(v, &centroids[c]))
        .sum();

    KMeansFit {
        assignment,
        inertia,
    }
}

fn nearest_centroid(v: &[f32], centroids: &[Vec<f64>]) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (c, centroid) in centroids.iter().enumerate() {
        let d = squared_distance_to(v, centroid);
        if d < best_dist {
            best_dist = d;
            best = c;
        }
    }
    best
}

/// Number of distinct clusters in a dense, discovery-ordered assignment.
fn populated_clusters(assignment: &[ClusterId]) -> usize {
    assignment
        .iter()
        .filter_map(|id| match id {
            ClusterId::Cluster(c) => Some(*c + 1),
            ClusterId::Noise => None,
        })
        .max()
        .unwrap_or(0)
}

/// Renumber clusters 0.. in order of first appearance; drops empty ids.
fn relabel_by_discovery(assignment: &[usize]) -> Vec<ClusterId> {
    let mut mapping: Vec<Option<usize>> = Vec::new();
    let mut next = 0usize;
    assignment
        .iter()
        .map(|&c| {
            if c >= mapping.len() {
                mapping.resize(c + 1, None);
            }
            let id = *mapping[c].get_or_insert_with(|| {
                next += 1;
                next - 1
            });
            ClusterId::Cluster(id)
        })
        .collect()
}
