//! Pipeline configuration
//!
//! Every knob has a default, so `PipelineConfig::default()` is a working
//! configuration. Deployments override it from a YAML file or from
//! `BRICK_*` environment variables (a `.env` file is honoured).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::clustering::density::{DEFAULT_FALLBACK_EPS, DEFAULT_K, DEFAULT_MIN_POINTS};
use crate::clustering::partition::{
    DEFAULT_K_MAX, DEFAULT_K_MIN, DEFAULT_PATIENCE, DEFAULT_RESTARTS, DEFAULT_SEED, DEFAULT_STEP,
};
use crate::clustering::{DensityClusterer, Metric, PartitionClusterer};
use crate::error::PipelineError;
use crate::retry::RetryPolicy;

/// Which cluster engine the coordinator runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStrategy {
    #[default]
    Density,
    Partition,
}

impl FromStr for ClusterStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "density" | "dbscan" => Ok(ClusterStrategy::Density),
            "partition" | "kmeans" => Ok(ClusterStrategy::Partition),
            other => Err(format!(
                "Unknown cluster strategy '{}'. Valid values: density, partition",
                other
            )),
        }
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "euclidean" => Ok(Metric::Euclidean),
            "cosine" => Ok(Metric::Cosine),
            other => Err(format!(
                "Unknown metric '{}'. Valid values: euclidean, cosine",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    pub strategy: ClusterStrategy,
    pub metric: Metric,

    // Density engine
    pub min_points: usize,
    pub k: usize,
    pub fallback_eps: f64,
    pub eps: Option<f64>,

    // Partition engine
    pub k_min: usize,
    pub k_max: usize,
    pub step: usize,
    pub patience: usize,
    pub seed: u64,
    pub restarts: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            strategy: ClusterStrategy::Density,
            metric: Metric::Euclidean,
            min_points: DEFAULT_MIN_POINTS,
            k: DEFAULT_K,
            fallback_eps: DEFAULT_FALLBACK_EPS,
            eps: None,
            k_min: DEFAULT_K_MIN,
            k_max: DEFAULT_K_MAX,
            step: DEFAULT_STEP,
            patience: DEFAULT_PATIENCE,
            seed: DEFAULT_SEED,
            restarts: DEFAULT_RESTARTS,
        }
    }
}

impl ClusteringConfig {
    pub fn density_engine(&self) -> DensityClusterer {
        let engine = DensityClusterer::new(self.min_points, self.k)
            .with_metric(self.metric)
            .with_fallback_eps(self.fallback_eps);
        match self.eps {
            Some(eps) => engine.with_eps(eps),
            None => engine,
        }
    }

    pub fn partition_engine(&self) -> PartitionClusterer {
        PartitionClusterer::new(self.k_min, self.k_max, self.step, self.patience)
            .with_seed(self.seed)
            .with_restarts(self.restarts)
    }
}

/// Default number of candidate classes retrieved per cluster.
pub const DEFAULT_TOP_K: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
        }
    }
}

/// Limits for one embedding request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingBatchConfig {
    /// Estimated tokens per request (4 characters per token).
    pub max_tokens_per_batch: usize,
    /// Texts per request.
    pub max_batch_len: usize,
}

impl Default for EmbeddingBatchConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_batch: 8_000,
            max_batch_len: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub clustering: ClusteringConfig,
    pub retrieval: RetrievalConfig,
    pub retry: RetryPolicy,
    pub embedding: EmbeddingBatchConfig,
    /// Cluster triples in flight at once.
    pub max_concurrency: usize,
    /// Consecutive ERROR outcomes after which the run aborts.
    pub max_consecutive_failures: usize,
    /// Rewrite point names through the generative service before embedding.
    pub clean_point_names: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            clustering: ClusteringConfig::default(),
            retrieval: RetrievalConfig::default(),
            retry: RetryPolicy::default(),
            embedding: EmbeddingBatchConfig::default(),
            max_concurrency: 4,
            max_consecutive_failures: 5,
            clean_point_names: false,
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by `BRICK_*` environment variables.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `BRICK_*` name.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let c = &mut config.clustering;

        override_from(&lookup, "BRICK_STRATEGY", &mut c.strategy)?;
        override_from(&lookup, "BRICK_METRIC", &mut c.metric)?;
        override_from(&lookup, "BRICK_MIN_POINTS", &mut c.min_points)?;
        override_from(&lookup, "BRICK_K", &mut c.k)?;
        override_from(&lookup, "BRICK_FALLBACK_EPS", &mut c.fallback_eps)?;
        if let Some(eps) = parse_var::<f64, _>(&lookup, "BRICK_EPS")? {
            c.eps = Some(eps);
        }
        override_from(&lookup, "BRICK_K_MIN", &mut c.k_min)?;
        override_from(&lookup, "BRICK_K_MAX", &mut c.k_max)?;
        override_from(&lookup, "BRICK_K_STEP", &mut c.step)?;
        override_from(&lookup, "BRICK_PATIENCE", &mut c.patience)?;
        override_from(&lookup, "BRICK_SEED", &mut c.seed)?;
        override_from(&lookup, "BRICK_RESTARTS", &mut c.restarts)?;

        override_from(&lookup, "BRICK_TOP_K", &mut config.retrieval.top_k)?;
        override_from(&lookup, "BRICK_MAX_ATTEMPTS", &mut config.retry.max_attempts)?;
        override_from(
            &lookup,
            "BRICK_INITIAL_BACKOFF_MS",
            &mut config.retry.initial_backoff_ms,
        )?;
        override_from(&lookup, "BRICK_MAX_BACKOFF_MS", &mut config.retry.max_backoff_ms)?;
        override_from(
            &lookup,
            "BRICK_EMBED_MAX_TOKENS",
            &mut config.embedding.max_tokens_per_batch,
        )?;
        override_from(
            &lookup,
            "BRICK_EMBED_BATCH_LEN",
            &mut config.embedding.max_batch_len,
        )?;
        override_from(&lookup, "BRICK_MAX_CONCURRENCY", &mut config.max_concurrency)?;
        override_from(
            &lookup,
            "BRICK_MAX_CONSECUTIVE_FAILURES",
            &mut config.max_consecutive_failures,
        )?;
        override_from(&lookup, "BRICK_CLEAN_POINT_NAMES", &mut config.clean_point_names)?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("Failed to parse pipeline config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn validate(&self) -> std::result::Result<(), PipelineError> {
        let c = &self.clustering;
        let positive = [
            ("clustering.min_points", c.min_points),
            ("clustering.k", c.k),
            ("clustering.k_min", c.k_min),
            ("clustering.step", c.step),
            ("clustering.patience", c.patience),
            ("clustering.restarts", c.restarts),
            ("retrieval.top_k", self.retrieval.top_k),
            ("embedding.max_tokens_per_batch", self.embedding.max_tokens_per_batch),
            ("embedding.max_batch_len", self.embedding.max_batch_len),
            ("max_concurrency", self.max_concurrency),
            ("max_consecutive_failures", self.max_consecutive_failures),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(PipelineError::Config(format!("{} must be >= 1", name)));
            }
        }
        // Silhouette scoring is undefined for a single cluster.
        if c.k_min < 2 {
            return Err(PipelineError::Config(format!(
                "clustering.k_min must be >= 2, got {}",
                c.k_min
            )));
        }
        if c.k_max < c.k_min {
            return Err(PipelineError::Config(format!(
                "clustering.k_max ({}) must be >= k_min ({})",
                c.k_max, c.k_min
            )));
        }
        if !(c.fallback_eps.is_finite() && c.fallback_eps > 0.0) {
            return Err(PipelineError::Config(
                "clustering.fallback_eps must be a positive number".to_string(),
            ));
        }
        if let Some(eps) = c.eps {
            if !(eps.is_finite() && eps > 0.0) {
                return Err(PipelineError::Config(
                    "clustering.eps must be a positive number".to_string(),
                ));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::Config(
                "retry.max_attempts must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {}", name, e)),
        _ => Ok(None),
    }
}

fn override_from<T, F>(lookup: &F, name: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = parse_var(lookup, name)? {
        *target = value;
    }
    Ok(())
}
