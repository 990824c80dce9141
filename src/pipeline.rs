//! Pipeline coordinator
//!
//! ```text
//! Collecting ─► Clustering ─► ┌ Retrieving ─► Classifying ─► Persisting ┐ ─► Done
//!                             └──────────── once per cluster ───────────┘
//! ```
//!
//! Clusters are dispatched in ascending id order through a bounded pool
//! (`max_concurrency`). Each cluster's triple is isolated: its failure is
//! recorded as an ERROR outcome and never touches a sibling. Noise members
//! are skipped entirely.
//!
//! A run stops dispatching new clusters when the shutdown signal fires
//! (state `Cancelled`) or when `max_consecutive_failures` clusters in a row
//! end in ERROR (state `Aborted`, surfaced as [`PipelineError::Fatal`]).
//! A run in which every dispatched cluster ends in ERROR is also aborted.
//! Clusters already in flight always finish their atomic write.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::classifier::ConstrainedClassifier;
use crate::cleaner::NameCleaner;
use crate::clustering::{ClusterMap, ClusteringSummary};
use crate::config::{ClusterStrategy, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::services::{
    embed_in_batches, CandidateRetriever, EmbeddingService, EmbeddingUpdate,
    GenerativeClassificationService, GraphStore,
};
use crate::types::{
    ClassificationResult, ClusterId, ClusterOutcome, EmbeddingVector, Entity, EntityId,
    EntityKind, FailureStage, Label,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Collecting,
    Clustering,
    Retrieving,
    Classifying,
    Persisting,
    Done,
    /// Shutdown requested; undispatched clusters were abandoned.
    Cancelled,
    /// Consecutive-failure limit hit.
    Aborted,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Idle => "IDLE",
            PipelineState::Collecting => "COLLECTING",
            PipelineState::Clustering => "CLUSTERING",
            PipelineState::Retrieving => "RETRIEVING",
            PipelineState::Classifying => "CLASSIFYING",
            PipelineState::Persisting => "PERSISTING",
            PipelineState::Done => "DONE",
            PipelineState::Cancelled => "CANCELLED",
            PipelineState::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// Wall-clock time spent per stage, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimings {
    /// Loading entities and computing missing embeddings (per-kind runs only).
    pub hydration_ms: Option<u64>,
    pub clustering_ms: u64,
    pub classification_ms: u64,
    pub total_ms: u64,
}

/// Aggregate outcome of one run.
///
/// `classified + unknown + errored + abandoned == total`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub kind: EntityKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: PipelineState,
    /// Entities clustered.
    pub entities: usize,
    /// Entities left out because no embedding could be obtained.
    pub unembedded: usize,
    /// Non-noise clusters.
    pub total: usize,
    pub classified: usize,
    pub unknown: usize,
    pub errored: usize,
    /// Clusters never dispatched because the run was stopped.
    pub abandoned: usize,
    /// Entities assigned to noise.
    pub noise: usize,
    pub clustering: Option<ClusteringSummary>,
    pub timings: StageTimings,
    /// Per-cluster outcomes in ascending cluster id order.
    pub results: Vec<ClassificationResult>,
}

impl RunReport {
    fn new(kind: EntityKind) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            kind,
            started_at: now,
            finished_at: now,
            state: PipelineState::Collecting,
            entities: 0,
            unembedded: 0,
            total: 0,
            classified: 0,
            unknown: 0,
            errored: 0,
            abandoned: 0,
            noise: 0,
            clustering: None,
            timings: StageTimings::default(),
            results: Vec::new(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    fn tally(&mut self) {
        self.classified = 0;
        self.unknown = 0;
        self.errored = 0;
        for r in &self.results {
            match r.outcome {
                ClusterOutcome::Classified { .. } => self.classified += 1,
                ClusterOutcome::Unknown => self.unknown += 1,
                ClusterOutcome::Error { .. } => self.errored += 1,
            }
        }
    }
}

/// Trips after `threshold` ERROR outcomes in a row (completion order).
struct FailureBreaker {
    threshold: usize,
    consecutive: AtomicUsize,
    tripped: AtomicBool,
}

impl FailureBreaker {
    fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: AtomicUsize::new(0),
            tripped: AtomicBool::new(false),
        }
    }

    fn record(&self, failed: bool) {
        if !failed {
            self.consecutive.store(0, Ordering::SeqCst);
            return;
        }
        let n = self.consecutive.fetch_add(1, Ordering::SeqCst) + 1;
        if n >= self.threshold && !self.tripped.swap(true, Ordering::SeqCst) {
            error!(
                consecutive_failures = n,
                "External services failing for every cluster, stopping dispatch"
            );
        }
    }

    fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    fn consecutive(&self) -> usize {
        self.consecutive.load(Ordering::SeqCst)
    }
}

/// One cluster's work order.
struct ClusterJob {
    cluster_id: usize,
    member_ids: Vec<EntityId>,
    member_names: Vec<String>,
}

#[derive(Default)]
struct Hydration {
    elapsed_ms: Option<u64>,
    unembedded: usize,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct Coordinator {
    config: PipelineConfig,
    retriever: Arc<dyn CandidateRetriever>,
    classifier: ConstrainedClassifier,
    graph: Arc<dyn GraphStore>,
    embedder: Option<Arc<dyn EmbeddingService>>,
    cleaner: Option<NameCleaner>,
    shutdown: Option<watch::Receiver<bool>>,
    state: watch::Sender<PipelineState>,
}

impl Coordinator {
    pub fn new(
        config: PipelineConfig,
        retriever: Arc<dyn CandidateRetriever>,
        generator: Arc<dyn GenerativeClassificationService>,
        graph: Arc<dyn GraphStore>,
    ) -> Self {
        let classifier =
            ConstrainedClassifier::new(generator.clone()).with_retry(config.retry.clone());
        let cleaner = config
            .clean_point_names
            .then(|| NameCleaner::new(generator).with_retry(config.retry.clone()));
        let (state, _) = watch::channel(PipelineState::Idle);
        Self {
            config,
            retriever,
            classifier,
            graph,
            embedder: None,
            cleaner,
            shutdown: None,
            state,
        }
    }

    /// Embedding service used by [`Coordinator::run_kind`] for entities
    /// stored without an embedding.
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingService>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Stop dispatching clusters once `shutdown` reads `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: PipelineState) {
        self.state.send_replace(state);
    }

    fn is_cancelled(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Cluster and classify `entities` of one kind.
    ///
    /// `embeddings[i]` is the embedding of `entities[i]`.
    #[instrument(skip(self, entities, embeddings), fields(entities = entities.len()))]
    pub async fn run(
        &self,
        kind: EntityKind,
        entities: &[Entity],
        embeddings: &[EmbeddingVector],
    ) -> Result<RunReport> {
        self.execute(kind, entities, embeddings, Hydration::default())
            .await
    }

    /// Load one kind's entities from the graph store, embed the ones that
    /// have no embedding yet, then run.
    ///
    /// With point-name cleaning on, only points about to be embedded are
    /// cleaned. The cleaned name is stored next to the embedding and reused
    /// by every later run.
    #[instrument(skip(self))]
    pub async fn run_kind(&self, kind: EntityKind) -> Result<RunReport> {
        self.set_state(PipelineState::Collecting);
        let started = Instant::now();
        let retry = &self.config.retry;

        let stored = retry
            .run("fetch_embeddings", || self.graph.fetch_embeddings(kind))
            .await?;
        let mut entities: Vec<Entity> = Vec::with_capacity(stored.len());
        let mut embeddings: Vec<Option<EmbeddingVector>> = Vec::with_capacity(stored.len());
        for s in stored {
            let mut entity = s.entity;
            // Downstream text must match the text that was embedded.
            if let Some(cleaned) = s.cleaned_name {
                entity.name = cleaned;
            }
            entities.push(entity);
            embeddings.push(s.embedding);
        }

        let missing: Vec<usize> = embeddings
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_none())
            .map(|(i, _)| i)
            .collect();

        if !missing.is_empty() {
            match &self.embedder {
                Some(embedder) => {
                    let raw: Vec<String> =
                        missing.iter().map(|&i| entities[i].name.clone()).collect();
                    let cleaned = match (&self.cleaner, kind) {
                        (Some(cleaner), EntityKind::Point) => Some(cleaner.clean(&raw).await),
                        _ => None,
                    };
                    let texts = cleaned.as_ref().unwrap_or(&raw);
                    let vectors =
                        embed_in_batches(embedder.as_ref(), texts, &self.config.embedding, retry)
                            .await?;
                    let updates: Vec<EmbeddingUpdate> = missing
                        .iter()
                        .zip(vectors)
                        .enumerate()
                        .map(|(j, (&i, embedding))| EmbeddingUpdate {
                            id: entities[i].id.clone(),
                            embedding,
                            cleaned_name: cleaned.as_ref().map(|names| names[j].clone()),
                        })
                        .collect();
                    retry
                        .run("store_embeddings", || self.graph.store_embeddings(&updates))
                        .await?;
                    info!(%kind, embedded = updates.len(), "Embedded entities without vectors");
                    for (&i, update) in missing.iter().zip(updates) {
                        if let Some(name) = update.cleaned_name {
                            entities[i].name = name;
                        }
                        embeddings[i] = Some(update.embedding);
                    }
                }
                None => warn!(
                    %kind,
                    missing = missing.len(),
                    "No embedding service configured, skipping entities without vectors"
                ),
            }
        }

        let mut kept_entities = Vec::with_capacity(entities.len());
        let mut kept_vectors = Vec::with_capacity(entities.len());
        let mut unembedded = 0;
        for (entity, embedding) in entities.into_iter().zip(embeddings) {
            match embedding {
                Some(v) => {
                    kept_entities.push(entity);
                    kept_vectors.push(v);
                }
                None => unembedded += 1,
            }
        }

        let hydration = Hydration {
            elapsed_ms: Some(started.elapsed().as_millis() as u64),
            unembedded,
        };
        self.execute(kind, &kept_entities, &kept_vectors, hydration)
            .await
    }

    /// Devices, then points.
    pub async fn run_all(&self) -> Result<Vec<RunReport>> {
        let mut reports = Vec::with_capacity(2);
        for kind in EntityKind::all() {
            let report = self.run_kind(kind).await?;
            let stop = report.state == PipelineState::Cancelled;
            reports.push(report);
            if stop {
                break;
            }
        }
        Ok(reports)
    }

    async fn execute(
        &self,
        kind: EntityKind,
        entities: &[Entity],
        embeddings: &[EmbeddingVector],
        hydration: Hydration,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let mut report = RunReport::new(kind);
        report.timings.hydration_ms = hydration.elapsed_ms;
        report.unembedded = hydration.unembedded;
        report.entities = entities.len();

        // --- Collecting ---
        self.set_state(PipelineState::Collecting);
        if entities.len() != embeddings.len() {
            return Err(PipelineError::Input(format!(
                "{} entities but {} embeddings",
                entities.len(),
                embeddings.len()
            )));
        }
        if let Some(other) = entities.iter().find(|e| e.kind != kind) {
            return Err(PipelineError::Input(format!(
                "entity {} is a {}, expected {}",
                other.id, other.kind, kind
            )));
        }

        // --- Clustering ---
        self.set_state(PipelineState::Clustering);
        let clustering_started = Instant::now();
        let (assignment, summary) = self.cluster(embeddings)?;
        let map = ClusterMap::from_assignment(&assignment);
        report.timings.clustering_ms = clustering_started.elapsed().as_millis() as u64;
        report.clustering = Some(summary);
        report.noise = map.noise().len();
        report.total = map.cluster_count();

        info!(
            %kind,
            entities = entities.len(),
            clusters = report.total,
            noise = report.noise,
            elapsed_ms = report.timings.clustering_ms,
            "Clustering complete"
        );

        let jobs: Vec<ClusterJob> = map
            .clusters()
            .map(|(cluster_id, members)| ClusterJob {
                cluster_id,
                member_ids: members.iter().map(|&i| entities[i].id.clone()).collect(),
                member_names: members.iter().map(|&i| entities[i].name.clone()).collect(),
            })
            .collect();

        // --- Per-cluster triples ---
        let classification_started = Instant::now();
        let log: Mutex<Vec<ClassificationResult>> = Mutex::new(Vec::with_capacity(jobs.len()));
        let breaker = FailureBreaker::new(self.config.max_consecutive_failures);
        let abandoned = AtomicUsize::new(0);
        {
            let log = &log;
            let breaker = &breaker;
            let abandoned = &abandoned;
            stream::iter(jobs)
                .map(|job| async move {
                    if breaker.is_tripped() || self.is_cancelled() {
                        debug!(cluster_id = job.cluster_id, "Cluster abandoned");
                        abandoned.fetch_add(1, Ordering::SeqCst);
                        return;
                    }
                    let result = self.process_cluster(kind, job).await;
                    breaker.record(result.outcome.is_error());
                    log.lock().await.push(result);
                })
                .buffer_unordered(self.config.max_concurrency.max(1))
                .for_each(|()| async {})
                .await;
        }
        report.timings.classification_ms = classification_started.elapsed().as_millis() as u64;

        let mut results = log.into_inner();
        results.sort_by_key(|r| r.cluster_id);
        report.results = results;
        report.abandoned = abandoned.into_inner();
        report.tally();

        // Every dispatched cluster failing means the services are down, even
        // when the run was too short to trip the breaker.
        let all_failed = report.errored > 0 && report.errored == report.results.len();
        if all_failed && !breaker.is_tripped() {
            error!(
                %kind,
                errored = report.errored,
                "Every dispatched cluster failed, aborting run"
            );
        }
        let aborted = breaker.is_tripped() || all_failed;

        report.state = if aborted {
            PipelineState::Aborted
        } else if report.abandoned > 0 {
            PipelineState::Cancelled
        } else {
            PipelineState::Done
        };
        report.finished_at = Utc::now();
        report.timings.total_ms =
            started.elapsed().as_millis() as u64 + hydration.elapsed_ms.unwrap_or(0);
        self.set_state(report.state);

        info!(
            %kind,
            state = %report.state,
            total = report.total,
            classified = report.classified,
            unknown = report.unknown,
            errored = report.errored,
            abandoned = report.abandoned,
            elapsed_ms = report.timings.total_ms,
            "Run finished"
        );

        if aborted {
            return Err(PipelineError::Fatal {
                consecutive_failures: breaker.consecutive(),
                report: Box::new(report),
            });
        }
        Ok(report)
    }

    fn cluster(
        &self,
        embeddings: &[EmbeddingVector],
    ) -> Result<(Vec<ClusterId>, ClusteringSummary)> {
        let c = &self.config.clustering;
        Ok(match c.strategy {
            ClusterStrategy::Density => {
                let result = c.density_engine().cluster(embeddings)?;
                (
                    result.assignment,
                    ClusteringSummary::Density {
                        eps: result.eps,
                        eps_source: result.eps_source,
                    },
                )
            }
            ClusterStrategy::Partition => {
                let result = c.partition_engine().cluster(embeddings)?;
                (
                    result.assignment,
                    ClusteringSummary::Partition {
                        chosen_k: result.chosen_k,
                    },
                )
            }
        })
    }

    /// Retrieve → classify → persist for one cluster. Never fails: every
    /// error becomes the cluster's outcome.
    #[instrument(
        skip(self, job),
        fields(cluster_id = job.cluster_id, members = job.member_ids.len())
    )]
    async fn process_cluster(&self, kind: EntityKind, job: ClusterJob) -> ClassificationResult {
        let started = Instant::now();
        let mut result = ClassificationResult {
            cluster_id: ClusterId::Cluster(job.cluster_id),
            kind,
            outcome: ClusterOutcome::Unknown,
            member_ids: job.member_ids,
            candidates: Vec::new(),
        };
        let retry = &self.config.retry;

        self.set_state(PipelineState::Retrieving);
        let query = job.member_names.join("\n");
        let top_k = self.config.retrieval.top_k;
        let retrieved = retry
            .run("retrieve", || self.retriever.retrieve(&query, kind, top_k))
            .await;
        let candidates = match retrieved {
            Ok(c) if c.is_empty() => {
                return fail(result, FailureStage::Retrieving, "no candidate classes returned");
            }
            Ok(c) => c,
            Err(e) => return fail(result, FailureStage::Retrieving, e),
        };
        debug!(candidates = ?candidates, "Candidates retrieved");
        result.candidates = candidates;

        self.set_state(PipelineState::Classifying);
        let classified = self
            .classifier
            .classify(&job.member_names, &result.candidates)
            .await;
        let class = match classified {
            Ok(Label::Class(class)) => class,
            Ok(Label::Unknown) => {
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "Cluster left UNKNOWN");
                result.outcome = ClusterOutcome::Unknown;
                return result;
            }
            Err(e) => return fail(result, FailureStage::Classifying, e),
        };

        self.set_state(PipelineState::Persisting);
        let persisted = retry
            .run("persist", || self.graph.upsert_many(&result.member_ids, &class))
            .await;
        if let Err(e) = persisted {
            return fail(result, FailureStage::Persisting, e);
        }

        info!(
            label = %class,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Cluster classified"
        );
        result.outcome = ClusterOutcome::Classified { label: class };
        result
    }
}

fn fail(
    mut result: ClassificationResult,
    stage: FailureStage,
    error: impl fmt::Display,
) -> ClassificationResult {
    warn!(cluster_id = %result.cluster_id, %stage, error = %error, "Cluster failed");
    result.outcome = ClusterOutcome::Error {
        stage,
        message: error.to_string(),
    };
    result
}
