//! Unsupervised Brick classification for BACnet entities
//!
//! Groups free-text device and point names by proximity in embedding space,
//! narrows each group to a handful of candidate Brick classes by vector
//! retrieval, and asks a generative model to pick one of those candidates
//! for the whole group. Accepted labels are written back idempotently.
//!
//! # Architecture
//!
//! ```text
//! Entities + embeddings
//!       │
//!       ▼
//! ┌─────────────────────────────────────────┐
//! │  Cluster engine (density or partition)  │
//! │  knee-selected eps / silhouette-k       │
//! │  → {cluster id → member indices}        │
//! └─────────────────────────────────────────┘
//!       │   (noise skipped)
//!       ▼
//! ┌─────────────────────────────────────────┐
//! │  Candidate retrieval (per cluster)      │
//! │  "AHU-1\nAHU-2" → [AHU, VAV, Chiller]   │
//! └─────────────────────────────────────────┘
//!       │
//!       ▼
//! ┌─────────────────────────────────────────┐
//! │  Constrained classifier (one LLM call)  │
//! │  answer ∉ candidates → UNKNOWN          │
//! └─────────────────────────────────────────┘
//!       │
//!       ▼
//! ┌─────────────────────────────────────────┐
//! │  Graph store upsert (atomic per cluster)│
//! └─────────────────────────────────────────┘
//! ```
//!
//! All external collaborators are injected as trait objects (see
//! [`services`]), so the pipeline runs unchanged against OpenAI/pgvector in
//! production and against in-memory doubles in tests.

pub mod classifier;
pub mod cleaner;
pub mod clustering;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod retry;
pub mod services;
pub mod telemetry;
pub mod types;
pub mod vocabulary;

pub use classifier::ConstrainedClassifier;
pub use clustering::{ClusterMap, DensityClusterer, PartitionClusterer};
pub use config::PipelineConfig;
pub use error::{PipelineError, ServiceError};
pub use pipeline::{Coordinator, PipelineState, RunReport};
pub use types::*;
