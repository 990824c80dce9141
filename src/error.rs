//! Error types for the classification pipeline
//!
//! Per-cluster failures (`ServiceError`, `ClassifierError`) are caught at the
//! cluster boundary and recorded as outcomes. Only `PipelineError` escapes a
//! run, and only `PipelineError::Fatal` reports a run that was cut short.

use thiserror::Error;

use crate::pipeline::RunReport;

/// Invalid clustering input or parameters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusterError {
    #[error("Vector {index} has dimension {found}, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },

    #[error("Vector {index} contains a non-finite component")]
    NonFinite { index: usize },

    #[error("Invalid clustering parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

impl ClusterError {
    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        ClusterError::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

/// Failure of an external collaborator call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    /// Network hiccup, timeout, rate limit: worth retrying.
    #[error("{service} unavailable: {message}")]
    Unavailable {
        service: &'static str,
        message: String,
    },

    /// Malformed request/response, auth failure: retrying will not help.
    #[error("{service} rejected request: {message}")]
    Rejected {
        service: &'static str,
        message: String,
    },

    #[error("{service} returned an empty result")]
    Empty { service: &'static str },
}

impl ServiceError {
    pub fn unavailable(service: &'static str, message: impl Into<String>) -> Self {
        ServiceError::Unavailable {
            service,
            message: message.into(),
        }
    }

    pub fn rejected(service: &'static str, message: impl Into<String>) -> Self {
        ServiceError::Rejected {
            service,
            message: message.into(),
        }
    }

    /// Whether a retry policy should try the call again.
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Unavailable { .. })
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        let transient = e.is_timeout() || e.is_connect() || e.is_request();
        if transient {
            ServiceError::unavailable("http", e.to_string())
        } else {
            ServiceError::rejected("http", e.to_string())
        }
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for ServiceError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                ServiceError::unavailable("postgres", e.to_string())
            }
            other => ServiceError::rejected("postgres", other.to_string()),
        }
    }
}

/// Hard failure of the constrained classifier. A response outside the
/// candidate set is NOT an error: it downgrades to `Label::Unknown`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassifierError {
    #[error("No candidates supplied for classification")]
    NoCandidates,

    #[error("No member names supplied for classification")]
    NoMembers,

    #[error("Generative service failed: {0}")]
    Service(#[from] ServiceError),
}

/// Errors that escape a pipeline run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid input: {0}")]
    Input(String),

    #[error("Clustering failed: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Entities or their embeddings could not be loaded for a run.
    #[error("Failed to load entities: {0}")]
    Hydration(#[from] ServiceError),

    /// External services are pervasively unavailable. Carries the partial
    /// report so the caller can see which clusters finished.
    #[error("Run aborted after {consecutive_failures} consecutive cluster failures")]
    Fatal {
        consecutive_failures: usize,
        report: Box<RunReport>,
    },
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
