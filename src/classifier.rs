//! Constrained classifier
//!
//! One generative call per cluster. The model sees the retrieved candidate
//! classes and the member names, and must answer with exactly one candidate
//! or the `N/A` sentinel. Anything else is treated as a hallucination and
//! downgraded to [`Label::Unknown`], so a label outside the candidate set can
//! never reach the graph.

use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::error::ClassifierError;
use crate::retry::RetryPolicy;
use crate::services::GenerativeClassificationService;
use crate::types::Label;

/// Reply meaning "none of the candidates fit".
pub const NO_MATCH_SENTINEL: &str = "N/A";

pub struct ConstrainedClassifier {
    service: Arc<dyn GenerativeClassificationService>,
    retry: RetryPolicy,
}

impl ConstrainedClassifier {
    pub fn new(service: Arc<dyn GenerativeClassificationService>) -> Self {
        Self {
            service,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// System instruction enumerating exactly `candidates`.
    pub fn system_prompt(candidates: &[String]) -> String {
        let mut prompt = String::from(
            "You are given a cluster of BACnet entity names that all refer to the same kind \
             of equipment or point. Output the Brick schema class of the whole cluster. \
             ONLY output the Brick class. ONLY output one Brick class. ONLY select a Brick \
             class from the candidate classes below, copied exactly as written. ",
        );
        prompt.push_str(&format!(
            "If none of the candidates fits, output {}.\n\n",
            NO_MATCH_SENTINEL
        ));
        prompt.push_str("CANDIDATE BRICK CLASSES:\n\n");
        prompt.push_str(&candidates.join("\n"));
        prompt.push('\n');
        prompt
    }

    /// Classify a cluster by its member names.
    #[instrument(skip_all, fields(members = member_names.len(), candidates = candidates.len()))]
    pub async fn classify(
        &self,
        member_names: &[String],
        candidates: &[String],
    ) -> Result<Label, ClassifierError> {
        if candidates.is_empty() {
            return Err(ClassifierError::NoCandidates);
        }
        if member_names.is_empty() {
            return Err(ClassifierError::NoMembers);
        }

        let system = Self::system_prompt(candidates);
        let user = member_names.join("\n");

        let response = self
            .retry
            .run("classify", || self.service.complete(&system, &user))
            .await?;

        Ok(Self::interpret(&response, candidates))
    }

    /// Map a raw model reply onto a label.
    pub fn interpret(response: &str, candidates: &[String]) -> Label {
        let answer = response.trim();
        if answer == NO_MATCH_SENTINEL {
            debug!("Model declined to classify cluster");
            return Label::Unknown;
        }
        if candidates.iter().any(|c| c.trim() == answer) {
            Label::Class(to_identifier(answer))
        } else {
            warn!(
                response = %answer,
                candidates = ?candidates,
                "Model answered outside the candidate set, labelling UNKNOWN"
            );
            Label::Unknown
        }
    }
}

/// Candidate text as a class identifier: whitespace runs become `_`.
pub fn to_identifier(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join("_")
}
