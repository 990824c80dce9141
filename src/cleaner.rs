//! Point-name cleaning
//!
//! BACnet point names often carry building, floor and device prefixes that
//! drown out the part that says what the point measures. Before embedding,
//! names can be rewritten by the generative service, one chunk per call and
//! one name per line. A chunk whose reply cannot be lined up with its input
//! keeps its original names.

use std::sync::Arc;
use tracing::{info, warn};

use crate::retry::RetryPolicy;
use crate::services::GenerativeClassificationService;

pub const DEFAULT_CHUNK_SIZE: usize = 100;

const CLEANER_PROMPT: &str = "You streamline BACnet point names. For every input line, remove \
device, building, floor and space details and keep only the descriptors of what the point \
measures or controls. Output exactly one cleaned name per input line, in the same order, \
with no numbering and no extra text.";

pub struct NameCleaner {
    service: Arc<dyn GenerativeClassificationService>,
    retry: RetryPolicy,
    chunk_size: usize,
}

impl NameCleaner {
    pub fn new(service: Arc<dyn GenerativeClassificationService>) -> Self {
        Self {
            service,
            retry: RetryPolicy::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Cleaned names, one per input, same order.
    pub async fn clean(&self, names: &[String]) -> Vec<String> {
        let mut out = Vec::with_capacity(names.len());
        let mut kept = 0usize;

        for (chunk_index, chunk) in names.chunks(self.chunk_size).enumerate() {
            let user = chunk.join("\n");
            let reply = self
                .retry
                .run("clean_names", || self.service.complete(CLEANER_PROMPT, &user))
                .await;

            match reply {
                Ok(text) => match align(chunk, &text) {
                    Some(cleaned) => out.extend(cleaned),
                    None => {
                        warn!(
                            chunk = chunk_index,
                            expected = chunk.len(),
                            "Cleaned name count mismatch, keeping originals"
                        );
                        kept += chunk.len();
                        out.extend(chunk.iter().cloned());
                    }
                },
                Err(e) => {
                    warn!(
                        chunk = chunk_index,
                        error = %e,
                        "Name cleaning failed, keeping originals"
                    );
                    kept += chunk.len();
                    out.extend(chunk.iter().cloned());
                }
            }
        }

        info!(total = names.len(), kept_original = kept, "Point names cleaned");
        out
    }
}

/// Pair reply lines with the chunk; blank lines fall back to the original.
fn align(chunk: &[String], reply: &str) -> Option<Vec<String>> {
    let lines: Vec<&str> = reply.trim().lines().map(str::trim).collect();
    if lines.len() != chunk.len() {
        return None;
    }
    Some(
        chunk
            .iter()
            .zip(lines)
            .map(|(original, line)| {
                if line.is_empty() {
                    original.clone()
                } else {
                    line.to_string()
                }
            })
            .collect(),
    )
}
