//! OpenAI-compatible HTTP client
//!
//! Implements both [`GenerativeClassificationService`] (chat completions) and
//! [`EmbeddingService`] (embeddings endpoint). Any server speaking the same
//! wire format works through `OPENAI_BASE_URL`.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::{EmbeddingService, GenerativeClassificationService};
use crate::error::ServiceError;
use crate::types::EmbeddingVector;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
const DEFAULT_MAX_TOKENS: u32 = 512;

const SERVICE: &str = "openai";

#[derive(Clone)]
pub struct OpenAiClient {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
    model: String,
    embedding_model: String,
    max_tokens: u32,
}

impl OpenAiClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    /// Build from `OPENAI_API_KEY`, with optional `OPENAI_MODEL`,
    /// `OPENAI_EMBEDDING_MODEL` and `OPENAI_BASE_URL`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let mut client = Self::new(api_key);
        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            client.model = model;
        }
        if let Ok(model) = std::env::var("OPENAI_EMBEDDING_MODEL") {
            client.embedding_model = model;
        }
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            client.base_url = url;
        }
        Ok(client)
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_embedding_model(mut self, model: &str) -> Self {
        self.embedding_model = model.to_string();
        self
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<String, ServiceError> {
        let response = self
            .client
            .post(self.endpoint(path))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            let snippet: String = text.chars().take(500).collect();
            let message = format!("API error {}: {}", status, snippet);
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                ServiceError::unavailable(SERVICE, message)
            } else {
                ServiceError::rejected(SERVICE, message)
            });
        }
        Ok(text)
    }
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

fn parse_chat(body: &str) -> Result<String, ServiceError> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| ServiceError::rejected(SERVICE, format!("Failed to parse response: {}", e)))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or(ServiceError::Empty { service: SERVICE })
}

fn parse_embeddings(body: &str, expected: usize) -> Result<Vec<EmbeddingVector>, ServiceError> {
    let parsed: EmbeddingResponse = serde_json::from_str(body)
        .map_err(|e| ServiceError::rejected(SERVICE, format!("Failed to parse response: {}", e)))?;
    let mut items = parsed.data;
    if items.len() != expected {
        return Err(ServiceError::rejected(
            SERVICE,
            format!("expected {} embeddings, got {}", expected, items.len()),
        ));
    }
    // The API may return items out of order.
    items.sort_by_key(|item| item.index);
    Ok(items.into_iter().map(|item| item.embedding).collect())
}

#[async_trait]
impl GenerativeClassificationService for OpenAiClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String, ServiceError> {
        let body = serde_json::json!({
            "model": &self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user}
            ],
            "temperature": 0.0,
            "max_tokens": self.max_tokens
        });
        let text = self.post("chat/completions", &body).await?;
        tracing::debug!(
            model = %self.model,
            "OpenAI raw response: {}",
            text.chars().take(1000).collect::<String>()
        );
        parse_chat(&text)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl EmbeddingService for OpenAiClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>, ServiceError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": &self.embedding_model,
            "input": texts
        });
        let text = self.post("embeddings", &body).await?;
        parse_embeddings(&text, texts.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":" AHU \n"}}]}"#;
        assert_eq!(parse_chat(body).unwrap(), " AHU \n");
    }

    #[test]
    fn test_parse_chat_no_choices() {
        assert_eq!(
            parse_chat(r#"{"choices":[]}"#),
            Err(ServiceError::Empty { service: SERVICE })
        );
        assert!(matches!(
            parse_chat("not json"),
            Err(ServiceError::Rejected { .. })
        ));
    }

    #[test]
    fn test_parse_embeddings_reorders_by_index() {
        let body = r#"{"data":[
            {"index":1,"embedding":[0.5,0.5]},
            {"index":0,"embedding":[1.0,0.0]}
        ]}"#;
        let vectors = parse_embeddings(body, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.5, 0.5]]);
    }

    #[test]
    fn test_parse_embeddings_count_mismatch() {
        let body = r#"{"data":[{"index":0,"embedding":[1.0]}]}"#;
        assert!(parse_embeddings(body, 2).is_err());
    }

    #[test]
    fn test_endpoint_joins_paths() {
        let client =
            OpenAiClient::new("key".to_string()).with_base_url("http://localhost:8080/v1/");
        assert_eq!(
            client.endpoint("embeddings"),
            "http://localhost:8080/v1/embeddings"
        );
        assert_eq!(client.model_name(), DEFAULT_MODEL);
    }
}
