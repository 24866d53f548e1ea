//! OpenAI embeddings API adapter.
//!
//! Implements [`EmbeddingProvider`] against `POST /v1/embeddings` with
//! batching and retry.
//!
//! # Retry Strategy
//!
//! Transient failures use exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::config::EmbeddingConfig;
use crate::error::{ConfigError, ProviderError};
use crate::providers::EmbeddingProvider;

const EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";

/// Embedding provider backed by the OpenAI API.
///
/// Requires `OPENAI_API_KEY` in the environment at construction time.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, ConfigError> {
        let model = config.model.clone().ok_or_else(|| ConfigError::Invalid {
            reason: "embedding.model required for the openai provider".to_string(),
        })?;
        let dims = config.dims.ok_or_else(|| ConfigError::Invalid {
            reason: "embedding.dims required for the openai provider".to_string(),
        })?;
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| ConfigError::Invalid {
            reason: "OPENAI_API_KEY environment variable not set".to_string(),
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ConfigError::Invalid {
                reason: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            api_key,
            model,
            dims,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err: Option<ProviderError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(attempt, ?delay, "retrying embedding request");
                tokio::time::sleep(delay).await;
            }

            let response = self
                .client
                .post(EMBEDDINGS_URL)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match response {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value =
                            response.json().await.map_err(|e| ProviderError::Embedding {
                                message: format!("invalid response body: {}", e),
                            })?;
                        return parse_response(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(ProviderError::Embedding {
                            message: format!("API error {}: {}", status, body_text),
                        });
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    return Err(ProviderError::Embedding {
                        message: format!("API error {}: {}", status, body_text),
                    });
                }
                Err(e) => {
                    last_err = Some(ProviderError::Embedding {
                        message: e.to_string(),
                    });
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or(ProviderError::Embedding {
            message: "embedding failed after retries".to_string(),
        }))
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            embeddings.extend(self.embed_batch(batch).await?);
        }
        Ok(embeddings)
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn parse_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ProviderError::Embedding {
            message: "invalid response: missing data array".to_string(),
        })?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| ProviderError::Embedding {
                message: "invalid response: missing embedding".to_string(),
            })?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }

    Ok(embeddings)
}
