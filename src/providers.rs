//! Provider contracts consumed by the run orchestrator.
//!
//! Each trait is a narrow scoring or generation contract; the orchestrator
//! never depends on how a provider computes its answers. Implementations
//! are injected through [`ProviderSet`] — there are no module-level
//! globals.
//!
//! All calls that cross a process or network boundary return
//! [`ProviderError`], which the orchestrator treats as a skippable,
//! per-query (or per-chunk, per-thread) failure.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::EmbeddingConfig;
use crate::error::{ConfigError, ProviderError};
use crate::models::{
    MailMessage, MessageMeta, ScoredCandidate, SearchConstraints, SummaryChunk, ThreadDigest,
};

/// Access to the email corpus being searched.
///
/// The adapter owns the provider's query-language syntax: the planner
/// builds term logic and appends whatever [`constraint_clause`]
/// (`SearchProvider::constraint_clause`) renders for the run constraints.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Search messages by query string. Metadata only, no bodies.
    async fn search(&self, query: &str) -> Result<Vec<MessageMeta>, ProviderError>;

    /// Fetch full message bodies by id.
    async fn fetch_bodies(&self, ids: &[String]) -> Result<Vec<MailMessage>, ProviderError>;

    /// Render run constraints (date range, sender domains) in this
    /// provider's query syntax. Empty string when unconstrained.
    fn constraint_clause(&self, constraints: &SearchConstraints) -> String;
}

/// Text embedding backend with a fixed output dimensionality.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;

    fn dims(&self) -> usize;

    fn model_name(&self) -> &str;
}

/// Lexical (keyword) relevance index over chunk texts.
#[async_trait]
pub trait LexicalIndex: Send + Sync {
    /// Replace the index contents with the given `(id, text)` entries.
    async fn index(&self, entries: &[(String, String)]) -> Result<(), ProviderError>;

    /// Return up to `top_k` `(id, score)` pairs, best first.
    async fn search(&self, query: &str, top_k: usize)
        -> Result<Vec<(String, f32)>, ProviderError>;
}

/// Vector similarity index over chunk embeddings.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Replace the index contents with the given `(id, vector)` entries.
    async fn index(&self, entries: &[(String, Vec<f32>)]) -> Result<(), ProviderError>;

    /// Return up to `top_k` `(id, score)` pairs, best first.
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<(String, f32)>, ProviderError>;
}

/// Cross-scoring reranker. May reorder and truncate its input; the scores
/// it returns replace the blended scores the candidates arrived with.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<ScoredCandidate>,
    ) -> Result<Vec<ScoredCandidate>, ProviderError>;
}

/// Produces a cited markdown summary for one thread's selected chunks.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        chunks: &[SummaryChunk],
        topic: &str,
    ) -> Result<ThreadDigest, ProviderError>;
}

/// Bundle of provider instances injected into the orchestrator.
#[derive(Clone)]
pub struct ProviderSet {
    pub search: Arc<dyn SearchProvider>,
    pub embedding: Arc<dyn EmbeddingProvider>,
    pub lexical: Arc<dyn LexicalIndex>,
    pub vector: Arc<dyn VectorIndex>,
    pub reranker: Arc<dyn Reranker>,
    pub summarizer: Arc<dyn Summarizer>,
}

/// Create the embedding provider named by the configuration.
///
/// | Config value | Provider |
/// |--------------|----------|
/// | `"fixture"`  | [`crate::fixture::HashEmbedder`] |
/// | `"openai"`   | [`crate::openai::OpenAiEmbedder`] |
pub fn create_embedding_provider(
    config: &EmbeddingConfig,
) -> Result<Arc<dyn EmbeddingProvider>, ConfigError> {
    match config.provider.as_str() {
        "fixture" => Ok(Arc::new(crate::fixture::HashEmbedder::new(
            config.dims.unwrap_or(256),
        ))),
        "openai" => Ok(Arc::new(crate::openai::OpenAiEmbedder::new(config)?)),
        other => Err(ConfigError::Invalid {
            reason: format!("unknown embedding provider: '{}'", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_embedding_provider_fixture() {
        let config = EmbeddingConfig::default();
        let provider = create_embedding_provider(&config).unwrap();
        assert_eq!(provider.model_name(), "fixture-hash-embedder");
        assert_eq!(provider.dims(), 256);
    }

    #[test]
    fn test_create_embedding_provider_unknown() {
        let config = EmbeddingConfig {
            provider: "sentencepiece".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(create_embedding_provider(&config).is_err());
    }
}
