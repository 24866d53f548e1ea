use anyhow::Result;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;
use crate::models::SearchConstraints;

/// Engine-level configuration, loaded once from TOML.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db: DbConfig {
                path: ":memory:".to_string(),
            },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            ranking: RankingConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// SQLite database path, or `":memory:"` for an in-process database.
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_words")]
    pub chunk_words: usize,
    #[serde(default = "default_overlap_words")]
    pub overlap_words: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_words: default_chunk_words(),
            overlap_words: default_overlap_words(),
        }
    }
}

fn default_chunk_words() -> usize {
    800
}
fn default_overlap_words() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Below this precision-proxy for two consecutive iterations, stop.
    #[serde(default = "default_min_precision")]
    pub min_precision: f64,
    /// Below this novelty-gain for two consecutive iterations, stop.
    #[serde(default = "default_min_novelty_gain")]
    pub min_novelty_gain: f64,
    #[serde(default = "default_max_queries_per_iteration")]
    pub max_queries_per_iteration: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            min_precision: default_min_precision(),
            min_novelty_gain: default_min_novelty_gain(),
            max_queries_per_iteration: default_max_queries_per_iteration(),
        }
    }
}

fn default_max_iterations() -> u32 {
    4
}
fn default_min_precision() -> f64 {
    0.3
}
fn default_min_novelty_gain() -> f64 {
    0.02
}
fn default_max_queries_per_iteration() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct RankingConfig {
    #[serde(default = "default_lexical_top_k")]
    pub lexical_top_k: usize,
    #[serde(default = "default_vector_top_k")]
    pub vector_top_k: usize,
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f64,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    /// Chunks with a rerank score strictly above this are selected.
    #[serde(default = "default_selection_threshold")]
    pub selection_threshold: f64,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            lexical_top_k: default_lexical_top_k(),
            vector_top_k: default_vector_top_k(),
            lexical_weight: default_lexical_weight(),
            vector_weight: default_vector_weight(),
            selection_threshold: default_selection_threshold(),
        }
    }
}

fn default_lexical_top_k() -> usize {
    100
}
fn default_vector_top_k() -> usize {
    50
}
fn default_lexical_weight() -> f64 {
    0.7
}
fn default_vector_weight() -> f64 {
    0.3
}
fn default_selection_threshold() -> f64 {
    0.1
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "fixture".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_remote(&self) -> bool {
        self.provider == "openai"
    }
}

/// Per-run request: the question plus its search constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub question: String,
    #[serde(default)]
    pub after: Option<NaiveDate>,
    #[serde(default)]
    pub before: Option<NaiveDate>,
    #[serde(default)]
    pub domains: Vec<String>,
    /// Overrides `retrieval.max_iterations` for this run when set.
    #[serde(default)]
    pub max_iterations: Option<u32>,
}

impl RunConfig {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            after: None,
            before: None,
            domains: Vec::new(),
            max_iterations: None,
        }
    }

    pub fn constraints(&self) -> SearchConstraints {
        SearchConstraints {
            after: self.after,
            before: self.before,
            domains: self.domains.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.question.trim().is_empty() {
            return Err(ConfigError::EmptyQuestion);
        }
        if let (Some(after), Some(before)) = (self.after, self.before) {
            if after >= before {
                return Err(ConfigError::InvertedDateRange {
                    after: after.to_string(),
                    before: before.to_string(),
                });
            }
        }
        if self.domains.iter().any(|d| d.trim().is_empty()) {
            return Err(ConfigError::Invalid {
                reason: "sender domains must not be empty strings".to_string(),
            });
        }
        if self.max_iterations == Some(0) {
            return Err(ConfigError::Invalid {
                reason: "max_iterations must be >= 1".to_string(),
            });
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;

    let config: Config =
        toml::from_str(&content).map_err(|source| ConfigError::Parse { source })?;

    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.chunking.chunk_words == 0 {
        return Err(ConfigError::Invalid {
            reason: "chunking.chunk_words must be > 0".to_string(),
        });
    }
    if config.chunking.overlap_words >= config.chunking.chunk_words {
        return Err(ConfigError::Invalid {
            reason: "chunking.overlap_words must be < chunking.chunk_words".to_string(),
        });
    }
    if config.retrieval.max_iterations == 0 {
        return Err(ConfigError::Invalid {
            reason: "retrieval.max_iterations must be >= 1".to_string(),
        });
    }
    for (name, value) in [
        ("retrieval.min_precision", config.retrieval.min_precision),
        (
            "retrieval.min_novelty_gain",
            config.retrieval.min_novelty_gain,
        ),
        ("ranking.lexical_weight", config.ranking.lexical_weight),
        ("ranking.vector_weight", config.ranking.vector_weight),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(ConfigError::Invalid {
                reason: format!("{} must be in [0.0, 1.0]", name),
            });
        }
    }
    if config.ranking.lexical_top_k == 0 || config.ranking.vector_top_k == 0 {
        return Err(ConfigError::Invalid {
            reason: "ranking top_k values must be >= 1".to_string(),
        });
    }
    if config.embedding.is_remote() {
        if config.embedding.model.is_none() {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "embedding.model must be set when provider is '{}'",
                    config.embedding.provider
                ),
            });
        }
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.chunking.chunk_words, 800);
        assert_eq!(config.chunking.overlap_words, 100);
        assert_eq!(config.retrieval.max_iterations, 4);
        assert_eq!(config.retrieval.max_queries_per_iteration, 3);
        assert_eq!(config.ranking.lexical_top_k, 100);
        assert_eq!(config.ranking.vector_top_k, 50);
        assert!((config.ranking.lexical_weight - 0.7).abs() < 1e-9);
        assert!((config.ranking.selection_threshold - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_run_config_validation() {
        assert!(RunConfig::new("why was the machine returned").validate().is_ok());

        let empty = RunConfig::new("   ");
        assert!(matches!(
            empty.validate(),
            Err(ConfigError::EmptyQuestion)
        ));

        let mut inverted = RunConfig::new("q");
        inverted.after = NaiveDate::from_ymd_opt(2025, 3, 1);
        inverted.before = NaiveDate::from_ymd_opt(2025, 2, 1);
        assert!(matches!(
            inverted.validate(),
            Err(ConfigError::InvertedDateRange { .. })
        ));

        let mut zero_iters = RunConfig::new("q");
        zero_iters.max_iterations = Some(0);
        assert!(zero_iters.validate().is_err());
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk() {
        let mut config = Config::default();
        config.chunking.overlap_words = config.chunking.chunk_words;
        assert!(validate_config(&config).is_err());
    }
}
