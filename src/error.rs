//! Error taxonomy for provider calls and configuration.
//!
//! Two failure classes cross module boundaries:
//!
//! - [`ProviderError`] — a single provider call (search, fetch, embed,
//!   index, rerank, summarize) failed. The orchestrator recovers from
//!   these locally: the failing query/chunk/thread is logged and skipped,
//!   and the run continues.
//! - [`ConfigError`] — the engine config file or a per-run request is
//!   invalid, or a run id does not exist. Surfaced immediately; a run with
//!   an invalid config never leaves `Queued`.
//!
//! Anything else that escapes a whole phase is treated as fatal: the run
//! is marked `Failed` with the error message attached to its metrics.

use thiserror::Error;

/// Errors returned by external provider calls.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The search backend rejected or failed a query.
    #[error("search failed for query '{query}': {message}")]
    Search { query: String, message: String },

    /// Full message bodies could not be fetched.
    #[error("body fetch failed: {message}")]
    Fetch { message: String },

    /// Embedding generation failed.
    #[error("embedding failed: {message}")]
    Embedding { message: String },

    /// A lexical or vector index operation failed.
    #[error("index operation failed: {message}")]
    Index { message: String },

    /// Reranking failed.
    #[error("rerank failed: {message}")]
    Rerank { message: String },

    /// Thread summarization failed.
    #[error("summarization failed: {message}")]
    Summarize { message: String },
}

/// Errors raised while loading the engine config or validating a run request.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {source}")]
    Parse {
        #[source]
        source: toml::de::Error,
    },

    /// A config value is out of range or inconsistent.
    #[error("invalid config: {reason}")]
    Invalid { reason: String },

    #[error("question must not be empty")]
    EmptyQuestion,

    #[error("date-after {after} is not before date-before {before}")]
    InvertedDateRange { after: String, before: String },

    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },
}
