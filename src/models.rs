//! Core data models used throughout mailtrawl.
//!
//! These types represent the messages, chunks, metrics, and summaries that
//! flow through the retrieval and ranking pipeline. Everything here is
//! scoped to a single run; run identity is carried separately by the store.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a run.
///
/// Phases advance strictly in order `Queued → Fetching → Normalizing →
/// Ranking → Summarizing → Exporting → Done`; `Paused`, `Cancelled`, and
/// `Failed` are reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Fetching,
    Normalizing,
    Ranking,
    Summarizing,
    Exporting,
    Done,
    Failed,
    Paused,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Fetching => "fetching",
            RunStatus::Normalizing => "normalizing",
            RunStatus::Ranking => "ranking",
            RunStatus::Summarizing => "summarizing",
            RunStatus::Exporting => "exporting",
            RunStatus::Done => "done",
            RunStatus::Failed => "failed",
            RunStatus::Paused => "paused",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<RunStatus> {
        match s {
            "queued" => Some(RunStatus::Queued),
            "fetching" => Some(RunStatus::Fetching),
            "normalizing" => Some(RunStatus::Normalizing),
            "ranking" => Some(RunStatus::Ranking),
            "summarizing" => Some(RunStatus::Summarizing),
            "exporting" => Some(RunStatus::Exporting),
            "done" => Some(RunStatus::Done),
            "failed" => Some(RunStatus::Failed),
            "paused" => Some(RunStatus::Paused),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Done | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Search constraints attached to a run.
///
/// Rendering into provider query syntax is owned by the search provider
/// adapter, not by the planner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchConstraints {
    pub after: Option<NaiveDate>,
    pub before: Option<NaiveDate>,
    pub domains: Vec<String>,
}

/// Metadata for a message as returned by the search provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMeta {
    pub id: String,
    pub thread_id: String,
    pub date: DateTime<Utc>,
    pub from_email: String,
    pub subject: String,
    pub labels: Vec<String>,
    pub snippet: String,
}

/// A full message with body, as returned by a body fetch.
#[derive(Debug, Clone)]
pub struct MailMessage {
    pub meta: MessageMeta,
    pub body: String,
}

/// A planned search query with the reasoning that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    pub query: String,
    pub rationale: String,
}

/// Metrics for one completed retrieval iteration. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationMetrics {
    pub iteration: u32,
    pub queries_tried: u32,
    pub new_messages: u64,
    pub new_threads: u64,
    /// Fraction of this iteration's fetched messages matching the fixed
    /// domain-term list. In `[0, 1]`; 0 when nothing was fetched.
    pub precision_proxy: f64,
    /// `new_threads / max(total_seen_threads, 1)` after this iteration.
    pub novelty_gain: f64,
    pub duration_ms: u64,
    pub stop_reason: Option<String>,
}

/// A bounded span of one message body, the unit of ranking.
///
/// Scores start at zero and are filled in by the ranking stage; `selected`
/// stays false until ranking has run.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    /// `"{message_id}:{index}"` — unique per run.
    pub chunk_id: String,
    pub message_id: String,
    pub index: i64,
    pub text: String,
    pub token_count: i64,
    pub lexical_score: f64,
    pub vector_score: f64,
    pub rerank_score: f64,
    pub selected: bool,
}

/// A candidate passed to (and returned by) the reranker.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub id: String,
    pub text: String,
    pub score: f64,
}

/// A chunk handed to the summarizer, with enough provenance for citations.
#[derive(Debug, Clone)]
pub struct SummaryChunk {
    pub message_id: String,
    pub date: DateTime<Utc>,
    pub text: String,
}

/// One cited claim inside a thread summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryBullet {
    pub text: String,
    /// Verbatim supporting quote from the source message.
    pub quote: String,
    pub source_message_id: String,
    pub source_date: DateTime<Utc>,
}

/// Raw summarizer output for one thread.
#[derive(Debug, Clone)]
pub struct ThreadDigest {
    pub summary_md: String,
    pub bullets: Vec<SummaryBullet>,
    pub confidence: f64,
}

/// Persisted summary for a thread with at least one selected chunk.
#[derive(Debug, Clone)]
pub struct ThreadSummaryRecord {
    pub thread_id: String,
    pub summary_md: String,
    pub bullets: Vec<SummaryBullet>,
    pub confidence: f64,
}
