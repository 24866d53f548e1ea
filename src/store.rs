//! Run-scoped evidence store.
//!
//! Typed accessors over the SQLite schema created by [`crate::migrate`].
//! The store is an audit copy of the orchestrator's in-memory state:
//! query records, iteration metrics, and term expansions are append-only,
//! messages are unique per `(run_id, message_id)`, and chunk scores are
//! only touched by the ranking stage.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;

use crate::config::RunConfig;
use crate::models::{
    ChunkRecord, IterationMetrics, MailMessage, MessageMeta, QueryPlan, RunStatus,
    SummaryBullet, ThreadSummaryRecord,
};

/// A run row as stored.
#[derive(Debug, Clone)]
pub struct StoredRun {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub question: String,
    pub config: RunConfig,
    pub status: RunStatus,
    pub stop_reason: Option<String>,
    pub metrics: Option<serde_json::Value>,
}

/// A persisted query audit row.
#[derive(Debug, Clone)]
pub struct QueryRow {
    pub iteration: u32,
    pub query: String,
    pub rationale: String,
    pub hits: u64,
    pub new_msgs: u64,
    pub new_threads: u64,
}

fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

// ─── Runs ──────────────────────────────────────────────────────────────

pub async fn insert_run(
    pool: &SqlitePool,
    run_id: &str,
    created_at: DateTime<Utc>,
    config: &RunConfig,
) -> Result<()> {
    let params = serde_json::to_string(config).context("serialize run params")?;
    sqlx::query(
        "INSERT INTO runs (run_id, created_at, question, params_json, status) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(run_id)
    .bind(created_at.timestamp())
    .bind(&config.question)
    .bind(params)
    .bind(RunStatus::Queued.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn load_run(pool: &SqlitePool, run_id: &str) -> Result<Option<StoredRun>> {
    let row = sqlx::query(
        "SELECT run_id, created_at, question, params_json, status, stop_reason, metrics_json FROM runs WHERE run_id = ?",
    )
    .bind(run_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let params: String = row.get("params_json");
    let config: RunConfig = serde_json::from_str(&params).context("parse run params")?;
    let status_str: String = row.get("status");
    let status = RunStatus::parse(&status_str)
        .with_context(|| format!("unknown run status '{}'", status_str))?;
    let metrics: Option<String> = row.get("metrics_json");
    let metrics = match metrics {
        Some(json) => Some(serde_json::from_str(&json).context("parse run metrics")?),
        None => None,
    };

    Ok(Some(StoredRun {
        run_id: row.get("run_id"),
        created_at: timestamp_to_datetime(row.get("created_at")),
        question: row.get("question"),
        config,
        status,
        stop_reason: row.get("stop_reason"),
        metrics,
    }))
}

pub async fn update_status(pool: &SqlitePool, run_id: &str, status: RunStatus) -> Result<()> {
    sqlx::query("UPDATE runs SET status = ? WHERE run_id = ?")
        .bind(status.as_str())
        .bind(run_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Mark a run failed and attach the error message to its metrics.
pub async fn record_failure(pool: &SqlitePool, run_id: &str, message: &str) -> Result<()> {
    let current: Option<String> =
        sqlx::query_scalar("SELECT metrics_json FROM runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(pool)
            .await?
            .flatten();

    let mut metrics: serde_json::Value = current
        .and_then(|json| serde_json::from_str(&json).ok())
        .unwrap_or_else(|| serde_json::json!({}));
    if let Some(object) = metrics.as_object_mut() {
        object.insert("error".to_string(), serde_json::json!(message));
    }

    sqlx::query("UPDATE runs SET status = ?, metrics_json = ? WHERE run_id = ?")
        .bind(RunStatus::Failed.as_str())
        .bind(metrics.to_string())
        .bind(run_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_stop_reason(pool: &SqlitePool, run_id: &str, reason: &str) -> Result<()> {
    sqlx::query("UPDATE runs SET stop_reason = ? WHERE run_id = ?")
        .bind(reason)
        .bind(run_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_metrics(
    pool: &SqlitePool,
    run_id: &str,
    metrics: &serde_json::Value,
) -> Result<()> {
    sqlx::query("UPDATE runs SET metrics_json = ? WHERE run_id = ?")
        .bind(metrics.to_string())
        .bind(run_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ─── Queries & iterations ──────────────────────────────────────────────

pub async fn insert_query_record(
    pool: &SqlitePool,
    run_id: &str,
    iteration: u32,
    plan: &QueryPlan,
    hits: usize,
    new_msgs: usize,
    new_threads: usize,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO queries (run_id, iteration, query_str, rationale, hits, new_msgs, new_threads)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(run_id)
    .bind(iteration as i64)
    .bind(&plan.query)
    .bind(&plan.rationale)
    .bind(hits as i64)
    .bind(new_msgs as i64)
    .bind(new_threads as i64)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn queries_for_run(pool: &SqlitePool, run_id: &str) -> Result<Vec<QueryRow>> {
    let rows = sqlx::query(
        "SELECT iteration, query_str, rationale, hits, new_msgs, new_threads FROM queries WHERE run_id = ? ORDER BY id",
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| QueryRow {
            iteration: row.get::<i64, _>("iteration") as u32,
            query: row.get("query_str"),
            rationale: row.get::<Option<String>, _>("rationale").unwrap_or_default(),
            hits: row.get::<i64, _>("hits") as u64,
            new_msgs: row.get::<i64, _>("new_msgs") as u64,
            new_threads: row.get::<i64, _>("new_threads") as u64,
        })
        .collect())
}

pub async fn insert_iteration(
    pool: &SqlitePool,
    run_id: &str,
    metrics: &IterationMetrics,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO iterations (run_id, iteration, queries_tried, new_messages, new_threads,
                                precision_proxy, novelty_gain, duration_ms, stop_reason)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(run_id)
    .bind(metrics.iteration as i64)
    .bind(metrics.queries_tried as i64)
    .bind(metrics.new_messages as i64)
    .bind(metrics.new_threads as i64)
    .bind(metrics.precision_proxy)
    .bind(metrics.novelty_gain)
    .bind(metrics.duration_ms as i64)
    .bind(&metrics.stop_reason)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn iterations_for_run(
    pool: &SqlitePool,
    run_id: &str,
) -> Result<Vec<IterationMetrics>> {
    let rows = sqlx::query(
        r#"
        SELECT iteration, queries_tried, new_messages, new_threads, precision_proxy,
               novelty_gain, duration_ms, stop_reason
        FROM iterations WHERE run_id = ? ORDER BY iteration
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| IterationMetrics {
            iteration: row.get::<i64, _>("iteration") as u32,
            queries_tried: row.get::<i64, _>("queries_tried") as u32,
            new_messages: row.get::<i64, _>("new_messages") as u64,
            new_threads: row.get::<i64, _>("new_threads") as u64,
            precision_proxy: row.get("precision_proxy"),
            novelty_gain: row.get("novelty_gain"),
            duration_ms: row.get::<i64, _>("duration_ms") as u64,
            stop_reason: row.get("stop_reason"),
        })
        .collect())
}

// ─── Term expansions ───────────────────────────────────────────────────

pub async fn insert_term_expansion(
    pool: &SqlitePool,
    run_id: &str,
    iteration: u32,
    added: &BTreeSet<String>,
    removed: &BTreeSet<String>,
    evidence: &BTreeSet<String>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO term_expansions (run_id, iteration, added_json, removed_json, evidence_json)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(run_id)
    .bind(iteration as i64)
    .bind(serde_json::to_string(added)?)
    .bind(serde_json::to_string(removed)?)
    .bind(serde_json::to_string(evidence)?)
    .execute(pool)
    .await?;
    Ok(())
}

/// The evidence term set after the most recent expansion, if any.
pub async fn latest_evidence_terms(
    pool: &SqlitePool,
    run_id: &str,
) -> Result<Option<BTreeSet<String>>> {
    let row: Option<String> = sqlx::query_scalar(
        "SELECT evidence_json FROM term_expansions WHERE run_id = ? ORDER BY iteration DESC LIMIT 1",
    )
    .bind(run_id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(json) => Ok(Some(
            serde_json::from_str(&json).context("parse evidence terms")?,
        )),
        None => Ok(None),
    }
}

// ─── Messages ──────────────────────────────────────────────────────────

/// Insert fetched messages, ignoring ids already recorded for this run.
pub async fn insert_messages(
    pool: &SqlitePool,
    run_id: &str,
    messages: &[MailMessage],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    for message in messages {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO messages
                (run_id, message_id, thread_id, date, from_email, subject, labels_json, snippet, body)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run_id)
        .bind(&message.meta.id)
        .bind(&message.meta.thread_id)
        .bind(message.meta.date.timestamp())
        .bind(&message.meta.from_email)
        .bind(&message.meta.subject)
        .bind(serde_json::to_string(&message.meta.labels)?)
        .bind(&message.meta.snippet)
        .bind(&message.body)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn messages_for_run(pool: &SqlitePool, run_id: &str) -> Result<Vec<MailMessage>> {
    let rows = sqlx::query(
        r#"
        SELECT message_id, thread_id, date, from_email, subject, labels_json, snippet, body
        FROM messages WHERE run_id = ? ORDER BY message_id
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let labels: Vec<String> =
                serde_json::from_str(&row.get::<String, _>("labels_json"))
                    .context("parse message labels")?;
            Ok(MailMessage {
                meta: MessageMeta {
                    id: row.get("message_id"),
                    thread_id: row.get("thread_id"),
                    date: timestamp_to_datetime(row.get("date")),
                    from_email: row.get("from_email"),
                    subject: row.get::<Option<String>, _>("subject").unwrap_or_default(),
                    labels,
                    snippet: row.get::<Option<String>, _>("snippet").unwrap_or_default(),
                },
                body: row.get("body"),
            })
        })
        .collect()
}

// ─── Chunks ────────────────────────────────────────────────────────────

pub async fn insert_chunks(
    pool: &SqlitePool,
    run_id: &str,
    chunks: &[ChunkRecord],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    for chunk in chunks {
        sqlx::query(
            r#"
            INSERT INTO chunks (run_id, chunk_id, message_id, idx, text, token_count,
                                lexical_score, vector_score, rerank_score, selected)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run_id)
        .bind(&chunk.chunk_id)
        .bind(&chunk.message_id)
        .bind(chunk.index)
        .bind(&chunk.text)
        .bind(chunk.token_count)
        .bind(chunk.lexical_score)
        .bind(chunk.vector_score)
        .bind(chunk.rerank_score)
        .bind(chunk.selected)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

fn chunk_from_row(row: &sqlx::sqlite::SqliteRow) -> ChunkRecord {
    ChunkRecord {
        chunk_id: row.get("chunk_id"),
        message_id: row.get("message_id"),
        index: row.get("idx"),
        text: row.get("text"),
        token_count: row.get("token_count"),
        lexical_score: row.get("lexical_score"),
        vector_score: row.get("vector_score"),
        rerank_score: row.get("rerank_score"),
        selected: row.get("selected"),
    }
}

pub async fn chunks_for_run(pool: &SqlitePool, run_id: &str) -> Result<Vec<ChunkRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT chunk_id, message_id, idx, text, token_count, lexical_score, vector_score,
               rerank_score, selected
        FROM chunks WHERE run_id = ? ORDER BY chunk_id
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(chunk_from_row).collect())
}

pub async fn selected_chunks(pool: &SqlitePool, run_id: &str) -> Result<Vec<ChunkRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT chunk_id, message_id, idx, text, token_count, lexical_score, vector_score,
               rerank_score, selected
        FROM chunks WHERE run_id = ? AND selected = 1 ORDER BY chunk_id
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(chunk_from_row).collect())
}

/// Write ranking-stage scores and selection flags back to storage.
pub async fn update_chunk_scores(
    pool: &SqlitePool,
    run_id: &str,
    chunks: &[ChunkRecord],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    for chunk in chunks {
        sqlx::query(
            r#"
            UPDATE chunks
            SET lexical_score = ?, vector_score = ?, rerank_score = ?, selected = ?
            WHERE run_id = ? AND chunk_id = ?
            "#,
        )
        .bind(chunk.lexical_score)
        .bind(chunk.vector_score)
        .bind(chunk.rerank_score)
        .bind(chunk.selected)
        .bind(run_id)
        .bind(&chunk.chunk_id)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

// ─── Thread summaries ──────────────────────────────────────────────────

pub async fn insert_thread_summary(
    pool: &SqlitePool,
    run_id: &str,
    summary: &ThreadSummaryRecord,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO thread_summaries (run_id, thread_id, summary_md, bullets_json, confidence)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(run_id)
    .bind(&summary.thread_id)
    .bind(&summary.summary_md)
    .bind(serde_json::to_string(&summary.bullets)?)
    .bind(summary.confidence)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn thread_summaries(
    pool: &SqlitePool,
    run_id: &str,
) -> Result<Vec<ThreadSummaryRecord>> {
    let rows = sqlx::query(
        "SELECT thread_id, summary_md, bullets_json, confidence FROM thread_summaries WHERE run_id = ? ORDER BY thread_id",
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let bullets: Vec<SummaryBullet> =
                serde_json::from_str(&row.get::<String, _>("bullets_json"))
                    .context("parse summary bullets")?;
            Ok(ThreadSummaryRecord {
                thread_id: row.get("thread_id"),
                summary_md: row.get("summary_md"),
                bullets,
                confidence: row.get("confidence"),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::config::DbConfig;
    use crate::{db, migrate};

    async fn test_pool() -> SqlitePool {
        let pool = db::connect(&DbConfig {
            path: ":memory:".to_string(),
        })
        .await
        .unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        pool
    }

    fn message(id: &str, thread_id: &str) -> MailMessage {
        MailMessage {
            meta: MessageMeta {
                id: id.to_string(),
                thread_id: thread_id.to_string(),
                date: Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap(),
                from_email: "a@example.com".to_string(),
                subject: "subject".to_string(),
                labels: vec!["INBOX".to_string()],
                snippet: "snip".to_string(),
            },
            body: "body".to_string(),
        }
    }

    #[tokio::test]
    async fn test_run_roundtrip() {
        let pool = test_pool().await;
        let config = RunConfig::new("why was it returned");
        insert_run(&pool, "r1", Utc::now(), &config).await.unwrap();

        let run = load_run(&pool, "r1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.question, "why was it returned");
        assert!(run.metrics.is_none());

        update_status(&pool, "r1", RunStatus::Fetching).await.unwrap();
        let run = load_run(&pool, "r1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Fetching);

        assert!(load_run(&pool, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failure_attaches_error_to_metrics() {
        let pool = test_pool().await;
        insert_run(&pool, "r1", Utc::now(), &RunConfig::new("q"))
            .await
            .unwrap();
        record_failure(&pool, "r1", "provider exploded").await.unwrap();

        let run = load_run(&pool, "r1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.metrics.unwrap()["error"], "provider exploded");
    }

    #[tokio::test]
    async fn test_duplicate_message_ids_are_ignored() {
        let pool = test_pool().await;
        insert_run(&pool, "r1", Utc::now(), &RunConfig::new("q"))
            .await
            .unwrap();

        insert_messages(&pool, "r1", &[message("m1", "t1"), message("m2", "t1")])
            .await
            .unwrap();
        insert_messages(&pool, "r1", &[message("m1", "t1"), message("m3", "t2")])
            .await
            .unwrap();

        let messages = messages_for_run(&pool, "r1").await.unwrap();
        assert_eq!(messages.len(), 3);
    }

    #[tokio::test]
    async fn test_chunk_score_update() {
        let pool = test_pool().await;
        insert_run(&pool, "r1", Utc::now(), &RunConfig::new("q"))
            .await
            .unwrap();

        let mut chunk = ChunkRecord {
            chunk_id: "m1:0".to_string(),
            message_id: "m1".to_string(),
            index: 0,
            text: "text".to_string(),
            token_count: 1,
            lexical_score: 0.0,
            vector_score: 0.0,
            rerank_score: 0.0,
            selected: false,
        };
        insert_chunks(&pool, "r1", std::slice::from_ref(&chunk))
            .await
            .unwrap();

        chunk.rerank_score = 0.42;
        chunk.selected = true;
        update_chunk_scores(&pool, "r1", std::slice::from_ref(&chunk))
            .await
            .unwrap();

        let selected = selected_chunks(&pool, "r1").await.unwrap();
        assert_eq!(selected.len(), 1);
        assert!((selected[0].rerank_score - 0.42).abs() < 1e-9);
    }
}
