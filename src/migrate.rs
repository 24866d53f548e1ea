use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Create runs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            run_id TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL,
            question TEXT NOT NULL,
            params_json TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'queued',
            stop_reason TEXT,
            metrics_json TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create queries table (append-only audit trail)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            iteration INTEGER NOT NULL,
            query_str TEXT NOT NULL,
            rationale TEXT,
            hits INTEGER NOT NULL DEFAULT 0,
            new_msgs INTEGER NOT NULL DEFAULT 0,
            new_threads INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (run_id) REFERENCES runs(run_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create iterations table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS iterations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            iteration INTEGER NOT NULL,
            queries_tried INTEGER NOT NULL,
            new_messages INTEGER NOT NULL,
            new_threads INTEGER NOT NULL,
            precision_proxy REAL NOT NULL,
            novelty_gain REAL NOT NULL,
            duration_ms INTEGER NOT NULL,
            stop_reason TEXT,
            UNIQUE(run_id, iteration),
            FOREIGN KEY (run_id) REFERENCES runs(run_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create term expansions table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS term_expansions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            iteration INTEGER NOT NULL,
            added_json TEXT NOT NULL,
            removed_json TEXT NOT NULL,
            evidence_json TEXT NOT NULL,
            FOREIGN KEY (run_id) REFERENCES runs(run_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create messages table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            message_id TEXT NOT NULL,
            thread_id TEXT NOT NULL,
            date INTEGER NOT NULL,
            from_email TEXT NOT NULL,
            subject TEXT,
            labels_json TEXT NOT NULL DEFAULT '[]',
            snippet TEXT,
            body TEXT NOT NULL,
            selected INTEGER NOT NULL DEFAULT 0,
            UNIQUE(run_id, message_id),
            FOREIGN KEY (run_id) REFERENCES runs(run_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create chunks table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            chunk_id TEXT NOT NULL,
            message_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            text TEXT NOT NULL,
            token_count INTEGER NOT NULL,
            lexical_score REAL NOT NULL DEFAULT 0,
            vector_score REAL NOT NULL DEFAULT 0,
            rerank_score REAL NOT NULL DEFAULT 0,
            selected INTEGER NOT NULL DEFAULT 0,
            UNIQUE(run_id, chunk_id),
            FOREIGN KEY (run_id) REFERENCES runs(run_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create thread summaries table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS thread_summaries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            thread_id TEXT NOT NULL,
            summary_md TEXT NOT NULL,
            bullets_json TEXT NOT NULL,
            confidence REAL NOT NULL,
            FOREIGN KEY (run_id) REFERENCES runs(run_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_queries_run_iteration ON queries(run_id, iteration)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_run_thread ON messages(run_id, thread_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_run_selected ON chunks(run_id, selected)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_summaries_run ON thread_summaries(run_id)")
        .execute(pool)
        .await?;

    Ok(())
}
