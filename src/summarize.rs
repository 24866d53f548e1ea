//! Thread summarization stage.
//!
//! Groups selected chunks by their owning message's thread and asks the
//! summarizer for one cited digest per thread. Threads with no selected
//! chunks get no record. A summarizer failure for one thread is logged
//! and skipped; it never aborts the stage.

use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::models::{ChunkRecord, MailMessage, SummaryChunk, ThreadSummaryRecord};
use crate::providers::Summarizer;

pub async fn summarize_threads(
    summarizer: &dyn Summarizer,
    messages: &[MailMessage],
    selected: &[ChunkRecord],
    question: &str,
) -> Vec<ThreadSummaryRecord> {
    let lookup: HashMap<&str, &MailMessage> = messages
        .iter()
        .map(|m| (m.meta.id.as_str(), m))
        .collect();

    let mut by_thread: BTreeMap<String, Vec<SummaryChunk>> = BTreeMap::new();
    for chunk in selected {
        let Some(message) = lookup.get(chunk.message_id.as_str()) else {
            warn!(chunk_id = %chunk.chunk_id, "selected chunk has no stored message; skipping");
            continue;
        };
        by_thread
            .entry(message.meta.thread_id.clone())
            .or_default()
            .push(SummaryChunk {
                message_id: chunk.message_id.clone(),
                date: message.meta.date,
                text: chunk.text.clone(),
            });
    }

    let mut summaries = Vec::new();
    for (thread_id, chunks) in by_thread {
        match summarizer.summarize(&chunks, question).await {
            Ok(digest) => summaries.push(ThreadSummaryRecord {
                thread_id,
                summary_md: digest.summary_md,
                bullets: digest.bullets,
                confidence: digest.confidence,
            }),
            Err(error) => {
                warn!(%thread_id, %error, "thread summarization failed; skipping thread");
            }
        }
    }
    summaries
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::fixture::{sample_corpus, QuoteSummarizer};

    fn selected_chunk(chunk_id: &str, message_id: &str, text: &str) -> ChunkRecord {
        ChunkRecord {
            chunk_id: chunk_id.to_string(),
            message_id: message_id.to_string(),
            index: 0,
            text: text.to_string(),
            token_count: text.split_whitespace().count() as i64,
            lexical_score: 0.5,
            vector_score: 0.5,
            rerank_score: 0.5,
            selected: true,
        }
    }

    #[tokio::test]
    async fn test_groups_by_thread_and_cites_sources() {
        let messages = sample_corpus();
        // msg-001 and msg-002 share thr-001; msg-006 is thr-004.
        let selected = vec![
            selected_chunk("msg-001:0", "msg-001", "The thermal sensor readings drift."),
            selected_chunk("msg-002:0", "msg-002", "RMA-2025-0847 opened for the return."),
            selected_chunk("msg-006:0", "msg-006", "Credit memo CM-2025-1847 was issued."),
        ];

        let summaries =
            summarize_threads(&QuoteSummarizer, &messages, &selected, "why returned").await;

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].thread_id, "thr-001");
        assert_eq!(summaries[1].thread_id, "thr-004");
        for summary in &summaries {
            assert!(!summary.bullets.is_empty());
            for bullet in &summary.bullets {
                assert!(messages.iter().any(|m| m.meta.id == bullet.source_message_id));
            }
        }
    }

    #[tokio::test]
    async fn test_no_selected_chunks_no_records() {
        let messages = sample_corpus();
        let summaries = summarize_threads(&QuoteSummarizer, &messages, &[], "q").await;
        assert!(summaries.is_empty());
    }

    #[tokio::test]
    async fn test_orphan_chunks_are_skipped() {
        let messages = sample_corpus();
        let selected = vec![selected_chunk("ghost:0", "ghost", "no such message")];
        let summaries = summarize_threads(&QuoteSummarizer, &messages, &selected, "q").await;
        assert!(summaries.is_empty());
    }
}
