//! Hybrid ranking stage.
//!
//! Indexes every chunk into the lexical and vector indexes, queries both
//! with the original question, blends the two scores, reranks, and
//! selects chunks above the rerank threshold.
//!
//! Ranking is a pure function of the question and the chunk set: chunks
//! are processed in chunk-id order, so re-running over an unchanged set
//! with deterministic providers reproduces identical scores and
//! selections.
//!
//! Provider failures degrade instead of aborting: a failed channel
//! contributes zero scores, and a failed rerank falls back to the blended
//! score.

use std::collections::HashMap;
use tracing::warn;

use crate::config::RankingConfig;
use crate::models::{ChunkRecord, ScoredCandidate};
use crate::providers::ProviderSet;

pub async fn rank_chunks(
    providers: &ProviderSet,
    config: &RankingConfig,
    question: &str,
    mut chunks: Vec<ChunkRecord>,
) -> Vec<ChunkRecord> {
    if chunks.is_empty() {
        return chunks;
    }

    chunks.sort_by(|a, b| a.chunk_id.cmp(&b.chunk_id));

    let lexical_scores = lexical_channel(providers, config, question, &chunks).await;
    let vector_scores = vector_channel(providers, config, question, &chunks).await;

    for chunk in &mut chunks {
        chunk.lexical_score = lexical_scores
            .get(&chunk.chunk_id)
            .copied()
            .unwrap_or(0.0);
        chunk.vector_score = vector_scores.get(&chunk.chunk_id).copied().unwrap_or(0.0);
    }

    let candidates: Vec<ScoredCandidate> = chunks
        .iter()
        .map(|chunk| ScoredCandidate {
            id: chunk.chunk_id.clone(),
            text: chunk.text.clone(),
            score: config.lexical_weight * chunk.lexical_score
                + config.vector_weight * chunk.vector_score,
        })
        .collect();

    match providers.reranker.rerank(question, candidates).await {
        Ok(reranked) => {
            let rerank_scores: HashMap<String, f64> =
                reranked.into_iter().map(|c| (c.id, c.score)).collect();
            for chunk in &mut chunks {
                chunk.rerank_score = rerank_scores
                    .get(&chunk.chunk_id)
                    .copied()
                    .unwrap_or(0.0);
            }
        }
        Err(error) => {
            warn!(%error, "rerank failed; falling back to blended scores");
            for chunk in &mut chunks {
                chunk.rerank_score = config.lexical_weight * chunk.lexical_score
                    + config.vector_weight * chunk.vector_score;
            }
        }
    }

    for chunk in &mut chunks {
        chunk.selected = chunk.rerank_score > config.selection_threshold;
    }

    chunks
}

async fn lexical_channel(
    providers: &ProviderSet,
    config: &RankingConfig,
    question: &str,
    chunks: &[ChunkRecord],
) -> HashMap<String, f64> {
    let entries: Vec<(String, String)> = chunks
        .iter()
        .map(|c| (c.chunk_id.clone(), c.text.clone()))
        .collect();

    if let Err(error) = providers.lexical.index(&entries).await {
        warn!(%error, "lexical indexing failed; lexical scores zeroed");
        return HashMap::new();
    }

    match providers.lexical.search(question, config.lexical_top_k).await {
        Ok(results) => results
            .into_iter()
            .map(|(id, score)| (id, score as f64))
            .collect(),
        Err(error) => {
            warn!(%error, "lexical search failed; lexical scores zeroed");
            HashMap::new()
        }
    }
}

async fn vector_channel(
    providers: &ProviderSet,
    config: &RankingConfig,
    question: &str,
    chunks: &[ChunkRecord],
) -> HashMap<String, f64> {
    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();

    let vectors = match providers.embedding.embed(&texts).await {
        Ok(vectors) => vectors,
        Err(error) => {
            warn!(%error, "chunk embedding failed; vector scores zeroed");
            return HashMap::new();
        }
    };

    let entries: Vec<(String, Vec<f32>)> = chunks
        .iter()
        .zip(vectors)
        .map(|(c, v)| (c.chunk_id.clone(), v))
        .collect();

    if let Err(error) = providers.vector.index(&entries).await {
        warn!(%error, "vector indexing failed; vector scores zeroed");
        return HashMap::new();
    }

    let question_vector = match providers.embedding.embed(&[question.to_string()]).await {
        Ok(mut vectors) if !vectors.is_empty() => vectors.remove(0),
        Ok(_) => {
            warn!("empty question embedding; vector scores zeroed");
            return HashMap::new();
        }
        Err(error) => {
            warn!(%error, "question embedding failed; vector scores zeroed");
            return HashMap::new();
        }
    };

    match providers
        .vector
        .search(&question_vector, config.vector_top_k)
        .await
    {
        Ok(results) => results
            .into_iter()
            .map(|(id, score)| (id, score as f64))
            .collect(),
        Err(error) => {
            warn!(%error, "vector search failed; vector scores zeroed");
            HashMap::new()
        }
    }
}
