//! Fixture providers for credential-less operation and tests.
//!
//! Every provider contract has an in-memory implementation here:
//! a seeded mailbox with keyword search, a deterministic hash embedder,
//! token-overlap lexical scoring, cosine vector scoring, an overlap
//! reranker, and an extractive quote summarizer. All of them are
//! deterministic, so a run over the fixture corpus is reproducible
//! end to end.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::error::ProviderError;
use crate::models::{
    MailMessage, MessageMeta, ScoredCandidate, SearchConstraints, SummaryChunk, ThreadDigest,
};
use crate::providers::{
    EmbeddingProvider, LexicalIndex, Reranker, SearchProvider, Summarizer, VectorIndex,
};
use crate::terms::matches_domain_terms;

/// Keywords the fixture search recognizes. A message matches a query when
/// some keyword appears in both.
const SEARCH_KEYWORDS: &[&str] = &[
    "coolsculpting",
    "elite",
    "return",
    "rma",
    "ship",
    "shipping",
    "label",
    "freight",
    "pickup",
    "crate",
    "packaging",
    "allergan",
    "abbvie",
    "credit",
    "refund",
    "serial",
    "p3",
    "thermal",
    "sensor",
    "error",
    "protocol",
    "waybill",
];

// ─── Search ────────────────────────────────────────────────────────────

/// In-memory mailbox with keyword search over subject and body.
pub struct FixtureMailbox {
    messages: Vec<MailMessage>,
}

impl FixtureMailbox {
    pub fn new(messages: Vec<MailMessage>) -> Self {
        Self { messages }
    }

    /// A mailbox seeded with the equipment-return sample corpus.
    pub fn with_sample_corpus() -> Self {
        Self::new(sample_corpus())
    }
}

#[async_trait]
impl SearchProvider for FixtureMailbox {
    async fn search(&self, query: &str) -> Result<Vec<MessageMeta>, ProviderError> {
        let query_lower = query.to_lowercase();
        let mut hits = Vec::new();
        for message in &self.messages {
            let text = format!("{} {}", message.meta.subject, message.body).to_lowercase();
            let matched = SEARCH_KEYWORDS
                .iter()
                .any(|k| query_lower.contains(k) && text.contains(k));
            if matched {
                hits.push(message.meta.clone());
            }
        }
        Ok(hits)
    }

    async fn fetch_bodies(&self, ids: &[String]) -> Result<Vec<MailMessage>, ProviderError> {
        Ok(self
            .messages
            .iter()
            .filter(|m| ids.contains(&m.meta.id))
            .cloned()
            .collect())
    }

    fn constraint_clause(&self, constraints: &SearchConstraints) -> String {
        let mut parts = Vec::new();
        if let Some(after) = constraints.after {
            parts.push(format!("after:{}", after.format("%Y/%m/%d")));
        }
        if let Some(before) = constraints.before {
            parts.push(format!("before:{}", before.format("%Y/%m/%d")));
        }
        if !constraints.domains.is_empty() {
            let domains: Vec<String> = constraints
                .domains
                .iter()
                .map(|d| format!("from:{}", d))
                .collect();
            parts.push(format!("({})", domains.join(" OR ")));
        }
        parts.join(" ")
    }
}

// ─── Embedding ─────────────────────────────────────────────────────────

/// Deterministic embedder: each word is hashed into one of `dims` buckets
/// with a hash-derived sign, and the result is L2-normalized. Texts that
/// share vocabulary land near each other, which is all hybrid ranking
/// needs from a fixture.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        "fixture-hash-embedder"
    }
}

impl HashEmbedder {
    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for word in text.to_lowercase().split_whitespace() {
            let digest = Sha256::digest(word.as_bytes());
            let bucket = u64::from_le_bytes(digest[..8].try_into().unwrap()) as usize % self.dims;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

// ─── Indexes ───────────────────────────────────────────────────────────

/// Lexical index scoring by token overlap with the query.
#[derive(Default)]
pub struct MemoryLexicalIndex {
    entries: Mutex<Vec<(String, String)>>,
}

impl MemoryLexicalIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LexicalIndex for MemoryLexicalIndex {
    async fn index(&self, entries: &[(String, String)]) -> Result<(), ProviderError> {
        *self.entries.lock().unwrap() = entries.to_vec();
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<(String, f32)>, ProviderError> {
        let query_tokens: BTreeSet<String> = tokenize(query);
        let mut scored: Vec<(String, f32)> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(id, text)| {
                let score = overlap_score(&query_tokens, text);
                (score > 0.0).then(|| (id.clone(), score))
            })
            .collect();
        sort_scored(&mut scored);
        scored.truncate(top_k);
        Ok(scored)
    }
}

/// Vector index scoring by cosine similarity.
#[derive(Default)]
pub struct MemoryVectorIndex {
    entries: Mutex<Vec<(String, Vec<f32>)>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn index(&self, entries: &[(String, Vec<f32>)]) -> Result<(), ProviderError> {
        *self.entries.lock().unwrap() = entries.to_vec();
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<(String, f32)>, ProviderError> {
        let mut scored: Vec<(String, f32)> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .map(|(id, vector)| (id.clone(), cosine_similarity(query, vector)))
            .collect();
        sort_scored(&mut scored);
        scored.truncate(top_k);
        Ok(scored)
    }
}

/// Compute cosine similarity between two vectors.
///
/// Returns 0.0 for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

// ─── Reranker ──────────────────────────────────────────────────────────

/// Reranker scoring candidates by token overlap with the query, keeping
/// the best `keep`.
pub struct OverlapReranker {
    keep: usize,
}

impl OverlapReranker {
    pub fn new(keep: usize) -> Self {
        Self { keep }
    }
}

impl Default for OverlapReranker {
    fn default() -> Self {
        Self::new(50)
    }
}

#[async_trait]
impl Reranker for OverlapReranker {
    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<ScoredCandidate>,
    ) -> Result<Vec<ScoredCandidate>, ProviderError> {
        let query_tokens = tokenize(query);
        let mut reranked: Vec<ScoredCandidate> = candidates
            .into_iter()
            .map(|mut c| {
                c.score = overlap_score(&query_tokens, &c.text) as f64;
                c
            })
            .collect();
        reranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        reranked.truncate(self.keep);
        Ok(reranked)
    }
}

// ─── Summarizer ────────────────────────────────────────────────────────

/// Extractive summarizer: pulls domain-relevant sentences out of the
/// thread's chunks and cites them verbatim.
#[derive(Default)]
pub struct QuoteSummarizer;

/// Bullets kept per thread summary.
const MAX_BULLETS: usize = 5;

#[async_trait]
impl Summarizer for QuoteSummarizer {
    async fn summarize(
        &self,
        chunks: &[SummaryChunk],
        topic: &str,
    ) -> Result<ThreadDigest, ProviderError> {
        if chunks.is_empty() {
            return Err(ProviderError::Summarize {
                message: "no chunks to summarize".to_string(),
            });
        }

        let mut bullets = Vec::new();
        for chunk in chunks {
            for sentence in sentences(&chunk.text) {
                if bullets.len() >= MAX_BULLETS {
                    break;
                }
                if sentence.len() >= 10 && matches_domain_terms(&sentence) {
                    bullets.push(crate::models::SummaryBullet {
                        text: sentence.clone(),
                        quote: sentence,
                        source_message_id: chunk.message_id.clone(),
                        source_date: chunk.date,
                    });
                }
            }
        }

        // A selected thread always gets at least one citation.
        if bullets.is_empty() {
            let first = &chunks[0];
            let lead = sentences(&first.text)
                .into_iter()
                .next()
                .unwrap_or_else(|| first.text.chars().take(120).collect());
            bullets.push(crate::models::SummaryBullet {
                text: lead.clone(),
                quote: lead,
                source_message_id: first.message_id.clone(),
                source_date: first.date,
            });
        }

        let mut summary_md = format!("## Evidence: {}\n\n", topic);
        for bullet in &bullets {
            summary_md.push_str(&format!(
                "- {} ({}, {})\n",
                bullet.text,
                bullet.source_message_id,
                bullet.source_date.format("%Y-%m-%d")
            ));
        }

        Ok(ThreadDigest {
            summary_md,
            bullets,
            confidence: 0.8,
        })
    }
}

// ─── Wiring ────────────────────────────────────────────────────────────

/// A full [`ProviderSet`] over the sample corpus. Runs built on it are
/// reproducible and need no credentials.
pub fn provider_set() -> crate::providers::ProviderSet {
    provider_set_for(sample_corpus())
}

/// A full [`ProviderSet`] over a caller-supplied corpus.
pub fn provider_set_for(messages: Vec<MailMessage>) -> crate::providers::ProviderSet {
    use std::sync::Arc;
    crate::providers::ProviderSet {
        search: Arc::new(FixtureMailbox::new(messages)),
        embedding: Arc::new(HashEmbedder::default()),
        lexical: Arc::new(MemoryLexicalIndex::new()),
        vector: Arc::new(MemoryVectorIndex::new()),
        reranker: Arc::new(OverlapReranker::default()),
        summarizer: Arc::new(QuoteSummarizer),
    }
}

// ─── Helpers ───────────────────────────────────────────────────────────

fn tokenize(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

fn overlap_score(query_tokens: &BTreeSet<String>, text: &str) -> f32 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let text_tokens = tokenize(text);
    let overlap = query_tokens.intersection(&text_tokens).count();
    overlap as f32 / query_tokens.len() as f32
}

fn sort_scored(scored: &mut [(String, f32)]) {
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
}

fn sentences(text: &str) -> Vec<String> {
    text.split(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| format!("{}.", s))
        .collect()
}

// ─── Sample corpus ─────────────────────────────────────────────────────

fn fixture_message(
    id: &str,
    thread_id: &str,
    day: i64,
    from_email: &str,
    subject: &str,
    labels: &[&str],
    body: &str,
) -> MailMessage {
    let date: DateTime<Utc> =
        Utc.with_ymd_and_hms(2025, 2, 1, 9, 0, 0).unwrap() + Duration::days(day);
    let snippet: String = body.chars().take(80).collect();
    MailMessage {
        meta: MessageMeta {
            id: id.to_string(),
            thread_id: thread_id.to_string(),
            date,
            from_email: from_email.to_string(),
            subject: subject.to_string(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            snippet,
        },
        body: body.to_string(),
    }
}

/// A small realistic corpus covering one equipment return end to end:
/// the return request, RMA issuance, freight coordination, a packaging
/// dispute, credit processing, and replacement questions.
pub fn sample_corpus() -> Vec<MailMessage> {
    vec![
        fixture_message(
            "msg-001",
            "thr-001",
            1,
            "clinic.manager@example.com",
            "CoolSculpting Elite return request - serial CS-2024-001",
            &["INBOX", "Returns"],
            "Dear returns team,\n\n\
             We need to return our CoolSculpting Elite unit, serial CS-2024-001, purchased in \
             December 2024. The machine has repeated temperature regulation failures and will \
             not run treatments without the P3 protocol. Our technician sees error code E-47 \
             on most attempts, and the thermal sensor readings drift during every cycle.\n\n\
             Please advise on the RMA process and the return shipping requirements.\n\n\
             Best regards,\nDr. Sarah Wilson\nAesthetic Wellness Clinic",
        ),
        fixture_message(
            "msg-002",
            "thr-001",
            2,
            "returns@allergan.com",
            "RE: CoolSculpting Elite return request - RMA-2025-0847",
            &["INBOX", "Returns"],
            "Dr. Wilson,\n\n\
             RMA-2025-0847 has been opened for unit CS-2024-001. The authorization expires in \
             30 days. The machine must ship in its original packaging or an equivalent \
             protective crate, with the return label we provide. Our logistics team will \
             schedule an LTL freight pickup and email the bill of lading.\n\n\
             If inspection confirms a manufacturing defect you will receive a full credit.\n\n\
             Maria Santos\nSenior RMA Specialist",
        ),
        fixture_message(
            "msg-003",
            "thr-002",
            3,
            "logistics@abbvie.com",
            "LTL pickup coordination for RMA-2025-0847",
            &["INBOX", "Logistics"],
            "Regarding the LTL pickup for the CoolSculpting Elite return under RMA-2025-0847:\n\n\
             Pickup window is February 8-10, carrier XYZ Logistics, waybill WB-2025-3847. \
             The machine must be palletized and secured, original crate preferred. The freight \
             carrier will refuse the shipment if the unit is not properly crated or exceeds \
             72 inches in height. The return label and bill of lading are attached.\n\n\
             Please confirm pickup availability.\n\n\
             Mike Chen\nLogistics Coordinator",
        ),
        fixture_message(
            "msg-004",
            "thr-003",
            7,
            "clinic.manager@example.com",
            "URGENT: return packaging problem - RMA-2025-0847",
            &["INBOX", "Returns", "URGENT"],
            "Returns team,\n\n\
             Our original crate was damaged during installation and cannot be reused. The \
             replacement wooden crate we sourced measures 74 inches tall, which your freight \
             desk says exceeds the size limit. The pickup is scheduled for tomorrow and this \
             delay is blocking our replacement order.\n\n\
             Please either accept the oversized crate or send packaging specifications that \
             will actually work.\n\n\
             Thanks,\nDr. Sarah Wilson",
        ),
        fixture_message(
            "msg-005",
            "thr-003",
            7,
            "returns@allergan.com",
            "RE: URGENT: return packaging problem - RMA-2025-0847",
            &["INBOX", "Returns"],
            "Dr. Wilson,\n\n\
             The 72 inch height limit comes from our freight carriers, but we can approve the \
             74 inch crate as a one-time exception with an oversized-freight handling fee of \
             $150, credited back if the return is approved. Sign the liability waiver today \
             and the pickup proceeds tomorrow with the updated return label.\n\n\
             Maria Santos\nSenior RMA Specialist\n\n\
             On Feb 8, clinic.manager@example.com wrote:\n\
             > Please either accept the oversized crate or send packaging\n\
             > specifications that will actually work.",
        ),
        fixture_message(
            "msg-006",
            "thr-004",
            21,
            "returns@allergan.com",
            "Return processed - credit memo CM-2025-1847",
            &["INBOX", "Credits"],
            "Dr. Wilson,\n\n\
             The returned CoolSculpting Elite unit CS-2024-001 has been received and \
             inspected. Inspection confirmed the temperature regulation failure with error \
             code E-47. Root cause: faulty thermal sensor array, classified as a \
             manufacturing defect. The restocking fee is waived and credit memo CM-2025-1847 \
             for $45,075.00 has been issued, less return freight of $425.00.\n\n\
             You are eligible for a priority replacement with extended warranty.\n\n\
             Maria Santos\nSenior RMA Specialist",
        ),
        fixture_message(
            "msg-007",
            "thr-005",
            25,
            "clinic.manager@example.com",
            "Replacement unit questions",
            &["INBOX"],
            "Hi Maria,\n\n\
             Thank you for processing the return. Is the thermal sensor issue fixed in newer \
             production units, and what is the lead time for a replacement CoolSculpting \
             Elite? Will the replacement ship with updated P3 protocols? Our patients keep \
             asking when treatments resume, so timing matters.\n\n\
             Best regards,\nDr. Sarah Wilson",
        ),
        fixture_message(
            "msg-008",
            "thr-005",
            26,
            "sales@allergan.com",
            "RE: Replacement unit questions",
            &["INBOX", "Sales"],
            "Dr. Wilson,\n\n\
             All units manufactured after January 2025 carry the Gen 3 thermal sensor array, \
             which resolves the E-47 error entirely. Current lead time is 6-8 weeks, \
             prioritized to 4-5 weeks for return customers. New units ship with P3 v2.1, \
             which removes the bypass requirement. Volume pricing applies from two units, \
             including an 8% discount and extended warranty on both.\n\n\
             Jennifer Walsh\nSenior Sales Representative",
        ),
    ]
}
