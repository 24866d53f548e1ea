//! End-to-end runs over the in-memory store and fixture providers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;

use mailtrawl::config::{Config, RunConfig};
use mailtrawl::error::ProviderError;
use mailtrawl::fixture::{
    self, FixtureMailbox, HashEmbedder, MemoryLexicalIndex, MemoryVectorIndex, OverlapReranker,
    QuoteSummarizer,
};
use mailtrawl::models::{
    MailMessage, MessageMeta, RunStatus, SearchConstraints,
};
use mailtrawl::providers::{LexicalIndex, ProviderSet, SearchProvider, VectorIndex};
use mailtrawl::{store, RunEventKind, RunOrchestrator};

const QUESTION: &str = "Why was the CoolSculpting Elite machine returned?";

async fn orchestrator_with(providers: ProviderSet) -> RunOrchestrator {
    RunOrchestrator::new(Config::default(), providers)
        .await
        .expect("orchestrator setup")
}

// ─── Scenario 1: fixture corpus runs to Done with citing summaries ─────

#[tokio::test]
async fn run_reaches_done_and_cites_fixture_messages() {
    let orchestrator = orchestrator_with(fixture::provider_set()).await;
    let run_id = orchestrator
        .create_run(RunConfig::new(QUESTION))
        .await
        .unwrap();

    orchestrator.execute(&run_id).await.unwrap();

    assert_eq!(orchestrator.status(&run_id).await.unwrap(), RunStatus::Done);

    let pool = orchestrator.pool();
    let iterations = store::iterations_for_run(pool, &run_id).await.unwrap();
    assert!(!iterations.is_empty());
    assert!(iterations.len() <= 4);

    // First iteration hits the whole corpus with full domain precision.
    assert!(iterations[0].new_messages > 0);
    assert!((iterations[0].precision_proxy - 1.0).abs() < 1e-9);

    let summaries = store::thread_summaries(pool, &run_id).await.unwrap();
    assert!(!summaries.is_empty());

    let messages = store::messages_for_run(pool, &run_id).await.unwrap();
    let message_ids: HashSet<&str> = messages.iter().map(|m| m.meta.id.as_str()).collect();
    for summary in &summaries {
        assert!(!summary.bullets.is_empty());
        for bullet in &summary.bullets {
            assert!(
                message_ids.contains(bullet.source_message_id.as_str()),
                "bullet cites unknown message {}",
                bullet.source_message_id
            );
        }
    }

    // No message id is ever recorded twice within a run.
    let distinct: HashSet<&str> = messages.iter().map(|m| m.meta.id.as_str()).collect();
    assert_eq!(distinct.len(), messages.len());
    let recorded: u64 = iterations.iter().map(|m| m.new_messages).sum();
    assert_eq!(recorded as usize, messages.len());

    // The run stopped on the trailing-window rule, not by silently
    // exhausting max_iterations.
    let run = store::load_run(pool, &run_id).await.unwrap().unwrap();
    if iterations.len() < 4 {
        assert!(run.stop_reason.is_some());
    }
    let metrics = run.metrics.expect("aggregate metrics");
    assert_eq!(
        metrics["iterations"].as_u64().unwrap() as usize,
        iterations.len()
    );
    assert!(metrics["thread_summaries"].as_u64().unwrap() >= 1);
}

// ─── Scenario 2: provider errors are skippable, not fatal ──────────────

struct FailingSearch;

#[async_trait]
impl SearchProvider for FailingSearch {
    async fn search(&self, query: &str) -> Result<Vec<MessageMeta>, ProviderError> {
        Err(ProviderError::Search {
            query: query.to_string(),
            message: "connection refused".to_string(),
        })
    }

    async fn fetch_bodies(&self, _ids: &[String]) -> Result<Vec<MailMessage>, ProviderError> {
        Ok(Vec::new())
    }

    fn constraint_clause(&self, _constraints: &SearchConstraints) -> String {
        String::new()
    }
}

#[tokio::test]
async fn failing_queries_still_reach_the_next_iteration() {
    let mut providers = fixture::provider_set();
    providers.search = Arc::new(FailingSearch);
    let orchestrator = orchestrator_with(providers).await;

    let run_id = orchestrator
        .create_run(RunConfig::new(QUESTION))
        .await
        .unwrap();
    orchestrator.execute(&run_id).await.unwrap();

    // Every query failed, but the run completed instead of failing.
    assert_eq!(orchestrator.status(&run_id).await.unwrap(), RunStatus::Done);

    let pool = orchestrator.pool();
    let iterations = store::iterations_for_run(pool, &run_id).await.unwrap();
    assert!(
        iterations.len() >= 2,
        "iteration 0 failures must not stop the loop before iteration 1"
    );

    let queries = store::queries_for_run(pool, &run_id).await.unwrap();
    let first_iteration: Vec<_> = queries.iter().filter(|q| q.iteration == 0).collect();
    assert!(!first_iteration.is_empty());
    assert!(first_iteration.iter().all(|q| q.hits == 0 && q.new_msgs == 0));

    // With nothing fetched, the stop reason is the novelty rule.
    let run = store::load_run(pool, &run_id).await.unwrap().unwrap();
    assert!(run.stop_reason.unwrap().contains("novelty"));
}

// ─── Scenario 3: pause between iterations, resume continues ────────────

type PauseSlot = Arc<OnceLock<(Arc<RunOrchestrator>, String)>>;

/// Requests a pause on the first search call, so the pause lands while
/// iteration 0 is in flight and takes effect at the iteration boundary.
struct PauseOnFirstSearch {
    inner: FixtureMailbox,
    slot: PauseSlot,
    fired: AtomicBool,
}

#[async_trait]
impl SearchProvider for PauseOnFirstSearch {
    async fn search(&self, query: &str) -> Result<Vec<MessageMeta>, ProviderError> {
        if !self.fired.swap(true, Ordering::SeqCst) {
            if let Some((orchestrator, run_id)) = self.slot.get() {
                orchestrator.pause(run_id).await.expect("pause");
            }
        }
        self.inner.search(query).await
    }

    async fn fetch_bodies(&self, ids: &[String]) -> Result<Vec<MailMessage>, ProviderError> {
        self.inner.fetch_bodies(ids).await
    }

    fn constraint_clause(&self, constraints: &SearchConstraints) -> String {
        self.inner.constraint_clause(constraints)
    }
}

#[tokio::test]
async fn pause_suspends_at_iteration_boundary_and_resume_continues() {
    let slot: PauseSlot = Arc::new(OnceLock::new());
    let mut providers = fixture::provider_set();
    providers.search = Arc::new(PauseOnFirstSearch {
        inner: FixtureMailbox::with_sample_corpus(),
        slot: slot.clone(),
        fired: AtomicBool::new(false),
    });

    let orchestrator = Arc::new(orchestrator_with(providers).await);
    let run_id = orchestrator
        .create_run(RunConfig::new(QUESTION))
        .await
        .unwrap();
    slot.set((orchestrator.clone(), run_id.clone())).ok().unwrap();

    orchestrator.execute(&run_id).await.unwrap();

    // The pause landed mid-iteration: iteration 0 completed, then the
    // loop suspended before iteration 1.
    assert_eq!(
        orchestrator.status(&run_id).await.unwrap(),
        RunStatus::Paused
    );
    let iterations = store::iterations_for_run(orchestrator.pool(), &run_id)
        .await
        .unwrap();
    assert_eq!(iterations.len(), 1);
    assert_eq!(iterations[0].iteration, 0);

    orchestrator.resume(&run_id).await.unwrap();
    orchestrator.execute(&run_id).await.unwrap();

    assert_eq!(orchestrator.status(&run_id).await.unwrap(), RunStatus::Done);
    let iterations = store::iterations_for_run(orchestrator.pool(), &run_id)
        .await
        .unwrap();
    assert!(iterations.len() >= 2, "resume must continue, not restart");
    // Iteration 0 ran exactly once; the second execute picked up at 1.
    let indexes: Vec<u32> = iterations.iter().map(|m| m.iteration).collect();
    let distinct: HashSet<u32> = indexes.iter().copied().collect();
    assert_eq!(distinct.len(), indexes.len());
    assert!(indexes.contains(&1));
}

// ─── Scenario 4: index caps are respected before blending ──────────────

struct CountingLexical {
    inner: MemoryLexicalIndex,
    requested: Arc<Mutex<Vec<usize>>>,
    returned: Arc<Mutex<Vec<usize>>>,
}

#[async_trait]
impl LexicalIndex for CountingLexical {
    async fn index(&self, entries: &[(String, String)]) -> Result<(), ProviderError> {
        self.inner.index(entries).await
    }

    async fn search(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<(String, f32)>, ProviderError> {
        self.requested.lock().unwrap().push(top_k);
        let results = self.inner.search(query, top_k).await?;
        self.returned.lock().unwrap().push(results.len());
        Ok(results)
    }
}

struct CountingVector {
    inner: MemoryVectorIndex,
    requested: Arc<Mutex<Vec<usize>>>,
    returned: Arc<Mutex<Vec<usize>>>,
}

#[async_trait]
impl VectorIndex for CountingVector {
    async fn index(&self, entries: &[(String, Vec<f32>)]) -> Result<(), ProviderError> {
        self.inner.index(entries).await
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<(String, f32)>, ProviderError> {
        self.requested.lock().unwrap().push(top_k);
        let results = self.inner.search(query, top_k).await?;
        self.returned.lock().unwrap().push(results.len());
        Ok(results)
    }
}

fn wide_corpus(count: usize) -> Vec<MailMessage> {
    use chrono::{Duration, TimeZone, Utc};
    (0..count)
        .map(|i| {
            let id = format!("bulk-{:03}", i);
            let thread_id = format!("bulk-thr-{:03}", i / 2);
            let body = format!(
                "CoolSculpting Elite return update {}: the thermal sensor readings were \
                 reviewed and the freight paperwork for RMA processing is attached. {}",
                i,
                (0..40).map(|w| format!("filler{}w{}", i, w)).collect::<Vec<_>>().join(" ")
            );
            MailMessage {
                meta: MessageMeta {
                    id: id.clone(),
                    thread_id,
                    date: Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap()
                        + Duration::hours(i as i64),
                    from_email: "updates@allergan.com".to_string(),
                    subject: format!("Return status update {}", i),
                    labels: vec!["INBOX".to_string()],
                    snippet: String::new(),
                },
                body,
            }
        })
        .collect()
}

#[tokio::test]
async fn lexical_and_vector_search_are_capped() {
    let lexical_requested = Arc::new(Mutex::new(Vec::new()));
    let lexical_returned = Arc::new(Mutex::new(Vec::new()));
    let vector_requested = Arc::new(Mutex::new(Vec::new()));
    let vector_returned = Arc::new(Mutex::new(Vec::new()));

    let providers = ProviderSet {
        search: Arc::new(FixtureMailbox::new(wide_corpus(150))),
        embedding: Arc::new(HashEmbedder::default()),
        lexical: Arc::new(CountingLexical {
            inner: MemoryLexicalIndex::new(),
            requested: lexical_requested.clone(),
            returned: lexical_returned.clone(),
        }),
        vector: Arc::new(CountingVector {
            inner: MemoryVectorIndex::new(),
            requested: vector_requested.clone(),
            returned: vector_returned.clone(),
        }),
        reranker: Arc::new(OverlapReranker::default()),
        summarizer: Arc::new(QuoteSummarizer),
    };

    let orchestrator = orchestrator_with(providers).await;
    let run_id = orchestrator
        .create_run(RunConfig::new(QUESTION))
        .await
        .unwrap();
    orchestrator.execute(&run_id).await.unwrap();

    let chunks = store::chunks_for_run(orchestrator.pool(), &run_id)
        .await
        .unwrap();
    assert_eq!(chunks.len(), 150);

    let lexical_requested = lexical_requested.lock().unwrap();
    assert!(!lexical_requested.is_empty());
    assert!(lexical_requested.iter().all(|&k| k == 100));
    assert!(lexical_returned.lock().unwrap().iter().all(|&n| n <= 100));

    let vector_requested = vector_requested.lock().unwrap();
    assert!(!vector_requested.is_empty());
    assert!(vector_requested.iter().all(|&k| k == 50));
    assert!(vector_returned.lock().unwrap().iter().all(|&n| n <= 50));
}

// ─── Event stream ──────────────────────────────────────────────────────

#[tokio::test]
async fn event_stream_carries_phase_and_iteration_events() {
    let orchestrator = orchestrator_with(fixture::provider_set()).await;
    let run_id = orchestrator
        .create_run(RunConfig::new(QUESTION))
        .await
        .unwrap();

    let mut events = orchestrator.subscribe(&run_id);
    orchestrator.execute(&run_id).await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind);
    }

    assert_eq!(kinds.first(), Some(&RunEventKind::PhaseStarted));
    assert!(kinds.contains(&RunEventKind::IterationComplete));
    assert!(kinds.contains(&RunEventKind::PhaseComplete));
    assert_eq!(kinds.last(), Some(&RunEventKind::RunComplete));
}

// ─── Control surface edges ─────────────────────────────────────────────

#[tokio::test]
async fn cancelled_run_refuses_execution() {
    let orchestrator = orchestrator_with(fixture::provider_set()).await;
    let run_id = orchestrator
        .create_run(RunConfig::new(QUESTION))
        .await
        .unwrap();

    orchestrator.cancel(&run_id).await.unwrap();
    assert_eq!(
        orchestrator.status(&run_id).await.unwrap(),
        RunStatus::Cancelled
    );
    assert!(orchestrator.execute(&run_id).await.is_err());
}

#[tokio::test]
async fn invalid_run_config_is_rejected_before_queued() {
    let orchestrator = orchestrator_with(fixture::provider_set()).await;
    let result = orchestrator.create_run(RunConfig::new("   ")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn unknown_run_id_errors() {
    let orchestrator = orchestrator_with(fixture::provider_set()).await;
    assert!(orchestrator.execute("no-such-run").await.is_err());
    assert!(orchestrator.pause("no-such-run").await.is_err());
}

// ─── Constraints thread through to issued queries ──────────────────────

#[tokio::test]
async fn constraints_are_rendered_into_queries() {
    let orchestrator = orchestrator_with(fixture::provider_set()).await;
    let mut config = RunConfig::new(QUESTION);
    config.after = chrono::NaiveDate::from_ymd_opt(2025, 1, 1);
    config.domains = vec!["allergan.com".to_string()];
    let run_id = orchestrator.create_run(config).await.unwrap();

    orchestrator.execute(&run_id).await.unwrap();

    let queries = store::queries_for_run(orchestrator.pool(), &run_id)
        .await
        .unwrap();
    assert!(!queries.is_empty());
    assert!(queries
        .iter()
        .all(|q| q.query.contains("after:2025/01/01") && q.query.contains("from:allergan.com")));
}
