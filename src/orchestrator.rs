//! Run orchestration: the retrieval loop and phase state machine.
//!
//! A run advances through `Queued → Fetching → Normalizing → Ranking →
//! Summarizing → Exporting → Done`, with `Paused`, `Cancelled`, and
//! `Failed` reachable from any non-terminal state. The orchestrator owns
//! the `seen` message/thread sets and the iteration metrics for the
//! duration of a run; persistence is an audit side effect, never a
//! precondition for a transition.
//!
//! Pause and cancel are cooperative flags checked at the top of each
//! iteration and between phases — an in-flight provider call is never
//! preempted. A pause that lands mid-iteration suspends at the next
//! iteration boundary; resuming continues from that boundary with the
//! saved term/seen state.

use anyhow::{bail, Result};
use chrono::Utc;
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, RetrievalConfig, RunConfig};
use crate::control::{RunSignals, SignalRegistry};
use crate::error::ConfigError;
use crate::events::{EventBus, RunEvent, RunEventKind};
use crate::models::{IterationMetrics, MailMessage, RunStatus};
use crate::providers::ProviderSet;
use crate::store::StoredRun;
use crate::{db, migrate, normalize, planner, ranking, store, summarize, terms};

/// Retrieval-loop state carried across a pause.
struct RetrievalState {
    terms: BTreeSet<String>,
    seen_messages: HashSet<String>,
    seen_threads: HashSet<String>,
    metrics: Vec<IterationMetrics>,
    next_iteration: u32,
}

enum LoopOutcome {
    Completed(usize),
    Paused,
    Cancelled,
}

/// Drives runs from creation to completion.
///
/// Providers are injected at construction; the orchestrator is the only
/// component that mutates run state. Clone-free sharing is via `Arc`.
pub struct RunOrchestrator {
    config: Config,
    pool: SqlitePool,
    providers: ProviderSet,
    events: EventBus,
    signals: SignalRegistry,
    resume_states: Mutex<HashMap<String, RetrievalState>>,
}

impl RunOrchestrator {
    /// Connect to storage, apply migrations, and wire the provider set.
    pub async fn new(config: Config, providers: ProviderSet) -> Result<Self> {
        let pool = db::connect(&config.db).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self {
            config,
            pool,
            providers,
            events: EventBus::default(),
            signals: SignalRegistry::default(),
            resume_states: Mutex::new(HashMap::new()),
        })
    }

    /// The underlying evidence store, for read-side callers.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Subscribe to a run's event stream.
    pub fn subscribe(&self, run_id: &str) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe(run_id)
    }

    /// Validate a run request and persist it as `Queued`.
    pub async fn create_run(&self, config: RunConfig) -> Result<String> {
        config.validate()?;
        let created_at = Utc::now();
        let run_id = format!(
            "{}-{}",
            created_at.format("%Y-%m-%d"),
            &Uuid::new_v4().to_string()[..8]
        );
        store::insert_run(&self.pool, &run_id, created_at, &config).await?;
        info!(run_id, question = %config.question, "run created");
        Ok(run_id)
    }

    /// Current status of a run.
    pub async fn status(&self, run_id: &str) -> Result<RunStatus> {
        let run = self.load_existing(run_id).await?;
        Ok(run.status)
    }

    /// Execute the full phase sequence for a run.
    ///
    /// Returns `Ok` when the run completes, pauses, or is cancelled. Any
    /// error escaping a phase marks the run `Failed` with the message
    /// attached to its metrics, and is returned to the caller.
    pub async fn execute(&self, run_id: &str) -> Result<()> {
        let run = self.load_existing(run_id).await?;
        if run.status.is_terminal() {
            bail!("run {} is already {}", run_id, run.status.as_str());
        }

        let signals = self.signals.signals_for(run_id);
        match self.run_phases(&run, &signals).await {
            Ok(()) => Ok(()),
            Err(error) => {
                let message = format!("{:#}", error);
                if let Err(store_error) =
                    store::record_failure(&self.pool, run_id, &message).await
                {
                    warn!(run_id, %store_error, "failed to record run failure");
                }
                self.events.publish(RunEvent::new(
                    RunEventKind::RunFailed,
                    run_id,
                    json!({ "error": message }),
                ));
                self.cleanup(run_id);
                Err(error)
            }
        }
    }

    /// Request a pause. Takes effect at the next iteration or phase
    /// boundary; an in-flight provider call finishes first.
    pub async fn pause(&self, run_id: &str) -> Result<()> {
        let run = self.load_existing(run_id).await?;
        if run.status.is_terminal() {
            bail!("run {} is already {}", run_id, run.status.as_str());
        }
        self.signals.signals_for(run_id).request_pause();
        store::update_status(&self.pool, run_id, RunStatus::Paused).await?;
        self.events.publish(RunEvent::new(
            RunEventKind::RunPaused,
            run_id,
            serde_json::Value::Null,
        ));
        info!(run_id, "pause requested");
        Ok(())
    }

    /// Clear a pause. The caller re-invokes [`execute`](Self::execute) to
    /// continue from the next iteration boundary.
    pub async fn resume(&self, run_id: &str) -> Result<()> {
        let run = self.load_existing(run_id).await?;
        if run.status.is_terminal() {
            bail!("run {} is already {}", run_id, run.status.as_str());
        }
        self.signals.signals_for(run_id).clear_pause();
        store::update_status(&self.pool, run_id, RunStatus::Queued).await?;
        self.events.publish(RunEvent::new(
            RunEventKind::RunResumed,
            run_id,
            serde_json::Value::Null,
        ));
        info!(run_id, "run resumed");
        Ok(())
    }

    /// Cancel a run. Partially written records are kept — no rollback.
    pub async fn cancel(&self, run_id: &str) -> Result<()> {
        self.load_existing(run_id).await?;
        self.signals.signals_for(run_id).request_cancel();
        store::update_status(&self.pool, run_id, RunStatus::Cancelled).await?;
        self.events.publish(RunEvent::new(
            RunEventKind::RunCancelled,
            run_id,
            serde_json::Value::Null,
        ));
        info!(run_id, "run cancelled");
        Ok(())
    }

    async fn load_existing(&self, run_id: &str) -> Result<StoredRun> {
        Ok(store::load_run(&self.pool, run_id)
            .await?
            .ok_or_else(|| ConfigError::RunNotFound {
                run_id: run_id.to_string(),
            })?)
    }

    // ─── Phase sequencing ──────────────────────────────────────────────

    async fn run_phases(&self, run: &StoredRun, signals: &RunSignals) -> Result<()> {
        let run_id = run.run_id.as_str();
        let started = Instant::now();

        // Fetching: iterative retrieval with term expansion.
        self.enter_phase(run_id, RunStatus::Fetching).await?;
        match self.retrieval_loop(run, signals).await? {
            LoopOutcome::Cancelled => return self.finish_cancelled(run_id).await,
            LoopOutcome::Paused => return self.finish_paused(run_id).await,
            LoopOutcome::Completed(iterations) => {
                self.phase_complete(run_id, RunStatus::Fetching, json!({ "iterations": iterations }));
            }
        }
        if self.phase_boundary(run_id, signals).await? {
            return Ok(());
        }

        // Normalizing: clean bodies and chunk, once per run.
        self.enter_phase(run_id, RunStatus::Normalizing).await?;
        let messages = store::messages_for_run(&self.pool, run_id).await?;
        let existing = store::chunks_for_run(&self.pool, run_id).await?;
        let chunk_count = if existing.is_empty() {
            let mut chunks = Vec::new();
            for message in &messages {
                chunks.extend(normalize::normalize_message(
                    &message.meta.id,
                    &message.body,
                    &self.config.chunking,
                ));
            }
            store::insert_chunks(&self.pool, run_id, &chunks).await?;
            chunks.len()
        } else {
            existing.len()
        };
        self.phase_complete(
            run_id,
            RunStatus::Normalizing,
            json!({ "messages": messages.len(), "chunks": chunk_count }),
        );
        if self.phase_boundary(run_id, signals).await? {
            return Ok(());
        }

        // Ranking: lexical + vector + rerank, then threshold selection.
        self.enter_phase(run_id, RunStatus::Ranking).await?;
        let chunks = store::chunks_for_run(&self.pool, run_id).await?;
        let ranked =
            ranking::rank_chunks(&self.providers, &self.config.ranking, &run.question, chunks)
                .await;
        let selected_count = ranked.iter().filter(|c| c.selected).count();
        store::update_chunk_scores(&self.pool, run_id, &ranked).await?;
        self.phase_complete(
            run_id,
            RunStatus::Ranking,
            json!({ "chunks": ranked.len(), "selected": selected_count }),
        );
        if self.phase_boundary(run_id, signals).await? {
            return Ok(());
        }

        // Summarizing: one cited digest per thread with selected chunks.
        self.enter_phase(run_id, RunStatus::Summarizing).await?;
        let selected = store::selected_chunks(&self.pool, run_id).await?;
        let already_summarized: HashSet<String> = store::thread_summaries(&self.pool, run_id)
            .await?
            .into_iter()
            .map(|s| s.thread_id)
            .collect();
        let summaries = summarize::summarize_threads(
            self.providers.summarizer.as_ref(),
            &messages,
            &selected,
            &run.question,
        )
        .await;
        let mut written = 0usize;
        for summary in &summaries {
            if already_summarized.contains(&summary.thread_id) {
                continue;
            }
            store::insert_thread_summary(&self.pool, run_id, summary).await?;
            written += 1;
        }
        self.phase_complete(run_id, RunStatus::Summarizing, json!({ "threads": written }));
        if self.phase_boundary(run_id, signals).await? {
            return Ok(());
        }

        // Exporting: assemble aggregate run metrics.
        self.enter_phase(run_id, RunStatus::Exporting).await?;
        let metrics = self.aggregate_metrics(run_id, started).await?;
        store::set_metrics(&self.pool, run_id, &metrics).await?;
        self.phase_complete(run_id, RunStatus::Exporting, metrics.clone());

        store::update_status(&self.pool, run_id, RunStatus::Done).await?;
        self.events.publish(RunEvent::new(
            RunEventKind::RunComplete,
            run_id,
            json!({ "metrics": metrics }),
        ));
        info!(run_id, "run complete");
        self.cleanup(run_id);
        Ok(())
    }

    async fn enter_phase(&self, run_id: &str, phase: RunStatus) -> Result<()> {
        store::update_status(&self.pool, run_id, phase).await?;
        info!(run_id, phase = phase.as_str(), "phase started");
        self.events.publish(RunEvent::new(
            RunEventKind::PhaseStarted,
            run_id,
            json!({ "phase": phase.as_str() }),
        ));
        Ok(())
    }

    fn phase_complete(&self, run_id: &str, phase: RunStatus, details: serde_json::Value) {
        self.events.publish(RunEvent::new(
            RunEventKind::PhaseComplete,
            run_id,
            json!({ "phase": phase.as_str(), "details": details }),
        ));
    }

    /// Cooperative check between phases. Returns true when the run
    /// suspended and the phase sequence must stop.
    async fn phase_boundary(&self, run_id: &str, signals: &RunSignals) -> Result<bool> {
        if signals.cancel_requested() {
            self.finish_cancelled(run_id).await?;
            return Ok(true);
        }
        if signals.pause_requested() {
            self.finish_paused(run_id).await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn finish_cancelled(&self, run_id: &str) -> Result<()> {
        store::update_status(&self.pool, run_id, RunStatus::Cancelled).await?;
        info!(run_id, "run stopped on cancel signal");
        self.cleanup(run_id);
        Ok(())
    }

    async fn finish_paused(&self, run_id: &str) -> Result<()> {
        store::update_status(&self.pool, run_id, RunStatus::Paused).await?;
        info!(run_id, "run suspended on pause signal");
        Ok(())
    }

    fn cleanup(&self, run_id: &str) {
        self.signals.remove(run_id);
        self.resume_states.lock().unwrap().remove(run_id);
        self.events.remove(run_id);
    }

    async fn aggregate_metrics(
        &self,
        run_id: &str,
        started: Instant,
    ) -> Result<serde_json::Value> {
        let iterations = store::iterations_for_run(&self.pool, run_id).await?;
        let chunks = store::chunks_for_run(&self.pool, run_id).await?;
        let selected = chunks.iter().filter(|c| c.selected).count();
        let summaries = store::thread_summaries(&self.pool, run_id).await?;
        Ok(json!({
            "iterations": iterations.len(),
            "total_duration_ms": started.elapsed().as_millis() as u64,
            "final_precision": iterations.last().map(|m| m.precision_proxy).unwrap_or(0.0),
            "total_messages": iterations.iter().map(|m| m.new_messages).sum::<u64>(),
            "total_threads": iterations.iter().map(|m| m.new_threads).sum::<u64>(),
            "chunks": chunks.len(),
            "selected_chunks": selected,
            "thread_summaries": summaries.len(),
        }))
    }

    // ─── Retrieval loop ────────────────────────────────────────────────

    async fn retrieval_loop(
        &self,
        run: &StoredRun,
        signals: &RunSignals,
    ) -> Result<LoopOutcome> {
        let run_id = run.run_id.as_str();
        let retrieval = &self.config.retrieval;
        let max_iterations = run.config.max_iterations.unwrap_or(retrieval.max_iterations);

        let mut state = self.restore_state(run).await?;
        if run.stop_reason.is_some() || state.metrics.iter().any(|m| m.stop_reason.is_some()) {
            return Ok(LoopOutcome::Completed(state.metrics.len()));
        }

        let clause = self
            .providers
            .search
            .constraint_clause(&run.config.constraints());

        while state.next_iteration < max_iterations {
            if signals.cancel_requested() {
                return Ok(LoopOutcome::Cancelled);
            }
            if signals.pause_requested() {
                self.resume_states
                    .lock()
                    .unwrap()
                    .insert(run_id.to_string(), state);
                return Ok(LoopOutcome::Paused);
            }

            let iteration = state.next_iteration;
            let iteration_started = Instant::now();
            let plans = planner::plan(
                &run.question,
                &state.terms,
                iteration,
                &clause,
                retrieval.max_queries_per_iteration,
            );
            debug!(run_id, iteration, queries = plans.len(), "iteration planned");

            let mut fetched: Vec<MailMessage> = Vec::new();
            let mut queries_tried = 0u32;

            for plan in &plans {
                if signals.cancel_requested() {
                    return Ok(LoopOutcome::Cancelled);
                }
                match self.providers.search.search(&plan.query).await {
                    Ok(metas) => {
                        let collected: HashSet<&str> =
                            fetched.iter().map(|m| m.meta.id.as_str()).collect();
                        let new_metas: Vec<_> = metas
                            .iter()
                            .filter(|m| {
                                !state.seen_messages.contains(&m.id)
                                    && !collected.contains(m.id.as_str())
                            })
                            .collect();
                        let new_thread_count = new_metas
                            .iter()
                            .map(|m| m.thread_id.as_str())
                            .filter(|t| !state.seen_threads.contains(*t))
                            .collect::<HashSet<_>>()
                            .len();

                        if !new_metas.is_empty() {
                            let ids: Vec<String> =
                                new_metas.iter().map(|m| m.id.clone()).collect();
                            match self.providers.search.fetch_bodies(&ids).await {
                                Ok(bodies) => fetched.extend(bodies),
                                Err(error) => {
                                    warn!(run_id, query = %plan.query, %error,
                                        "body fetch failed; continuing with remaining queries");
                                }
                            }
                        }

                        store::insert_query_record(
                            &self.pool,
                            run_id,
                            iteration,
                            plan,
                            metas.len(),
                            new_metas.len(),
                            new_thread_count,
                        )
                        .await?;
                        queries_tried += 1;
                    }
                    Err(error) => {
                        warn!(run_id, query = %plan.query, %error,
                            "search query failed; continuing with remaining queries");
                        store::insert_query_record(&self.pool, run_id, iteration, plan, 0, 0, 0)
                            .await?;
                    }
                }
            }

            let new_message_count = fetched.len();
            let new_thread_ids: HashSet<String> = fetched
                .iter()
                .map(|m| m.meta.thread_id.clone())
                .filter(|t| !state.seen_threads.contains(t))
                .collect();

            state
                .seen_messages
                .extend(fetched.iter().map(|m| m.meta.id.clone()));
            state.seen_threads.extend(new_thread_ids.iter().cloned());

            store::insert_messages(&self.pool, run_id, &fetched).await?;

            let metrics = IterationMetrics {
                iteration,
                queries_tried,
                new_messages: new_message_count as u64,
                new_threads: new_thread_ids.len() as u64,
                precision_proxy: precision_proxy(&fetched),
                novelty_gain: new_thread_ids.len() as f64
                    / state.seen_threads.len().max(1) as f64,
                duration_ms: iteration_started.elapsed().as_millis() as u64,
                stop_reason: None,
            };
            state.metrics.push(metrics);
            state.next_iteration = iteration + 1;

            let stop_reason = check_stopping(&state.metrics, retrieval);
            if let Some(reason) = &stop_reason {
                state.metrics.last_mut().unwrap().stop_reason = Some(reason.clone());
            }
            let recorded = state.metrics.last().unwrap();
            store::insert_iteration(&self.pool, run_id, recorded).await?;
            self.events.publish(RunEvent::new(
                RunEventKind::IterationComplete,
                run_id,
                json!({ "iteration": iteration, "metrics": recorded }),
            ));
            info!(
                run_id,
                iteration,
                new_messages = recorded.new_messages,
                new_threads = recorded.new_threads,
                precision = recorded.precision_proxy,
                novelty = recorded.novelty_gain,
                "iteration complete"
            );

            if let Some(reason) = stop_reason {
                info!(run_id, %reason, "stopping retrieval");
                store::set_stop_reason(&self.pool, run_id, &reason).await?;
                break;
            }

            if state.next_iteration < max_iterations {
                let expanded = terms::expand_terms(&fetched, &state.terms);
                let added: BTreeSet<String> =
                    expanded.difference(&state.terms).cloned().collect();
                let removed: BTreeSet<String> =
                    state.terms.difference(&expanded).cloned().collect();
                store::insert_term_expansion(
                    &self.pool,
                    run_id,
                    state.next_iteration,
                    &added,
                    &removed,
                    &expanded,
                )
                .await?;
                state.terms = expanded;
            }
        }

        Ok(LoopOutcome::Completed(state.metrics.len()))
    }

    /// Load loop state saved by a pause, or rebuild it from storage.
    async fn restore_state(&self, run: &StoredRun) -> Result<RetrievalState> {
        if let Some(state) = self.resume_states.lock().unwrap().remove(&run.run_id) {
            return Ok(state);
        }

        let metrics = store::iterations_for_run(&self.pool, &run.run_id).await?;
        let messages = store::messages_for_run(&self.pool, &run.run_id).await?;
        let terms = store::latest_evidence_terms(&self.pool, &run.run_id)
            .await?
            .unwrap_or_else(|| terms::initial_terms(&run.question));
        let next_iteration = metrics.len() as u32;

        Ok(RetrievalState {
            terms,
            seen_messages: messages.iter().map(|m| m.meta.id.clone()).collect(),
            seen_threads: messages.iter().map(|m| m.meta.thread_id.clone()).collect(),
            metrics,
            next_iteration,
        })
    }
}

/// Fraction of fetched messages whose subject+body matches the fixed
/// domain-term list. Zero when nothing was fetched.
fn precision_proxy(messages: &[MailMessage]) -> f64 {
    if messages.is_empty() {
        return 0.0;
    }
    let matching = messages
        .iter()
        .filter(|m| terms::matches_domain_terms(&format!("{} {}", m.meta.subject, m.body)))
        .count();
    matching as f64 / messages.len() as f64
}

/// Trailing-window stopping rule over the last two iterations. A single
/// strong iteration resets the window.
fn check_stopping(metrics: &[IterationMetrics], config: &RetrievalConfig) -> Option<String> {
    if metrics.len() < 2 {
        return None;
    }
    let window = &metrics[metrics.len() - 2..];
    if window
        .iter()
        .all(|m| m.novelty_gain < config.min_novelty_gain)
    {
        return Some(format!(
            "novelty<{} for 2 rounds",
            config.min_novelty_gain
        ));
    }
    if window.iter().all(|m| m.precision_proxy < config.min_precision) {
        return Some(format!("precision<{} for 2 rounds", config.min_precision));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(iteration: u32, precision: f64, novelty: f64) -> IterationMetrics {
        IterationMetrics {
            iteration,
            queries_tried: 1,
            new_messages: 0,
            new_threads: 0,
            precision_proxy: precision,
            novelty_gain: novelty,
            duration_ms: 0,
            stop_reason: None,
        }
    }

    #[test]
    fn test_no_stop_before_two_iterations() {
        let config = RetrievalConfig::default();
        assert!(check_stopping(&[metric(0, 0.0, 0.0)], &config).is_none());
    }

    #[test]
    fn test_stops_on_two_low_novelty_rounds() {
        let config = RetrievalConfig::default();
        let metrics = vec![metric(0, 0.9, 0.01), metric(1, 0.9, 0.0)];
        let reason = check_stopping(&metrics, &config).unwrap();
        assert!(reason.contains("novelty"));
    }

    #[test]
    fn test_stops_on_two_low_precision_rounds() {
        let config = RetrievalConfig::default();
        let metrics = vec![metric(0, 0.1, 0.5), metric(1, 0.2, 0.5)];
        let reason = check_stopping(&metrics, &config).unwrap();
        assert!(reason.contains("precision"));
    }

    #[test]
    fn test_strong_iteration_resets_window() {
        let config = RetrievalConfig::default();
        // A weak round followed by a strong one: no stop.
        let metrics = vec![metric(0, 0.1, 0.01), metric(1, 0.9, 0.5)];
        assert!(check_stopping(&metrics, &config).is_none());
        // Only the trailing two count, not the cumulative history.
        let metrics = vec![
            metric(0, 0.9, 0.5),
            metric(1, 0.1, 0.01),
            metric(2, 0.1, 0.01),
        ];
        assert!(check_stopping(&metrics, &config).is_some());
    }

    #[test]
    fn test_precision_proxy_bounds() {
        assert_eq!(precision_proxy(&[]), 0.0);
    }
}
