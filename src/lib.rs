//! # mailtrawl
//!
//! Iterative evidence retrieval and cited thread summarization over an
//! email corpus.
//!
//! mailtrawl answers a natural-language evidence question against a
//! bounded mailbox by iteratively searching, expanding query terms,
//! ranking candidate passages (lexical + vector + rerank), and producing
//! one cited markdown summary per relevant thread.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌──────────────┐
//! │ SearchProvider│──▶│  Run Orchestrator │──▶│   SQLite     │
//! │ (email corpus)│   │ iterate / expand  │   │ evidence     │
//! └──────────────┘   │ rank / summarize  │   │ store        │
//!                    └───────┬──────────┘   └──────────────┘
//!                            │ events
//!                            ▼
//!                    per-run broadcast stream
//! ```
//!
//! A run advances through `Queued → Fetching → Normalizing → Ranking →
//! Summarizing → Exporting → Done`, with cooperative pause/cancel checked
//! at iteration and phase boundaries. Providers (search, embedding,
//! lexical index, vector index, reranker, summarizer) are injected
//! through [`providers::ProviderSet`]; the [`fixture`] module ships
//! deterministic in-memory implementations of all of them.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mailtrawl::{Config, RunConfig, RunOrchestrator};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let orchestrator =
//!     RunOrchestrator::new(Config::default(), mailtrawl::fixture::provider_set()).await?;
//! let run_id = orchestrator
//!     .create_run(RunConfig::new("Why was the CoolSculpting Elite machine returned?"))
//!     .await?;
//! let mut events = orchestrator.subscribe(&run_id);
//! orchestrator.execute(&run_id).await?;
//! while let Ok(event) = events.try_recv() {
//!     println!("{:?} {}", event.kind, event.payload);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and per-run requests |
//! | [`models`] | Core data types |
//! | [`providers`] | Provider contracts and injection |
//! | [`orchestrator`] | Retrieval loop and phase state machine |
//! | [`terms`] | Term extraction and expansion |
//! | [`planner`] | Query planning |
//! | [`normalize`] | Body cleaning and chunking |
//! | [`ranking`] | Hybrid ranking stage |
//! | [`summarize`] | Thread summarization stage |
//! | [`events`] | Per-run event streams |
//! | [`control`] | Cooperative pause/cancel signals |
//! | [`fixture`] | Deterministic in-memory providers |
//! | [`openai`] | OpenAI embeddings adapter |
//! | [`store`] | Evidence store accessors |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod control;
pub mod db;
pub mod error;
pub mod events;
pub mod fixture;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod openai;
pub mod orchestrator;
pub mod planner;
pub mod providers;
pub mod ranking;
pub mod store;
pub mod summarize;
pub mod terms;

pub use config::{Config, RunConfig};
pub use error::{ConfigError, ProviderError};
pub use events::{RunEvent, RunEventKind};
pub use models::RunStatus;
pub use orchestrator::RunOrchestrator;
pub use providers::ProviderSet;
