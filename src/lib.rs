//! Analytics pipeline for customer-support chat transcripts.
//!
//! This crate provides the batch-processing core of a support-analytics
//! system:
//! - Validated chat records with transcript rendering
//! - Pure timing metrics (wait time, handling time, agent performance)
//! - An LLM-backed qualitative analyzer (sentiment, product interest,
//!   sales funnel, QA compliance) with schema validation and one retry
//! - A fingerprint-keyed response cache with pluggable backends
//! - A process-wide rate budget over a rolling 60-second window
//! - A bounded-concurrency batch pipeline with checkpointed resume
//! - Chunked persistence of flattened results to PostgreSQL
//! - Report aggregation over persisted results
//!
//! # Example
//! ```ignore
//! use parley::{Analyzer, BatchPipeline, HttpLlmClient, MemoryCheckpoint, RateBudget};
//!
//! let client = HttpLlmClient::new(&settings.llm)?;
//! let cache = parley::cache::from_settings(&settings.cache).await;
//! let budget = Arc::new(RateBudget::new(settings.llm.rate_limit_rpm));
//! let analyzer = Arc::new(Analyzer::new(client, cache, budget, &settings.llm));
//!
//! let pipeline = BatchPipeline::new(analyzer, checkpoint, config);
//! let report = pipeline.run_batch(chat_stream).await?;
//! store.save_results(&report.results, &window, 500).await?;
//! ```

pub mod analyzer;
pub mod cache;
pub mod chat;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod rate;
pub mod report;
pub mod storage;

// Re-export commonly used types
pub use analyzer::{AnalysisRecord, Analyzer, CostModel};
pub use cache::{MemoryCache, NoopCache, RedisCache, ResponseCache};
pub use chat::{Chat, ChatStatus, Message, Sender};
pub use checkpoint::{CheckpointStore, MemoryCheckpoint};
pub use config::Settings;
pub use error::{FailureKind, ParleyError, Result};
pub use ingest::{AnalysisWindow, ChatSource, VecSource};
pub use llm::analysis::{AnalysisKind, ChatAnalysis};
pub use llm::client::{Completion, HttpLlmClient, LlmClient, MockLlmClient};
pub use metrics::{BusinessHours, ChatTiming};
pub use pipeline::{BatchPipeline, BatchProgress, BatchReport, PipelineConfig};
pub use rate::RateBudget;
pub use storage::in_memory::InMemoryResultStore;
pub use storage::{ResultStore, StoredAnalysis, WindowSummary};

#[cfg(feature = "postgres")]
pub use storage::postgres::PostgresResultStore;
