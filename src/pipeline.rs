//! Batch pipeline: bounded-concurrency analysis over an arbitrarily large,
//! possibly-streamed collection of chats.
//!
//! The pipeline pulls chats from the input stream one at a time and keeps at
//! most `concurrency` analyses in flight (`buffer_unordered` gives the
//! fixed-size in-flight window with backpressure; the input is never
//! materialized). Per-chat failures are recorded, never raised; successful
//! chats are checkpointed before their completion is reported, so an
//! interrupted run resumes without re-paying for finished work.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::analyzer::{AnalysisRecord, Analyzer};
use crate::checkpoint::CheckpointStore;
use crate::error::{FailureKind, Result};
use crate::ingest::AnalysisWindow;
use crate::llm::client::LlmClient;
use crate::metrics::{chat_timing, BusinessHours, ChatTiming};

/// Tuning for one batch run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum simultaneous in-flight chat analyses
    pub concurrency: usize,
    /// Skip chats already recorded in the checkpoint for this window
    pub checkpoint_enabled: bool,
    /// The window being analyzed (partitions the checkpoint)
    pub window: AnalysisWindow,
    /// Business hours used for the synchronous timing metrics
    pub business_hours: BusinessHours,
}

impl PipelineConfig {
    pub fn new(window: AnalysisWindow) -> Self {
        Self {
            concurrency: 8,
            checkpoint_enabled: true,
            window,
            business_hours: BusinessHours::default(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_checkpoint(mut self, enabled: bool) -> Self {
        self.checkpoint_enabled = enabled;
        self
    }
}

/// Progress snapshot delivered to the callback after every completion.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BatchProgress {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub cache_hits: u64,
}

/// Synchronous progress callback. Must not block: it runs on the pipeline's
/// own scheduling path.
pub type ProgressFn = Arc<dyn Fn(&BatchProgress) + Send + Sync>;

/// One chat that could not be analyzed.
#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub chat_id: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Outcome of a batch run. Every input chat lands in exactly one bucket:
/// `results`, `failures`, or the skip count.
#[derive(Debug, Default, Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    /// Successful analyses, in completion order (not input order; callers
    /// needing input order re-sort by identifier)
    pub results: Vec<AnalysisRecord>,
    /// Timing metrics for every chat that reached the analyzer (successes
    /// and failures alike; skipped chats are not re-measured)
    pub timings: Vec<(String, ChatTiming)>,
    pub failures: Vec<BatchFailure>,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Chats skipped because the checkpoint already contained them. Their
    /// prior results are not re-fetched here; read them back from the result
    /// store when needed.
    pub skipped: u64,
    pub cache_hits: u64,
    /// Whether the run was stopped by cancellation before the input drained
    pub cancelled: bool,
    pub total_cost_usd: f64,
    pub total_processing_ms: u64,
}

enum ChatOutcome {
    Skipped(String),
    Completed(Box<AnalysisRecord>, ChatTiming),
    Failed(BatchFailure, ChatTiming),
}

/// Drives checkpointed, rate-limited analysis over a stream of chats.
pub struct BatchPipeline<C: LlmClient> {
    analyzer: Arc<Analyzer<C>>,
    checkpoint: Arc<dyn CheckpointStore>,
    config: PipelineConfig,
    progress: Option<ProgressFn>,
    progress_tx: broadcast::Sender<BatchProgress>,
    cancel: CancellationToken,
    in_flight: Arc<AtomicUsize>,
}

impl<C: LlmClient> BatchPipeline<C> {
    pub fn new(
        analyzer: Arc<Analyzer<C>>,
        checkpoint: Arc<dyn CheckpointStore>,
        config: PipelineConfig,
    ) -> Self {
        let (progress_tx, _) = broadcast::channel(1024);
        Self {
            analyzer,
            checkpoint,
            config,
            progress: None,
            progress_tx,
            cancel: CancellationToken::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register a progress callback fired after every completion.
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Use an external cancellation token. Cancelling stops the run after
    /// dropping whatever is in flight; checkpointed chats stay checkpointed.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Subscribe to progress snapshots as a stream.
    ///
    /// Lagging receivers may miss intermediate snapshots; each snapshot
    /// carries cumulative counts, so the latest one is always sufficient.
    pub fn subscribe(&self) -> Pin<Box<dyn Stream<Item = BatchProgress> + Send>> {
        let rx = self.progress_tx.subscribe();
        Box::pin(tokio_stream::StreamExt::filter_map(
            BroadcastStream::new(rx),
            |result| result.ok(),
        ))
    }

    /// Run the batch to completion.
    ///
    /// Cancellation safety: dropping the returned future abandons in-flight
    /// analyses. Chats whose checkpoint record was not yet written are
    /// re-analyzed on the next run (the cache usually still hits). No partial
    /// analysis is ever checkpointed.
    #[tracing::instrument(skip(self, chats), fields(window = %self.config.window, concurrency = self.config.concurrency))]
    pub async fn run_batch<S>(&self, chats: S) -> Result<BatchReport>
    where
        S: Stream<Item = crate::chat::Chat> + Send,
    {
        let analyzed: DashSet<String> = DashSet::new();
        if self.config.checkpoint_enabled {
            let prior: HashSet<String> = self.checkpoint.load(&self.config.window).await?;
            tracing::info!(prior = prior.len(), "loaded checkpoint");
            for id in prior {
                analyzed.insert(id);
            }
        }
        let analyzed = &analyzed;

        let mut report = BatchReport {
            run_id: Uuid::new_v4(),
            ..BatchReport::default()
        };
        let mut progress = BatchProgress::default();

        let outcomes = chats
            .map(|chat| self.process_chat(chat, analyzed))
            .buffer_unordered(self.config.concurrency);
        futures::pin_mut!(outcomes);

        loop {
            let outcome = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    tracing::warn!("batch cancelled, dropping in-flight analyses");
                    report.cancelled = true;
                    break;
                }
                outcome = outcomes.next() => match outcome {
                    Some(outcome) => outcome,
                    None => break,
                },
            };

            progress.processed += 1;
            match outcome {
                ChatOutcome::Skipped(chat_id) => {
                    progress.skipped += 1;
                    tracing::debug!(chat_id = %chat_id, "skipped via checkpoint");
                }
                ChatOutcome::Completed(record, timing) => {
                    progress.succeeded += 1;
                    if record.cache_hit {
                        progress.cache_hits += 1;
                    }
                    report.total_cost_usd += record.cost_usd;
                    report.total_processing_ms += record.processing_ms;
                    report.timings.push((record.chat_id.clone(), timing));
                    report.results.push(*record);
                }
                ChatOutcome::Failed(failure, timing) => {
                    progress.failed += 1;
                    tracing::warn!(
                        chat_id = %failure.chat_id,
                        kind = %failure.kind,
                        error = %failure.message,
                        "chat analysis failed"
                    );
                    report.timings.push((failure.chat_id.clone(), timing));
                    report.failures.push(failure);
                }
            }

            if let Some(callback) = &self.progress {
                callback(&progress);
            }
            let _ = self.progress_tx.send(progress);
        }

        report.processed = progress.processed;
        report.succeeded = progress.succeeded;
        report.failed = progress.failed;
        report.skipped = progress.skipped;
        report.cache_hits = progress.cache_hits;

        tracing::info!(
            run_id = %report.run_id,
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            cache_hits = report.cache_hits,
            cost_usd = report.total_cost_usd,
            "batch finished"
        );

        Ok(report)
    }

    async fn process_chat(
        &self,
        chat: crate::chat::Chat,
        analyzed: &DashSet<String>,
    ) -> ChatOutcome {
        let chat_id = chat.id.clone();

        if self.config.checkpoint_enabled && analyzed.contains(&chat_id) {
            return ChatOutcome::Skipped(chat_id);
        }

        let gauge = self.in_flight.clone();
        gauge.fetch_add(1, Ordering::SeqCst);
        let _guard = scopeguard::guard((), move |()| {
            gauge.fetch_sub(1, Ordering::SeqCst);
        });

        // Timing metrics are pure and cheap; computed regardless of how the
        // analyzer call turns out
        let timing = chat_timing(&chat, &self.config.business_hours);

        match self.analyzer.analyze_chat(&chat).await {
            Ok(record) => {
                if self.config.checkpoint_enabled {
                    // Happens-after the successful analysis, happens-before
                    // this chat is reported complete
                    if let Err(e) = self.checkpoint.record(&self.config.window, &chat_id).await {
                        tracing::warn!(chat_id = %chat_id, error = %e, "checkpoint write failed");
                    }
                    analyzed.insert(chat_id);
                }
                ChatOutcome::Completed(Box::new(record), timing)
            }
            Err(e) => ChatOutcome::Failed(
                BatchFailure {
                    chat_id,
                    kind: e.failure_kind(),
                    message: e.to_string(),
                },
                timing,
            ),
        }
    }

    /// Current number of in-flight analyses (observability hook).
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}
