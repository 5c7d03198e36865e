//! Checkpoint store: the set of chat identifiers already analyzed within a
//! window, persisted so an interrupted batch can resume without re-paying for
//! finished work.
//!
//! Treated as an append-only set keyed by identifier within a window
//! partition: no in-place mutation, and concurrent inserts must not lose
//! entries. The Postgres result store doubles as the durable implementation;
//! [`MemoryCheckpoint`] serves tests and single-run usage.

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use crate::error::Result;
use crate::ingest::AnalysisWindow;

/// Append-only set of analyzed chat identifiers per window.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// All identifiers recorded for the window.
    async fn load(&self, window: &AnalysisWindow) -> Result<HashSet<String>>;

    /// Record one identifier. Idempotent; concurrent calls must not lose
    /// entries.
    async fn record(&self, window: &AnalysisWindow, chat_id: &str) -> Result<()>;
}

/// In-memory checkpoint. Lost on restart.
#[derive(Debug, Default)]
pub struct MemoryCheckpoint {
    windows: DashMap<chrono::NaiveDate, DashSet<String>>,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpoint {
    async fn load(&self, window: &AnalysisWindow) -> Result<HashSet<String>> {
        Ok(self
            .windows
            .get(&window.start)
            .map(|set| set.iter().map(|entry| entry.key().clone()).collect())
            .unwrap_or_default())
    }

    async fn record(&self, window: &AnalysisWindow, chat_id: &str) -> Result<()> {
        self.windows
            .entry(window.start)
            .or_default()
            .insert(chat_id.to_string());
        Ok(())
    }
}
