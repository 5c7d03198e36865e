//! In-memory result store.
//!
//! Suitable for tests and single-process runs; rows are lost on restart. The
//! write log and the injectable chunk failure exist so partial-success
//! accounting can be exercised without a database.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::{Mutex, RwLock};

use crate::analyzer::AnalysisRecord;
use crate::error::{ParleyError, Result};
use crate::ingest::AnalysisWindow;
use crate::storage::{ResultStore, StoredAnalysis, WindowSummary};

/// In-memory implementation of [`ResultStore`].
#[derive(Default)]
pub struct InMemoryResultStore {
    rows: RwLock<HashMap<(NaiveDate, String), StoredAnalysis>>,
    write_log: Mutex<Vec<usize>>,
    fail_on_chunk: Mutex<Option<usize>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Row counts of every chunk write attempted, in order.
    pub fn write_log(&self) -> Vec<usize> {
        self.write_log.lock().clone()
    }

    /// Make the `n`-th chunk write (1-based) fail, once.
    pub fn fail_on_chunk(&self, n: usize) {
        *self.fail_on_chunk.lock() = Some(n);
    }

    pub fn row_count(&self) -> usize {
        self.rows.read().len()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn save_results(
        &self,
        results: &[AnalysisRecord],
        window: &AnalysisWindow,
        chunk_size: usize,
    ) -> Result<u64> {
        let chunk_size = chunk_size.max(1);
        let mut committed = 0u64;

        for (index, chunk) in results.chunks(chunk_size).enumerate() {
            let chunk_number = index + 1;
            self.write_log.lock().push(chunk.len());

            let planned_failure = {
                let mut slot = self.fail_on_chunk.lock();
                if *slot == Some(chunk_number) {
                    *slot = None;
                    true
                } else {
                    false
                }
            };
            if planned_failure {
                return Err(ParleyError::StorageWrite {
                    committed,
                    source: anyhow::anyhow!("injected failure on chunk {chunk_number}"),
                });
            }

            let mut rows = self.rows.write();
            for record in chunk {
                rows.insert(
                    (window.start, record.chat_id.clone()),
                    StoredAnalysis::from_record(record, window),
                );
            }
            committed += chunk.len() as u64;
        }

        Ok(committed)
    }

    async fn load_results(&self, window_start: NaiveDate) -> Result<Vec<StoredAnalysis>> {
        let rows = self.rows.read();
        let mut results: Vec<StoredAnalysis> = rows
            .iter()
            .filter(|((start, _), _)| *start == window_start)
            .map(|(_, row)| row.clone())
            .collect();
        results.sort_by(|a, b| b.analyzed_at.cmp(&a.analyzed_at));
        Ok(results)
    }

    async fn list_windows(&self) -> Result<Vec<WindowSummary>> {
        let rows = self.rows.read();

        let mut by_window: HashMap<NaiveDate, (NaiveDate, i64, HashSet<String>)> = HashMap::new();
        for ((start, _), row) in rows.iter() {
            let entry = by_window
                .entry(*start)
                .or_insert((row.window_end, 0, HashSet::new()));
            entry.1 += 1;
            if let Some(agent) = &row.agent_name {
                entry.2.insert(agent.clone());
            }
        }

        let mut windows: Vec<WindowSummary> = by_window
            .into_iter()
            .map(|(start, (end, chats, agents))| WindowSummary {
                window_start: start,
                window_end: end,
                total_chats: chats,
                total_agents: agents.len() as i64,
            })
            .collect();
        windows.sort_by(|a, b| b.window_start.cmp(&a.window_start));
        Ok(windows)
    }

    async fn analyzed_ids(&self, window_start: NaiveDate) -> Result<HashSet<String>> {
        let rows = self.rows.read();
        Ok(rows
            .keys()
            .filter(|(start, _)| *start == window_start)
            .map(|(_, id)| id.clone())
            .collect())
    }
}
