//! PostgreSQL result store.
//!
//! One table keyed by (chat_id, window_start). The same table serves as the
//! durable checkpoint: a thin row is inserted as soon as a chat's analysis
//! succeeds, and `save_results` later upserts the full column set. Chunked
//! inserts go through a query builder to stay under payload ceilings.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sqlx::postgres::PgPool;
use sqlx::QueryBuilder;

use crate::analyzer::AnalysisRecord;
use crate::checkpoint::CheckpointStore;
use crate::error::{ParleyError, Result};
use crate::ingest::AnalysisWindow;
use crate::storage::{ResultStore, StoredAnalysis, WindowSummary};

const COLUMNS: &str = "chat_id, window_start, window_end, analyzed_at, agent_name, tags, \
cx_sentiment, cx_humanization_score, cx_nps_prediction, cx_resolution_status, \
cx_personalization_used, cx_satisfaction_comment, \
product_names, product_category, product_interest_level, product_budget_mentioned, product_trends, \
sales_funnel_stage, sales_outcome, sales_lead_type, sales_rejection_reason, sales_next_step, sales_urgency, \
qa_script_adherence, qa_questions_asked, qa_questions_missing, qa_response_time_quality, \
qa_improvement_areas, qa_overall_score, \
processing_ms, model, cost_usd, cache_hit";

/// PostgreSQL-backed implementation of [`ResultStore`] and
/// [`CheckpointStore`].
#[derive(Clone)]
pub struct PostgresResultStore {
    pool: PgPool,
}

impl PostgresResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the results table and its window index if missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_analysis_results (
                chat_id TEXT NOT NULL,
                window_start DATE NOT NULL,
                window_end DATE NOT NULL,
                analyzed_at TIMESTAMPTZ NOT NULL,
                agent_name TEXT,
                tags TEXT[],
                cx_sentiment TEXT,
                cx_humanization_score SMALLINT,
                cx_nps_prediction SMALLINT,
                cx_resolution_status TEXT,
                cx_personalization_used BOOLEAN,
                cx_satisfaction_comment TEXT,
                product_names TEXT[],
                product_category TEXT,
                product_interest_level TEXT,
                product_budget_mentioned BOOLEAN,
                product_trends TEXT[],
                sales_funnel_stage TEXT,
                sales_outcome TEXT,
                sales_lead_type TEXT,
                sales_rejection_reason TEXT,
                sales_next_step TEXT,
                sales_urgency TEXT,
                qa_script_adherence BOOLEAN,
                qa_questions_asked TEXT[],
                qa_questions_missing TEXT[],
                qa_response_time_quality TEXT,
                qa_improvement_areas TEXT[],
                qa_overall_score SMALLINT,
                processing_ms BIGINT,
                model TEXT,
                cost_usd DOUBLE PRECISION,
                cache_hit BOOLEAN,
                PRIMARY KEY (chat_id, window_start)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Backs the checkpoint skip-check: lookups are always by window
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chat_analysis_results_window \
             ON chat_analysis_results (window_start, chat_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_chunk(&self, rows: &[StoredAnalysis]) -> std::result::Result<(), sqlx::Error> {
        let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!(
            "INSERT INTO chat_analysis_results ({COLUMNS}) "
        ));

        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.chat_id.clone())
                .push_bind(row.window_start)
                .push_bind(row.window_end)
                .push_bind(row.analyzed_at)
                .push_bind(row.agent_name.clone())
                .push_bind(row.tags.clone())
                .push_bind(row.cx_sentiment.clone())
                .push_bind(row.cx_humanization_score)
                .push_bind(row.cx_nps_prediction)
                .push_bind(row.cx_resolution_status.clone())
                .push_bind(row.cx_personalization_used)
                .push_bind(row.cx_satisfaction_comment.clone())
                .push_bind(row.product_names.clone())
                .push_bind(row.product_category.clone())
                .push_bind(row.product_interest_level.clone())
                .push_bind(row.product_budget_mentioned)
                .push_bind(row.product_trends.clone())
                .push_bind(row.sales_funnel_stage.clone())
                .push_bind(row.sales_outcome.clone())
                .push_bind(row.sales_lead_type.clone())
                .push_bind(row.sales_rejection_reason.clone())
                .push_bind(row.sales_next_step.clone())
                .push_bind(row.sales_urgency.clone())
                .push_bind(row.qa_script_adherence)
                .push_bind(row.qa_questions_asked.clone())
                .push_bind(row.qa_questions_missing.clone())
                .push_bind(row.qa_response_time_quality.clone())
                .push_bind(row.qa_improvement_areas.clone())
                .push_bind(row.qa_overall_score)
                .push_bind(row.processing_ms)
                .push_bind(row.model.clone())
                .push_bind(row.cost_usd)
                .push_bind(row.cache_hit);
        });

        // A rerun overwrites the prior row for the same (chat, window)
        builder.push(
            " ON CONFLICT (chat_id, window_start) DO UPDATE SET \
             window_end = EXCLUDED.window_end, \
             analyzed_at = EXCLUDED.analyzed_at, \
             agent_name = EXCLUDED.agent_name, \
             tags = EXCLUDED.tags, \
             cx_sentiment = EXCLUDED.cx_sentiment, \
             cx_humanization_score = EXCLUDED.cx_humanization_score, \
             cx_nps_prediction = EXCLUDED.cx_nps_prediction, \
             cx_resolution_status = EXCLUDED.cx_resolution_status, \
             cx_personalization_used = EXCLUDED.cx_personalization_used, \
             cx_satisfaction_comment = EXCLUDED.cx_satisfaction_comment, \
             product_names = EXCLUDED.product_names, \
             product_category = EXCLUDED.product_category, \
             product_interest_level = EXCLUDED.product_interest_level, \
             product_budget_mentioned = EXCLUDED.product_budget_mentioned, \
             product_trends = EXCLUDED.product_trends, \
             sales_funnel_stage = EXCLUDED.sales_funnel_stage, \
             sales_outcome = EXCLUDED.sales_outcome, \
             sales_lead_type = EXCLUDED.sales_lead_type, \
             sales_rejection_reason = EXCLUDED.sales_rejection_reason, \
             sales_next_step = EXCLUDED.sales_next_step, \
             sales_urgency = EXCLUDED.sales_urgency, \
             qa_script_adherence = EXCLUDED.qa_script_adherence, \
             qa_questions_asked = EXCLUDED.qa_questions_asked, \
             qa_questions_missing = EXCLUDED.qa_questions_missing, \
             qa_response_time_quality = EXCLUDED.qa_response_time_quality, \
             qa_improvement_areas = EXCLUDED.qa_improvement_areas, \
             qa_overall_score = EXCLUDED.qa_overall_score, \
             processing_ms = EXCLUDED.processing_ms, \
             model = EXCLUDED.model, \
             cost_usd = EXCLUDED.cost_usd, \
             cache_hit = EXCLUDED.cache_hit",
        );

        builder.build().execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ResultStore for PostgresResultStore {
    #[tracing::instrument(skip(self, results), fields(rows = results.len(), window = %window))]
    async fn save_results(
        &self,
        results: &[AnalysisRecord],
        window: &AnalysisWindow,
        chunk_size: usize,
    ) -> Result<u64> {
        let chunk_size = chunk_size.max(1);
        let rows: Vec<StoredAnalysis> = results
            .iter()
            .map(|record| StoredAnalysis::from_record(record, window))
            .collect();

        let total_chunks = rows.len().div_ceil(chunk_size);
        let mut committed = 0u64;

        for (index, chunk) in rows.chunks(chunk_size).enumerate() {
            tracing::debug!(
                chunk = index + 1,
                total_chunks,
                rows = chunk.len(),
                "writing chunk"
            );
            if let Err(e) = self.insert_chunk(chunk).await {
                tracing::error!(chunk = index + 1, error = %e, "chunk write failed, aborting");
                return Err(ParleyError::StorageWrite {
                    committed,
                    source: e.into(),
                });
            }
            committed += chunk.len() as u64;
        }

        tracing::info!(committed, total_chunks, "results saved");
        Ok(committed)
    }

    async fn load_results(&self, window_start: NaiveDate) -> Result<Vec<StoredAnalysis>> {
        let rows = sqlx::query_as::<_, StoredAnalysis>(&format!(
            "SELECT {COLUMNS} FROM chat_analysis_results \
             WHERE window_start = $1 ORDER BY analyzed_at DESC"
        ))
        .bind(window_start)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_windows(&self) -> Result<Vec<WindowSummary>> {
        let windows = sqlx::query_as::<_, WindowSummary>(
            "SELECT window_start, window_end, \
             COUNT(*) AS total_chats, \
             COUNT(DISTINCT agent_name) AS total_agents \
             FROM chat_analysis_results \
             GROUP BY window_start, window_end \
             ORDER BY window_start DESC \
             LIMIT 52",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(windows)
    }

    async fn analyzed_ids(&self, window_start: NaiveDate) -> Result<HashSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT chat_id FROM chat_analysis_results WHERE window_start = $1",
        )
        .bind(window_start)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }
}

#[async_trait]
impl CheckpointStore for PostgresResultStore {
    async fn load(&self, window: &AnalysisWindow) -> Result<HashSet<String>> {
        self.analyzed_ids(window.start).await
    }

    async fn record(&self, window: &AnalysisWindow, chat_id: &str) -> Result<()> {
        // Thin marker row; save_results later upserts the full column set.
        // DO NOTHING keeps concurrent inserts and reruns idempotent.
        sqlx::query(
            "INSERT INTO chat_analysis_results (chat_id, window_start, window_end, analyzed_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (chat_id, window_start) DO NOTHING",
        )
        .bind(chat_id)
        .bind(window.start)
        .bind(window.end)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::cache::NoopCache;
    use crate::chat::test_fixtures::sample_chat;
    use crate::config::LlmSettings;
    use crate::llm::analysis::test_fixtures::stub_valid_axes;
    use crate::llm::client::MockLlmClient;
    use crate::rate::RateBudget;
    use crate::Analyzer;

    // Integration tests against a live database.
    // Run with: DATABASE_URL=postgres://... cargo test --features postgres -- --ignored

    async fn create_test_store() -> PostgresResultStore {
        let database_url =
            std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
        let pool = PgPool::connect(&database_url)
            .await
            .expect("Failed to connect to test database");
        let store = PostgresResultStore::new(pool);
        store.ensure_schema().await.expect("Failed to create schema");
        store
    }

    fn test_window() -> AnalysisWindow {
        AnalysisWindow {
            start: NaiveDate::from_ymd_opt(2030, 1, 7).unwrap(),
            end: NaiveDate::from_ymd_opt(2030, 1, 13).unwrap(),
        }
    }

    async fn sample_records(n: usize) -> Vec<AnalysisRecord> {
        let mock = MockLlmClient::new();
        stub_valid_axes(&mock);
        let analyzer = Analyzer::new(
            mock,
            Arc::new(NoopCache),
            Arc::new(RateBudget::new(100_000)),
            &LlmSettings::default(),
            Duration::from_secs(60),
        );

        let mut records = Vec::with_capacity(n);
        for i in 0..n {
            records.push(
                analyzer
                    .analyze_chat(&sample_chat(&format!("pg-chat-{i}")))
                    .await
                    .unwrap(),
            );
        }
        records
    }

    async fn clear_window(store: &PostgresResultStore) {
        sqlx::query("DELETE FROM chat_analysis_results WHERE window_start = $1")
            .bind(test_window().start)
            .execute(store.pool())
            .await
            .expect("Failed to clear test window");
    }

    #[tokio::test]
    #[ignore]
    async fn test_save_and_load_round_trip() {
        let store = create_test_store().await;
        clear_window(&store).await;

        let records = sample_records(3).await;
        let written = store
            .save_results(&records, &test_window(), 2)
            .await
            .unwrap();
        assert_eq!(written, 3);

        let rows = store.load_results(test_window().start).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].cx_sentiment.as_deref(), Some("neutral"));
        assert_eq!(rows[0].qa_overall_score, Some(4));
        assert_eq!(
            rows[0].product_names.as_deref(),
            Some(&["Focused Ultrasound".to_string(), "HIFU".to_string()][..])
        );
    }

    #[tokio::test]
    #[ignore]
    async fn test_rerun_upserts_instead_of_duplicating() {
        let store = create_test_store().await;
        clear_window(&store).await;

        let records = sample_records(2).await;
        store
            .save_results(&records, &test_window(), 500)
            .await
            .unwrap();
        store
            .save_results(&records, &test_window(), 500)
            .await
            .unwrap();

        let rows = store.load_results(test_window().start).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    #[ignore]
    async fn test_checkpoint_record_then_full_save() {
        let store = create_test_store().await;
        clear_window(&store).await;

        // The thin checkpoint row lands first
        store.record(&test_window(), "pg-chat-0").await.unwrap();
        let ids = CheckpointStore::load(&store, &test_window()).await.unwrap();
        assert!(ids.contains("pg-chat-0"));

        // Full save upserts over the marker
        let records = sample_records(1).await;
        store
            .save_results(&records, &test_window(), 500)
            .await
            .unwrap();

        let rows = store.load_results(test_window().start).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].cx_sentiment.is_some());
    }

    #[tokio::test]
    #[ignore]
    async fn test_list_windows_includes_test_window() {
        let store = create_test_store().await;
        clear_window(&store).await;

        let records = sample_records(2).await;
        store
            .save_results(&records, &test_window(), 500)
            .await
            .unwrap();

        let windows = store.list_windows().await.unwrap();
        let summary = windows
            .iter()
            .find(|w| w.window_start == test_window().start)
            .expect("test window missing from listing");
        assert_eq!(summary.total_chats, 2);
    }
}
