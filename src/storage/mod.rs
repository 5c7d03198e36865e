//! Result store: chunked persistence and read-back of flattened analyses.
//!
//! One row per (chat identifier, analysis window), with the four analysis
//! axes flattened into columns. Writes are chunked to respect external
//! payload ceilings; a chunk failure aborts the remainder and reports the
//! rows already committed rather than hiding the partial success.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::analyzer::AnalysisRecord;
use crate::error::Result;
use crate::ingest::AnalysisWindow;

pub mod in_memory;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Default rows-per-write ceiling.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// One persisted analysis row, axes flattened into scalar columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct StoredAnalysis {
    pub chat_id: String,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub analyzed_at: DateTime<Utc>,
    pub agent_name: Option<String>,
    pub tags: Option<Vec<String>>,

    pub cx_sentiment: Option<String>,
    pub cx_humanization_score: Option<i16>,
    pub cx_nps_prediction: Option<i16>,
    pub cx_resolution_status: Option<String>,
    pub cx_personalization_used: Option<bool>,
    pub cx_satisfaction_comment: Option<String>,

    pub product_names: Option<Vec<String>>,
    pub product_category: Option<String>,
    pub product_interest_level: Option<String>,
    pub product_budget_mentioned: Option<bool>,
    pub product_trends: Option<Vec<String>>,

    pub sales_funnel_stage: Option<String>,
    pub sales_outcome: Option<String>,
    pub sales_lead_type: Option<String>,
    pub sales_rejection_reason: Option<String>,
    pub sales_next_step: Option<String>,
    pub sales_urgency: Option<String>,

    pub qa_script_adherence: Option<bool>,
    pub qa_questions_asked: Option<Vec<String>>,
    pub qa_questions_missing: Option<Vec<String>>,
    pub qa_response_time_quality: Option<String>,
    pub qa_improvement_areas: Option<Vec<String>>,
    pub qa_overall_score: Option<i16>,

    pub processing_ms: Option<i64>,
    pub model: Option<String>,
    pub cost_usd: Option<f64>,
    pub cache_hit: Option<bool>,
}

impl StoredAnalysis {
    /// Flatten an in-memory record into the persisted row shape.
    pub fn from_record(record: &AnalysisRecord, window: &AnalysisWindow) -> Self {
        let analysis = &record.analysis;
        Self {
            chat_id: record.chat_id.clone(),
            window_start: window.start,
            window_end: window.end,
            analyzed_at: record.analyzed_at,
            agent_name: record.agent_name.clone(),
            tags: Some(record.tags.clone()),

            cx_sentiment: Some(analysis.cx.sentiment.as_str().to_string()),
            cx_humanization_score: Some(i16::from(analysis.cx.humanization_score)),
            cx_nps_prediction: Some(i16::from(analysis.cx.nps_prediction)),
            cx_resolution_status: Some(analysis.cx.resolution_status.as_str().to_string()),
            cx_personalization_used: Some(analysis.cx.personalization_used),
            cx_satisfaction_comment: Some(analysis.cx.satisfaction_comment.clone()),

            product_names: Some(analysis.product.products_mentioned.clone()),
            product_category: Some(analysis.product.category.clone()),
            product_interest_level: Some(analysis.product.interest_level.as_str().to_string()),
            product_budget_mentioned: Some(analysis.product.budget_mentioned),
            product_trends: Some(analysis.product.trends.clone()),

            sales_funnel_stage: Some(analysis.sales.funnel_stage.as_str().to_string()),
            sales_outcome: Some(analysis.sales.outcome.as_str().to_string()),
            sales_lead_type: Some(analysis.sales.lead_type.clone()),
            sales_rejection_reason: analysis.sales.rejection_reason.clone(),
            sales_next_step: Some(analysis.sales.next_step.clone()),
            sales_urgency: Some(analysis.sales.urgency.as_str().to_string()),

            qa_script_adherence: Some(analysis.qa.script_adherence),
            qa_questions_asked: Some(analysis.qa.questions_asked.clone()),
            qa_questions_missing: Some(analysis.qa.questions_missing.clone()),
            qa_response_time_quality: Some(analysis.qa.response_time_quality.as_str().to_string()),
            qa_improvement_areas: Some(analysis.qa.improvement_areas.clone()),
            qa_overall_score: Some(i16::from(analysis.qa.overall_score)),

            processing_ms: Some(record.processing_ms as i64),
            model: Some(record.model.clone()),
            cost_usd: Some(record.cost_usd),
            cache_hit: Some(record.cache_hit),
        }
    }
}

/// One analysis window available for read-back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct WindowSummary {
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub total_chats: i64,
    pub total_agents: i64,
}

/// Persistence boundary for analysis results.
///
/// A rerun for an existing (chat, window) pair overwrites the prior row;
/// `analyzed_ids` backs the checkpoint skip-check and must stay cheap.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Write `results` in consecutive chunks of at most `chunk_size` rows,
    /// one write per chunk. Returns total rows written.
    ///
    /// # Errors
    /// A chunk failure aborts the remaining chunks and surfaces
    /// `ParleyError::StorageWrite { committed, .. }` carrying the rows
    /// already committed.
    async fn save_results(
        &self,
        results: &[AnalysisRecord],
        window: &AnalysisWindow,
        chunk_size: usize,
    ) -> Result<u64>;

    /// All rows for a window, most recently analyzed first.
    async fn load_results(&self, window_start: NaiveDate) -> Result<Vec<StoredAnalysis>>;

    /// Windows with persisted results, most recent first.
    async fn list_windows(&self) -> Result<Vec<WindowSummary>>;

    /// Identifiers already analyzed in a window (the checkpoint read path).
    async fn analyzed_ids(&self, window_start: NaiveDate) -> Result<HashSet<String>>;
}
