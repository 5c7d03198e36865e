//! Report aggregation over persisted analysis rows.
//!
//! Pure folds producing the summary structures the dashboard renders:
//! agent ranking, sentiment distribution, sales funnel, loss reasons, and
//! product mentions.

use std::collections::HashMap;

use serde::Serialize;

use crate::storage::StoredAnalysis;

/// Per-agent qualitative summary.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub agent: String,
    pub chats: u64,
    pub avg_humanization: f64,
    pub avg_nps: f64,
}

/// Customer-experience distribution across a window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SentimentBreakdown {
    pub positive: u64,
    pub neutral: u64,
    pub negative: u64,
    pub avg_humanization: f64,
    pub avg_nps: f64,
}

/// Sales funnel outcome counts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FunnelSummary {
    pub outcomes: HashMap<String, u64>,
    pub stages: HashMap<String, u64>,
    /// Percentage of outcomes that converted
    pub conversion_rate: f64,
}

/// Aggregated view of one analysis window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WeeklyReport {
    pub total_analyzed: u64,
    pub agent_ranking: Vec<AgentSummary>,
    pub sentiment: SentimentBreakdown,
    pub funnel: FunnelSummary,
    /// Most-mentioned products, descending, capped at ten
    pub top_products: Vec<(String, u64)>,
    pub total_product_mentions: u64,
    /// Rejection reasons among lost chats, descending
    pub loss_reasons: Vec<(String, u64)>,
}

/// Fold persisted rows into the weekly report.
pub fn build_report(rows: &[StoredAnalysis]) -> WeeklyReport {
    let mut report = WeeklyReport {
        total_analyzed: rows.len() as u64,
        ..WeeklyReport::default()
    };

    // Sentiment and score means
    let mut humanization_sum = 0u64;
    let mut humanization_count = 0u64;
    let mut nps_sum = 0u64;
    let mut nps_count = 0u64;

    struct AgentAcc {
        chats: u64,
        humanization_sum: u64,
        humanization_count: u64,
        nps_sum: u64,
        nps_count: u64,
    }
    let mut agents: HashMap<String, AgentAcc> = HashMap::new();

    let mut product_counts: HashMap<String, u64> = HashMap::new();
    let mut loss_counts: HashMap<String, u64> = HashMap::new();
    let mut converted = 0u64;
    let mut outcome_total = 0u64;

    for row in rows {
        match row.cx_sentiment.as_deref() {
            Some("positive") => report.sentiment.positive += 1,
            Some("neutral") => report.sentiment.neutral += 1,
            Some("negative") => report.sentiment.negative += 1,
            _ => {}
        }

        if let Some(score) = row.cx_humanization_score {
            humanization_sum += score.max(0) as u64;
            humanization_count += 1;
        }
        if let Some(nps) = row.cx_nps_prediction {
            nps_sum += nps.max(0) as u64;
            nps_count += 1;
        }

        let agent = row.agent_name.clone().unwrap_or_else(|| "Unassigned".to_string());
        let acc = agents.entry(agent).or_insert(AgentAcc {
            chats: 0,
            humanization_sum: 0,
            humanization_count: 0,
            nps_sum: 0,
            nps_count: 0,
        });
        acc.chats += 1;
        if let Some(score) = row.cx_humanization_score {
            acc.humanization_sum += score.max(0) as u64;
            acc.humanization_count += 1;
        }
        if let Some(nps) = row.cx_nps_prediction {
            acc.nps_sum += nps.max(0) as u64;
            acc.nps_count += 1;
        }

        if let Some(names) = &row.product_names {
            for name in names {
                *product_counts.entry(name.clone()).or_insert(0) += 1;
                report.total_product_mentions += 1;
            }
        }

        if let Some(outcome) = &row.sales_outcome {
            outcome_total += 1;
            *report.funnel.outcomes.entry(outcome.clone()).or_insert(0) += 1;
            if outcome == "converted" {
                converted += 1;
            }
            if outcome == "lost" {
                if let Some(reason) = &row.sales_rejection_reason {
                    *loss_counts.entry(reason.clone()).or_insert(0) += 1;
                }
            }
        }
        if let Some(stage) = &row.sales_funnel_stage {
            *report.funnel.stages.entry(stage.clone()).or_insert(0) += 1;
        }
    }

    report.sentiment.avg_humanization = mean(humanization_sum, humanization_count);
    report.sentiment.avg_nps = mean(nps_sum, nps_count);
    report.funnel.conversion_rate = if outcome_total > 0 {
        converted as f64 / outcome_total as f64 * 100.0
    } else {
        0.0
    };

    report.agent_ranking = agents
        .into_iter()
        .map(|(agent, acc)| AgentSummary {
            agent,
            chats: acc.chats,
            avg_humanization: mean(acc.humanization_sum, acc.humanization_count),
            avg_nps: mean(acc.nps_sum, acc.nps_count),
        })
        .collect();
    // Busiest agents first; ties broken by name for stable output
    report.agent_ranking.sort_by(|a, b| {
        b.chats.cmp(&a.chats).then_with(|| a.agent.cmp(&b.agent))
    });

    report.top_products = top_n(product_counts, 10);
    report.loss_reasons = top_n(loss_counts, usize::MAX);

    report
}

fn mean(sum: u64, count: u64) -> f64 {
    if count > 0 {
        sum as f64 / count as f64
    } else {
        0.0
    }
}

fn top_n(counts: HashMap<String, u64>, n: usize) -> Vec<(String, u64)> {
    let mut entries: Vec<(String, u64)> = counts.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(n);
    entries
}
