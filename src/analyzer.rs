//! Qualitative analyzer: turns a chat transcript into four structured
//! analyses via an external text-generation call, with caching, rate
//! limiting, schema validation, and one stricter retry per axis.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::cache::{fingerprint, ResponseCache};
use crate::chat::Chat;
use crate::config::LlmSettings;
use crate::error::{ParleyError, Result};
use crate::llm::analysis::{
    parse_axis, prompt_for, retry_prompt_for, AxisSchema, ChatAnalysis, CustomerExperience,
    ProductInterest, QualityAssurance, SalesFunnel,
};
use crate::llm::client::LlmClient;
use crate::rate::RateBudget;

/// Token pricing used to estimate the cost of each analyzed chat.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    /// USD per million prompt tokens
    pub input_per_1m: f64,
    /// USD per million completion tokens
    pub output_per_1m: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            input_per_1m: 0.075,
            output_per_1m: 0.30,
        }
    }
}

impl CostModel {
    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 / 1_000_000.0) * self.input_per_1m
            + (completion_tokens as f64 / 1_000_000.0) * self.output_per_1m
    }
}

/// One analyzed chat, ready for persistence.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRecord {
    pub chat_id: String,
    pub agent_name: Option<String>,
    pub tags: Vec<String>,
    pub analysis: ChatAnalysis,
    pub analyzed_at: DateTime<Utc>,
    pub processing_ms: u64,
    pub model: String,
    pub cost_usd: f64,
    pub cache_hit: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct AxisUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Runs the four-axis analysis for one chat at a time.
///
/// Shared state is limited to the cache and the rate budget, both safe under
/// concurrent use; the analyzer itself is freely shareable behind an `Arc`.
pub struct Analyzer<C: LlmClient> {
    client: C,
    cache: Arc<dyn ResponseCache>,
    budget: Arc<RateBudget>,
    model: String,
    cost_model: CostModel,
    cache_ttl: Duration,
}

impl<C: LlmClient> Analyzer<C> {
    pub fn new(
        client: C,
        cache: Arc<dyn ResponseCache>,
        budget: Arc<RateBudget>,
        settings: &LlmSettings,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            client,
            cache,
            budget,
            model: settings.model.clone(),
            cost_model: settings.cost,
            cache_ttl,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Analyze one chat across all four axes.
    ///
    /// On a cache hit the external service is not called and no rate budget
    /// is consumed. On a miss the four axis requests run concurrently, each
    /// acquiring budget per attempt (retries included), and exactly one cache
    /// write happens before returning.
    #[tracing::instrument(skip(self, chat), fields(chat_id = %chat.id))]
    pub async fn analyze_chat(&self, chat: &Chat) -> Result<AnalysisRecord> {
        let started = Instant::now();

        let transcript = chat.transcript();
        if transcript.trim().is_empty() {
            return Err(ParleyError::EmptyChat(chat.id.clone()));
        }

        let key = fingerprint(&transcript, "full", &self.model);

        // Cache errors degrade to a miss; never fail the chat over them
        match self.cache.get(&key).await {
            Ok(Some(analysis)) => {
                let elapsed = started.elapsed().as_millis() as u64;
                tracing::info!(elapsed_ms = elapsed, "cache hit");
                return Ok(self.record(chat, analysis, elapsed, 0.0, true));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "cache get failed, treating as miss");
            }
        }

        let (cx, product, sales, qa) = tokio::try_join!(
            self.fetch_axis::<CustomerExperience>(&transcript),
            self.fetch_axis::<ProductInterest>(&transcript),
            self.fetch_axis::<SalesFunnel>(&transcript),
            self.fetch_axis::<QualityAssurance>(&transcript),
        )?;

        let usage = [cx.1, product.1, sales.1, qa.1]
            .iter()
            .fold(AxisUsage::default(), |acc, u| AxisUsage {
                prompt_tokens: acc.prompt_tokens + u.prompt_tokens,
                completion_tokens: acc.completion_tokens + u.completion_tokens,
            });
        let cost = self
            .cost_model
            .cost(usage.prompt_tokens, usage.completion_tokens);

        let analysis = ChatAnalysis {
            cx: cx.0,
            product: product.0,
            sales: sales.0,
            qa: qa.0,
        };

        if let Err(e) = self.cache.set(&key, &analysis, self.cache_ttl).await {
            tracing::warn!(error = %e, "cache set failed");
        }

        let elapsed = started.elapsed().as_millis() as u64;
        tracing::info!(
            elapsed_ms = elapsed,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "chat analyzed"
        );

        Ok(self.record(chat, analysis, elapsed, cost, false))
    }

    fn record(
        &self,
        chat: &Chat,
        analysis: ChatAnalysis,
        processing_ms: u64,
        cost_usd: f64,
        cache_hit: bool,
    ) -> AnalysisRecord {
        AnalysisRecord {
            chat_id: chat.id.clone(),
            agent_name: chat.agent_name().map(str::to_string),
            tags: chat.tag_names(),
            analysis,
            analyzed_at: Utc::now(),
            processing_ms,
            model: self.model.clone(),
            cost_usd,
            cache_hit,
        }
    }

    /// Fetch and validate one axis, retrying once with a stricter re-prompt
    /// on schema violations.
    async fn fetch_axis<T: AxisSchema>(&self, transcript: &str) -> Result<(T, AxisUsage)> {
        self.budget.acquire().await;
        let completion = self.client.complete(&prompt_for(T::KIND, transcript)).await?;
        let mut usage = AxisUsage {
            prompt_tokens: completion.prompt_tokens,
            completion_tokens: completion.completion_tokens,
        };

        let violations = match parse_axis::<T>(&completion.text) {
            Ok(value) => return Ok((value, usage)),
            Err(violations) => violations,
        };

        tracing::warn!(
            kind = %T::KIND,
            violations = ?violations,
            "schema validation failed, re-prompting"
        );

        self.budget.acquire().await;
        let retry = self
            .client
            .complete(&retry_prompt_for(T::KIND, transcript))
            .await?;
        usage.prompt_tokens += retry.prompt_tokens;
        usage.completion_tokens += retry.completion_tokens;

        match parse_axis::<T>(&retry.text) {
            Ok(value) => Ok((value, usage)),
            Err(violations) => Err(ParleyError::SchemaValidation {
                kind: T::KIND,
                violations,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, NoopCache};
    use crate::chat::test_fixtures::{chat_with_messages, sample_chat};
    use crate::llm::analysis::test_fixtures::{stub_valid_axes, CX_JSON};
    use crate::llm::client::{Completion, MockLlmClient};

    fn analyzer_with(
        mock: MockLlmClient,
        cache: Arc<dyn ResponseCache>,
        budget: Arc<RateBudget>,
    ) -> Analyzer<MockLlmClient> {
        Analyzer::new(
            mock,
            cache,
            budget,
            &LlmSettings::default(),
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn test_analyze_chat_issues_four_calls() {
        let mock = MockLlmClient::new();
        stub_valid_axes(&mock);
        let budget = Arc::new(RateBudget::new(1000));
        let analyzer = analyzer_with(mock.clone(), Arc::new(NoopCache), budget.clone());

        let record = analyzer.analyze_chat(&sample_chat("chat-1")).await.unwrap();

        assert_eq!(mock.call_count(), 4);
        assert_eq!(budget.granted(), 4);
        assert!(!record.cache_hit);
        assert_eq!(record.chat_id, "chat-1");
        assert_eq!(record.agent_name.as_deref(), Some("Ana"));
        assert!(record.cost_usd > 0.0);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_calls_and_budget() {
        let mock = MockLlmClient::new();
        stub_valid_axes(&mock);
        let budget = Arc::new(RateBudget::new(1000));
        let cache: Arc<dyn ResponseCache> =
            Arc::new(MemoryCache::new(100, Duration::from_secs(3600)));
        let analyzer = analyzer_with(mock.clone(), cache, budget.clone());

        let chat = sample_chat("chat-1");
        let first = analyzer.analyze_chat(&chat).await.unwrap();
        assert!(!first.cache_hit);
        assert_eq!(budget.granted(), 4);

        let second = analyzer.analyze_chat(&chat).await.unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.cost_usd, 0.0);
        // No new external calls, no new budget grants
        assert_eq!(mock.call_count(), 4);
        assert_eq!(budget.granted(), 4);

        // Identical structured result both times
        assert_eq!(
            serde_json::to_value(&first.analysis).unwrap(),
            serde_json::to_value(&second.analysis).unwrap()
        );
    }

    #[tokio::test]
    async fn test_retry_recovers_from_one_bad_response() {
        let mock = MockLlmClient::new();
        stub_valid_axes(&mock);
        // First CX response is malformed; the sticky valid payload serves the retry
        mock.add_response(
            "customer-experience analyst",
            Ok(Completion {
                text: "this is not json".to_string(),
                prompt_tokens: 10,
                completion_tokens: 5,
            }),
        );
        let budget = Arc::new(RateBudget::new(1000));
        let analyzer = analyzer_with(mock.clone(), Arc::new(NoopCache), budget.clone());

        let record = analyzer.analyze_chat(&sample_chat("chat-1")).await.unwrap();
        assert!(!record.cache_hit);
        // 4 first attempts + 1 retry
        assert_eq!(mock.call_count(), 5);
        assert_eq!(budget.granted(), 5);
        // Retry prompt was the stricter variant
        assert!(mock
            .calls()
            .iter()
            .any(|p| p.contains("previous reply did not match")));
    }

    #[tokio::test]
    async fn test_two_bad_responses_surface_schema_error() {
        let mock = MockLlmClient::new();
        stub_valid_axes(&mock);
        mock.add_response(
            "sales analyst",
            Ok(Completion {
                text: r#"{"funnel_stage": "daydreaming"}"#.to_string(),
                prompt_tokens: 10,
                completion_tokens: 5,
            }),
        );
        mock.add_response(
            "sales analyst",
            Ok(Completion {
                text: r#"{"still": "wrong"}"#.to_string(),
                prompt_tokens: 10,
                completion_tokens: 5,
            }),
        );
        let analyzer = analyzer_with(
            mock.clone(),
            Arc::new(NoopCache),
            Arc::new(RateBudget::new(1000)),
        );

        let err = analyzer
            .analyze_chat(&sample_chat("chat-1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ParleyError::SchemaValidation {
                kind: crate::llm::analysis::AnalysisKind::SalesFunnel,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_empty_chat_is_rejected_without_calls() {
        let mock = MockLlmClient::new();
        let budget = Arc::new(RateBudget::new(1000));
        let analyzer = analyzer_with(mock.clone(), Arc::new(NoopCache), budget.clone());

        let err = analyzer
            .analyze_chat(&chat_with_messages("chat-empty", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::EmptyChat(id) if id == "chat-empty"));
        assert_eq!(mock.call_count(), 0);
        assert_eq!(budget.granted(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_propagates() {
        let mock = MockLlmClient::new();
        stub_valid_axes(&mock);
        mock.add_response(
            "product analyst",
            Err(ParleyError::Transient("connection reset".to_string())),
        );
        let analyzer = analyzer_with(
            mock.clone(),
            Arc::new(NoopCache),
            Arc::new(RateBudget::new(1000)),
        );

        let err = analyzer
            .analyze_chat(&sample_chat("chat-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::Transient(_)));
    }

    #[tokio::test]
    async fn test_exactly_one_cache_write_per_miss() {
        // A failing second analysis must not overwrite the cached entry: the
        // cached value survives and the third call hits it.
        let mock = MockLlmClient::new();
        stub_valid_axes(&mock);
        let cache: Arc<dyn ResponseCache> =
            Arc::new(MemoryCache::new(100, Duration::from_secs(3600)));
        let analyzer = analyzer_with(mock.clone(), cache.clone(), Arc::new(RateBudget::new(1000)));

        let chat = sample_chat("chat-1");
        let transcript = chat.transcript();
        let key = fingerprint(&transcript, "full", analyzer.model());

        assert!(cache.get(&key).await.unwrap().is_none());
        analyzer.analyze_chat(&chat).await.unwrap();
        assert!(cache.get(&key).await.unwrap().is_some());
    }

    #[test]
    fn test_cost_model_arithmetic() {
        let model = CostModel {
            input_per_1m: 0.075,
            output_per_1m: 0.30,
        };
        let cost = model.cost(1_000_000, 1_000_000);
        assert!((cost - 0.375).abs() < 1e-9);
        assert_eq!(model.cost(0, 0), 0.0);
    }

    #[tokio::test]
    async fn test_cache_error_degrades_to_miss() {
        struct FailingCache;

        #[async_trait::async_trait]
        impl ResponseCache for FailingCache {
            async fn get(&self, _key: &str) -> crate::error::Result<Option<ChatAnalysis>> {
                Err(ParleyError::CacheUnavailable("boom".to_string()))
            }
            async fn set(
                &self,
                _key: &str,
                _value: &ChatAnalysis,
                _ttl: Duration,
            ) -> crate::error::Result<()> {
                Err(ParleyError::CacheUnavailable("boom".to_string()))
            }
        }

        let mock = MockLlmClient::new();
        stub_valid_axes(&mock);
        let analyzer = analyzer_with(
            mock.clone(),
            Arc::new(FailingCache),
            Arc::new(RateBudget::new(1000)),
        );

        // Cache failures are logged and ignored; the analysis succeeds
        let record = analyzer.analyze_chat(&sample_chat("chat-1")).await.unwrap();
        assert!(!record.cache_hit);
        assert_eq!(mock.call_count(), 4);
        // CX_JSON sanity: the parsed analysis carries through
        assert!(CX_JSON.contains("neutral"));
        assert_eq!(record.analysis.cx.humanization_score, 4);
    }
}
