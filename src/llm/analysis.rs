//! Per-axis analysis schemas, prompts, and response validation.
//!
//! Every chat is analyzed along four independent axes. Each axis has a fixed
//! JSON schema; model output is parsed and range-checked here, and a
//! violation list (rather than a panic or a silent default) is handed back to
//! the analyzer, which retries once with a stricter re-prompt.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// The four analysis axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    CustomerExperience,
    ProductInterest,
    SalesFunnel,
    QualityAssurance,
}

impl AnalysisKind {
    /// Short key used in cache fingerprints and log fields.
    pub fn key(self) -> &'static str {
        match self {
            Self::CustomerExperience => "cx",
            Self::ProductInterest => "product",
            Self::SalesFunnel => "sales",
            Self::QualityAssurance => "qa",
        }
    }
}

impl std::fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::CustomerExperience => "customer_experience",
            Self::ProductInterest => "product_interest",
            Self::SalesFunnel => "sales_funnel",
            Self::QualityAssurance => "quality_assurance",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::Negative => "negative",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Resolved,
    Unresolved,
    Pending,
}

impl ResolutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::Unresolved => "unresolved",
            Self::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterestLevel {
    High,
    Medium,
    Low,
}

impl InterestLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunnelStage {
    Qualification,
    Presentation,
    Negotiation,
    Closing,
}

impl FunnelStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Qualification => "qualification",
            Self::Presentation => "presentation",
            Self::Negotiation => "negotiation",
            Self::Closing => "closing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SalesOutcome {
    Converted,
    Lost,
    InProgress,
}

impl SalesOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Converted => "converted",
            Self::Lost => "lost",
            Self::InProgress => "in_progress",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrgencyLevel {
    High,
    Medium,
    Low,
}

impl UrgencyLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseTimeQuality {
    Fast,
    Adequate,
    Slow,
}

impl ResponseTimeQuality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Adequate => "adequate",
            Self::Slow => "slow",
        }
    }
}

/// Schema contract implemented by each axis payload.
pub trait AxisSchema: DeserializeOwned + Serialize + Send {
    const KIND: AnalysisKind;

    /// Range checks serde cannot express. Returns human-readable violations.
    fn validate(&self) -> Vec<String>;
}

/// Customer-experience analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerExperience {
    pub sentiment: Sentiment,
    /// 1 (robotic) to 5 (very humanized)
    pub humanization_score: u8,
    /// 0 to 10
    pub nps_prediction: u8,
    pub resolution_status: ResolutionStatus,
    pub personalization_used: bool,
    pub satisfaction_comment: String,
}

impl AxisSchema for CustomerExperience {
    const KIND: AnalysisKind = AnalysisKind::CustomerExperience;

    fn validate(&self) -> Vec<String> {
        let mut violations = Vec::new();
        if !(1..=5).contains(&self.humanization_score) {
            violations.push(format!(
                "humanization_score {} outside 1..=5",
                self.humanization_score
            ));
        }
        if self.nps_prediction > 10 {
            violations.push(format!("nps_prediction {} outside 0..=10", self.nps_prediction));
        }
        violations
    }
}

/// Product-interest analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductInterest {
    #[serde(default)]
    pub products_mentioned: Vec<String>,
    pub category: String,
    pub interest_level: InterestLevel,
    pub budget_mentioned: bool,
    #[serde(default)]
    pub trends: Vec<String>,
}

impl AxisSchema for ProductInterest {
    const KIND: AnalysisKind = AnalysisKind::ProductInterest;

    fn validate(&self) -> Vec<String> {
        let mut violations = Vec::new();
        if self.category.trim().is_empty() {
            violations.push("category must not be empty".to_string());
        }
        violations
    }
}

/// Sales-funnel analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SalesFunnel {
    pub funnel_stage: FunnelStage,
    pub outcome: SalesOutcome,
    pub lead_type: String,
    #[serde(default)]
    pub rejection_reason: Option<String>,
    pub next_step: String,
    pub urgency: UrgencyLevel,
}

impl AxisSchema for SalesFunnel {
    const KIND: AnalysisKind = AnalysisKind::SalesFunnel;

    fn validate(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Quality-assurance analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityAssurance {
    pub script_adherence: bool,
    #[serde(default)]
    pub questions_asked: Vec<String>,
    #[serde(default)]
    pub questions_missing: Vec<String>,
    pub response_time_quality: ResponseTimeQuality,
    #[serde(default)]
    pub improvement_areas: Vec<String>,
    /// 1 to 5
    pub overall_score: u8,
}

impl AxisSchema for QualityAssurance {
    const KIND: AnalysisKind = AnalysisKind::QualityAssurance;

    fn validate(&self) -> Vec<String> {
        let mut violations = Vec::new();
        if !(1..=5).contains(&self.overall_score) {
            violations.push(format!("overall_score {} outside 1..=5", self.overall_score));
        }
        violations
    }
}

/// The combined result of all four analyses for one chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatAnalysis {
    pub cx: CustomerExperience,
    pub product: ProductInterest,
    pub sales: SalesFunnel,
    pub qa: QualityAssurance,
}

// ============================================================================
// Prompts
// ============================================================================

const CX_FIELDS: &str = r#"- sentiment: "positive", "neutral" or "negative"
- humanization_score: integer from 1 (robotic) to 5 (very humanized)
- nps_prediction: integer from 0 to 10 (likelihood to recommend)
- resolution_status: "resolved", "unresolved" or "pending"
- personalization_used: boolean (used the customer's name or tailored the approach)
- satisfaction_comment: brief explanation of the sentiment"#;

const PRODUCT_FIELDS: &str = r#"- products_mentioned: list of products/technologies mentioned (empty list if none)
- category: identified product category, or "undefined" when none applies
- interest_level: "high", "medium" or "low"
- budget_mentioned: boolean (customer mentioned budget or price)
- trends: list of specific customer needs or questions"#;

const SALES_FIELDS: &str = r#"- funnel_stage: "qualification", "presentation", "negotiation" or "closing"
- outcome: "converted", "lost" or "in_progress"
- lead_type: kind of customer identified, or "undefined"
- rejection_reason: if lost, the main reason (otherwise null)
- next_step: recommended next action item
- urgency: "high", "medium" or "low""#;

const QA_FIELDS: &str = r#"- script_adherence: boolean (did the agent follow the qualification script?)
- questions_asked: list of the key questions that were asked
- questions_missing: list of the key questions that were NOT asked
- response_time_quality: "fast", "adequate" or "slow"
- improvement_areas: list of improvement suggestions for the agent
- overall_score: integer from 1 to 5 (overall service grade)"#;

fn role_and_brief(kind: AnalysisKind) -> (&'static str, &'static str, &'static str) {
    match kind {
        AnalysisKind::CustomerExperience => (
            "customer-experience analyst",
            "Assess the conversation from the customer's point of view: \
personalization, empathy, whether the customer's questions were answered, \
and overall professionalism.",
            CX_FIELDS,
        ),
        AnalysisKind::ProductInterest => (
            "product analyst",
            "Identify product interest and emerging trends in the conversation. \
If no products are mentioned, use category \"undefined\" and an empty product list.",
            PRODUCT_FIELDS,
        ),
        AnalysisKind::SalesFunnel => (
            "sales analyst",
            "Evaluate how far the conversation progressed through the sales \
funnel and what the outcome was.",
            SALES_FIELDS,
        ),
        AnalysisKind::QualityAssurance => (
            "quality-assurance analyst",
            "Evaluate whether the agent followed the qualification script: \
area of interest, customer profile, location, current situation, budget, \
and decision timeline.",
            QA_FIELDS,
        ),
    }
}

/// Build the instruction prompt for one axis.
pub fn prompt_for(kind: AnalysisKind, transcript: &str) -> String {
    let (role, brief, fields) = role_and_brief(kind);
    format!(
        "You are a {role} for a sales-driven support team.\n{brief}\n\n\
Return a JSON object with exactly these fields:\n{fields}\n\n\
Transcript:\n{transcript}"
    )
}

/// Stricter re-prompt used after a schema-validation failure.
pub fn retry_prompt_for(kind: AnalysisKind, transcript: &str) -> String {
    let (role, _, fields) = role_and_brief(kind);
    format!(
        "You are a {role} for a sales-driven support team.\n\
Your previous reply did not match the required schema. Respond with ONLY a \
single JSON object, no prose and no code fences, containing exactly these \
fields with the exact types and allowed values listed:\n{fields}\n\n\
Transcript:\n{transcript}"
    )
}

// ============================================================================
// Parsing
// ============================================================================

/// Remove markdown code fences some models wrap around JSON output.
pub fn strip_code_fences(text: &str) -> &str {
    let mut t = text.trim();
    if let Some(rest) = t.strip_prefix("```json") {
        t = rest;
    } else if let Some(rest) = t.strip_prefix("```") {
        t = rest;
    }
    if let Some(rest) = t.strip_suffix("```") {
        t = rest;
    }
    t.trim()
}

/// Parse and range-check one axis payload. On failure, returns the violation
/// list the analyzer reports (and retries on).
pub fn parse_axis<T: AxisSchema>(raw: &str) -> std::result::Result<T, Vec<String>> {
    let text = strip_code_fences(raw);
    let value: T =
        serde_json::from_str(text).map_err(|e| vec![format!("malformed payload: {e}")])?;
    let violations = value.validate();
    if violations.is_empty() {
        Ok(value)
    } else {
        Err(violations)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_cx_payload() {
        let cx: CustomerExperience = parse_axis(test_fixtures::CX_JSON).unwrap();
        assert_eq!(cx.sentiment, Sentiment::Neutral);
        assert_eq!(cx.humanization_score, 4);
        assert_eq!(cx.resolution_status, ResolutionStatus::Resolved);
    }

    #[test]
    fn test_parse_strips_code_fences() {
        let fenced = format!("```json\n{}\n```", test_fixtures::SALES_JSON);
        let sales: SalesFunnel = parse_axis(&fenced).unwrap();
        assert_eq!(sales.funnel_stage, FunnelStage::Presentation);
        assert_eq!(sales.outcome, SalesOutcome::InProgress);
        assert!(sales.rejection_reason.is_none());
    }

    #[test]
    fn test_out_of_range_score_is_a_violation() {
        let raw = r#"{
            "sentiment": "positive",
            "humanization_score": 9,
            "nps_prediction": 8,
            "resolution_status": "resolved",
            "personalization_used": false,
            "satisfaction_comment": "fine"
        }"#;
        let violations = parse_axis::<CustomerExperience>(raw).unwrap_err();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("humanization_score 9"));
    }

    #[test]
    fn test_missing_field_is_a_violation() {
        let raw = r#"{"funnel_stage": "closing"}"#;
        let violations = parse_axis::<SalesFunnel>(raw).unwrap_err();
        assert!(violations[0].contains("malformed payload"));
    }

    #[test]
    fn test_unknown_enum_value_is_a_violation() {
        let raw = r#"{
            "funnel_stage": "daydreaming",
            "outcome": "in_progress",
            "lead_type": "clinic",
            "next_step": "call",
            "urgency": "low"
        }"#;
        assert!(parse_axis::<SalesFunnel>(raw).is_err());
    }

    #[test]
    fn test_optional_lists_default_to_empty() {
        let raw = r#"{
            "script_adherence": false,
            "response_time_quality": "slow",
            "overall_score": 2
        }"#;
        let qa: QualityAssurance = parse_axis(raw).unwrap();
        assert!(qa.questions_asked.is_empty());
        assert!(qa.improvement_areas.is_empty());
    }

    #[test]
    fn test_prompts_carry_transcript_and_role() {
        let prompt = prompt_for(AnalysisKind::SalesFunnel, "Customer (10:00): hi");
        assert!(prompt.contains("sales analyst"));
        assert!(prompt.contains("Customer (10:00): hi"));

        let retry = retry_prompt_for(AnalysisKind::SalesFunnel, "Customer (10:00): hi");
        assert!(retry.contains("sales analyst"));
        assert!(retry.contains("previous reply did not match"));
    }

    #[test]
    fn test_chat_analysis_round_trips_through_json() {
        let analysis = ChatAnalysis {
            cx: parse_axis(test_fixtures::CX_JSON).unwrap(),
            product: parse_axis(test_fixtures::PRODUCT_JSON).unwrap(),
            sales: parse_axis(test_fixtures::SALES_JSON).unwrap(),
            qa: parse_axis(test_fixtures::QA_JSON).unwrap(),
        };
        let encoded = serde_json::to_string(&analysis).unwrap();
        let decoded: ChatAnalysis = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.cx.sentiment, Sentiment::Neutral);
        assert_eq!(decoded.product.products_mentioned.len(), 2);
    }
}
