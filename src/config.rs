//! Application configuration.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides. Variables prefixed with `PARLEY_` override YAML values; nested
//! fields use double underscores (`PARLEY_LLM__RATE_LIMIT_RPM=120` sets
//! `llm.rate_limit_rpm`). All fields have defaults, so an empty file (or no
//! file at all) yields a working configuration for local development.

use std::path::Path;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::analyzer::CostModel;
use crate::error::Result;

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "parley.yaml";

/// Root configuration for the analytics pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub llm: LlmSettings,
    pub cache: CacheSettings,
    pub database: DatabaseSettings,
    pub pipeline: PipelineSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            llm: LlmSettings::default(),
            cache: CacheSettings::default(),
            database: DatabaseSettings::default(),
            pipeline: PipelineSettings::default(),
        }
    }
}

impl Settings {
    /// Load configuration from the given YAML file (or `parley.yaml` when
    /// `None`) merged with `PARLEY_`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE).to_path_buf());

        let settings: Settings = Figment::new()
            .merge(Yaml::file(file))
            .merge(Env::prefixed("PARLEY_").split("__"))
            .extract()
            .map_err(|e| anyhow::anyhow!("failed to load configuration: {e}"))?;

        Ok(settings)
    }
}

/// LLM endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    /// API key for the text-generation service. Required for the HTTP client.
    pub api_key: Option<String>,
    /// Base URL of the endpoint (e.g., "https://api.openai.com")
    pub endpoint: String,
    /// Path of the completion route
    pub path: String,
    /// Model identifier sent with every request
    pub model: String,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
    /// Outbound request ceiling per rolling 60-second window
    pub rate_limit_rpm: usize,
    /// Token pricing used for per-chat cost estimates
    pub cost: CostModel,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: "https://api.openai.com".to_string(),
            path: "/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 60,
            // 80% of a 300 RPM quota, leaving headroom for other consumers
            rate_limit_rpm: 240,
            cost: CostModel::default(),
        }
    }
}

/// Response cache configuration.
///
/// When `redis_url` is set the cache is backed by Redis; otherwise an
/// in-process cache is used. Setting `enabled: false` disables caching
/// entirely (every analysis is a fresh paid call).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub redis_url: Option<String>,
    /// Time-to-live for cached analyses. Qualitative content about a finished
    /// chat does not change, so this is measured in days.
    pub ttl_secs: u64,
    /// Entry cap for the in-process backend
    pub max_entries: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: None,
            ttl_secs: 7 * 24 * 3600,
            max_entries: 50_000,
        }
    }
}

/// Result store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseSettings {
    /// PostgreSQL connection URL. `None` means persistence is not configured
    /// and callers must supply their own store.
    pub url: Option<String>,
    pub max_connections: Option<u32>,
}

/// Batch pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Maximum simultaneous in-flight chat analyses
    pub concurrency: usize,
    /// Rows per storage write
    pub chunk_size: usize,
    /// Skip chats already analyzed in the current window
    pub checkpoint_enabled: bool,
    /// Page size used when pulling chats from a paginated source
    pub page_size: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            concurrency: 8,
            chunk_size: 500,
            checkpoint_enabled: true,
            page_size: 1000,
        }
    }
}
