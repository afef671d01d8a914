//! Process configuration.
//!
//! [`Settings`] collects credentials, model choices and tuning for the
//! three provider bindings (chat, research, insight) plus the pipeline
//! itself. Load it from the environment with [`Settings::from_env`] or,
//! with the `yaml` feature, from a YAML document. Every field has a
//! default except the API keys.

use crate::analysis::ProductAnalyzer;
use crate::backend::anthropic::ANTHROPIC_BASE_URL;
use crate::backend::BackoffConfig;
use crate::cache::RawOutputCache;
use crate::client::LlmConfig;
use crate::error::Result;
use crate::insight::InsightExtractor;
use crate::orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorConfig};
use crate::parsing;
use crate::provider::{
    Provider, DEFAULT_CHAT_MODEL, DEFAULT_INSIGHT_MODEL, DEFAULT_RESEARCH_MODEL, PERPLEXITY_BASE_URL,
};
use crate::registry::StageRegistry;
use crate::stage::ProviderKind;
use crate::PipelineError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// One provider binding. Unset fields fall back to per-binding defaults.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub timeout_secs: Option<u64>,
}

impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("api_key", &self.api_key.as_deref().map(parsing::redact_key))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("top_p", &self.top_p)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl ProviderSettings {
    fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty())
    }

    fn llm_config(&self, base: LlmConfig) -> LlmConfig {
        LlmConfig {
            temperature: self.temperature.unwrap_or(base.temperature),
            max_tokens: self.max_tokens.unwrap_or(base.max_tokens),
            top_p: self.top_p.or(base.top_p),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsightSettings {
    pub enabled: bool,
    /// Cheaper model used for insights. Shares the chat key and endpoint.
    pub model: String,
    pub timeout_secs: u64,
    pub max_concurrent: usize,
}

impl Default for InsightSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            model: DEFAULT_INSIGHT_MODEL.to_string(),
            timeout_secs: 30,
            max_concurrent: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    /// Delay before each retry; the last one repeats.
    pub delays_secs: Vec<f64>,
}

/// Longest retry delay accepted from configuration.
const MAX_RETRY_DELAY_SECS: f64 = 3600.0;

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delays_secs: vec![2.0, 5.0, 10.0],
        }
    }
}

impl RetrySettings {
    pub fn backoff(&self) -> BackoffConfig {
        let schedule: Vec<Duration> = self
            .delays_secs
            .iter()
            .map(|s| {
                Duration::try_from_secs_f64(s.clamp(0.0, MAX_RETRY_DELAY_SECS))
                    .unwrap_or(Duration::ZERO)
            })
            .collect();
        let max_delay = schedule.iter().copied().max().unwrap_or(Duration::ZERO);
        BackoffConfig {
            schedule,
            max_delay,
            ..BackoffConfig::canonical()
        }
        .with_max_retries(self.max_retries)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub min_idea_chars: usize,
    pub heartbeat_secs: u64,
    pub max_heartbeats_per_stage: u32,
    pub channel_capacity: usize,
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        let run = OrchestratorConfig::default();
        Self {
            min_idea_chars: run.min_idea_chars,
            heartbeat_secs: run.heartbeat_interval.as_secs(),
            max_heartbeats_per_stage: run.max_heartbeats_per_stage,
            channel_capacity: run.channel_capacity,
            cache_ttl_secs: crate::cache::DEFAULT_TTL.as_secs(),
            cache_max_entries: crate::cache::DEFAULT_MAX_ENTRIES,
        }
    }
}

/// Complete process configuration.
///
/// # Example
///
/// ```
/// use prfaq_pipeline::config::Settings;
///
/// let settings = Settings::from_lookup(|key| match key {
///     "ANTHROPIC_API_KEY" => Some("sk-ant-test".to_string()),
///     "PERPLEXITY_API_KEY" => Some("pplx-test".to_string()),
///     _ => None,
/// })
/// .unwrap();
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub chat: ProviderSettings,
    pub research: ProviderSettings,
    pub insight: InsightSettings,
    pub retry: RetrySettings,
    pub pipeline: PipelineSettings,
}

fn parse_var<T: FromStr>(key: &str, value: Option<String>) -> Result<Option<T>> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| PipelineError::InvalidConfig(format!("{} is not a valid value: '{}'", key, raw))),
    }
}

impl Settings {
    /// Read settings from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();
        settings.apply_lookup(&lookup)?;
        Ok(settings)
    }

    /// Overlay environment variables on top of the current values.
    pub fn apply_lookup<F>(&mut self, lookup: &F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = string("ANTHROPIC_API_KEY") {
            self.chat.api_key = Some(v);
        }
        if let Some(v) = string("ANTHROPIC_BASE_URL") {
            self.chat.base_url = Some(v);
        }
        if let Some(v) = string("PRFAQ_CHAT_MODEL") {
            self.chat.model = Some(v);
        }
        if let Some(v) = string("PERPLEXITY_API_KEY") {
            self.research.api_key = Some(v);
        }
        if let Some(v) = string("PERPLEXITY_BASE_URL") {
            self.research.base_url = Some(v);
        }
        if let Some(v) = string("PRFAQ_RESEARCH_MODEL") {
            self.research.model = Some(v);
        }
        if let Some(v) = string("PRFAQ_INSIGHT_MODEL") {
            self.insight.model = v;
        }
        if let Some(v) = parse_var("PRFAQ_INSIGHTS_ENABLED", lookup("PRFAQ_INSIGHTS_ENABLED"))? {
            self.insight.enabled = v;
        }
        if let Some(v) = parse_var("PRFAQ_MIN_IDEA_CHARS", lookup("PRFAQ_MIN_IDEA_CHARS"))? {
            self.pipeline.min_idea_chars = v;
        }
        if let Some(v) = parse_var("PRFAQ_MAX_RETRIES", lookup("PRFAQ_MAX_RETRIES"))? {
            self.retry.max_retries = v;
        }
        if let Some(v) = parse_var("PRFAQ_HEARTBEAT_SECS", lookup("PRFAQ_HEARTBEAT_SECS"))? {
            self.pipeline.heartbeat_secs = v;
        }
        Ok(())
    }

    /// Parse a YAML document. Missing sections use defaults.
    #[cfg(feature = "yaml")]
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| PipelineError::InvalidConfig(format!("YAML: {}", e)))
    }

    /// Check what can be checked without contacting a provider.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.chat.api_key().is_none() {
            missing.push("ANTHROPIC_API_KEY");
        }
        if self.research.api_key().is_none() {
            missing.push("PERPLEXITY_API_KEY");
        }
        if !missing.is_empty() {
            return Err(PipelineError::InvalidConfig(format!(
                "missing credentials: {}",
                missing.join(", ")
            )));
        }
        if self.pipeline.min_idea_chars == 0 {
            return Err(PipelineError::InvalidConfig("min_idea_chars must be at least 1".into()));
        }
        if self.pipeline.heartbeat_secs == 0 {
            return Err(PipelineError::InvalidConfig("heartbeat_secs must be at least 1".into()));
        }
        if self.retry.max_retries > 0 && self.retry.delays_secs.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "retry.delays_secs must not be empty when retries are enabled".into(),
            ));
        }
        if let Some(bad) = self
            .retry
            .delays_secs
            .iter()
            .find(|s| !(0.0..=MAX_RETRY_DELAY_SECS).contains(*s))
        {
            return Err(PipelineError::InvalidConfig(format!(
                "retry.delays_secs entries must be between 0 and {}s, got {}",
                MAX_RETRY_DELAY_SECS, bad
            )));
        }
        for (name, provider) in [("chat", &self.chat), ("research", &self.research)] {
            if provider.timeout_secs == Some(0) {
                return Err(PipelineError::InvalidConfig(format!(
                    "{}.timeout_secs must be at least 1",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            min_idea_chars: self.pipeline.min_idea_chars,
            heartbeat_interval: Duration::from_secs(self.pipeline.heartbeat_secs),
            max_heartbeats_per_stage: self.pipeline.max_heartbeats_per_stage,
            channel_capacity: self.pipeline.channel_capacity,
        }
    }

    fn chat_provider(&self, client: &Client) -> Result<Provider> {
        let key = self.chat.api_key().unwrap_or_default();
        let mut builder = Provider::builder(
            ProviderKind::Chat,
            self.chat.base_url.as_deref().unwrap_or(ANTHROPIC_BASE_URL),
        )
        .name("anthropic")
        .client(client.clone())
        .anthropic(key)
        .model(self.chat.model.as_deref().unwrap_or(DEFAULT_CHAT_MODEL))
        .config(self.chat.llm_config(LlmConfig::drafting()))
        .backoff(self.retry.backoff());
        if let Some(secs) = self.chat.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        builder.build()
    }

    fn research_provider(&self, client: &Client) -> Result<Provider> {
        let key = self.research.api_key().unwrap_or_default();
        let mut builder = Provider::builder(
            ProviderKind::Research,
            self.research.base_url.as_deref().unwrap_or(PERPLEXITY_BASE_URL),
        )
        .name("perplexity")
        .client(client.clone())
        .openai_with_key(key)
        .model(self.research.model.as_deref().unwrap_or(DEFAULT_RESEARCH_MODEL))
        .config(self.research.llm_config(LlmConfig::research()))
        .backoff(self.retry.backoff());
        if let Some(secs) = self.research.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        builder.build()
    }

    fn insight_extractor(&self, client: &Client) -> Result<InsightExtractor> {
        let timeout = Duration::from_secs(self.insight.timeout_secs.max(1));
        let provider = Provider::builder(
            ProviderKind::Chat,
            self.chat.base_url.as_deref().unwrap_or(ANTHROPIC_BASE_URL),
        )
        .name("anthropic-insight")
        .client(client.clone())
        .anthropic(self.chat.api_key().unwrap_or_default())
        .model(self.insight.model.as_str())
        .config(LlmConfig::brief())
        .backoff(BackoffConfig::interactive())
        .timeout(timeout)
        .build()?;
        Ok(InsightExtractor::new(Arc::new(provider))
            .with_timeout(timeout)
            .with_max_concurrent(self.insight.max_concurrent))
    }

    /// Working Backwards stages, with any configured provider timeout
    /// replacing the per-stage defaults of the stages bound to it.
    fn registry(&self) -> Result<StageRegistry> {
        let mut registry = StageRegistry::working_backwards()?;
        if let Some(secs) = self.chat.timeout_secs {
            registry.set_timeout(ProviderKind::Chat, Duration::from_secs(secs));
        }
        if let Some(secs) = self.research.timeout_secs {
            registry.set_timeout(ProviderKind::Research, Duration::from_secs(secs));
        }
        Ok(registry)
    }

    fn http_client() -> Result<Client> {
        Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| PipelineError::InvalidConfig(format!("HTTP client: {}", e)))
    }

    /// Validate and wire providers, insights and cache. Add a recorder
    /// before calling `build()`.
    pub fn orchestrator_builder(&self) -> Result<OrchestratorBuilder> {
        self.validate()?;
        let client = Self::http_client()?;
        let mut builder = Orchestrator::builder(self.registry()?)
            .chat(Arc::new(self.chat_provider(&client)?))
            .research(Arc::new(self.research_provider(&client)?))
            .cache(Arc::new(RawOutputCache::new(
                Duration::from_secs(self.pipeline.cache_ttl_secs),
                self.pipeline.cache_max_entries,
            )))
            .config(self.orchestrator_config());
        if self.insight.enabled {
            builder = builder.insights(Arc::new(self.insight_extractor(&client)?));
        }
        Ok(builder)
    }

    pub fn build_orchestrator(&self) -> Result<Orchestrator> {
        self.orchestrator_builder()?.build()
    }

    /// Analyzer bound to the chat provider.
    pub fn build_analyzer(&self) -> Result<ProductAnalyzer> {
        if self.chat.api_key().is_none() {
            return Err(PipelineError::InvalidConfig("missing credentials: ANTHROPIC_API_KEY".into()));
        }
        let client = Self::http_client()?;
        Ok(ProductAnalyzer::new(
            Arc::new(self.chat_provider(&client)?),
            self.pipeline.min_idea_chars,
        ))
    }
}
