//! Provider adapters.
//!
//! A [`Provider`] binds a [`Backend`] to its endpoint, model, sampling
//! config, retry policy and per-attempt timeout. It is built once and shared
//! (`Arc<Provider>`) by every run; the only state it holds across calls is
//! the HTTP connection pool inside [`Client`].

use crate::backend::{
    with_backoff, AnthropicBackend, Backend, BackoffConfig, CallOptions, LlmRequest,
    OpenAiBackend, RetryCallback,
};
use crate::client::LlmConfig;
use crate::error::Result;
use crate::parsing;
use crate::stage::ProviderKind;
use crate::PipelineError;
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_CHAT_MODEL: &str = "claude-sonnet-4-20250514";
pub const DEFAULT_RESEARCH_MODEL: &str = "sonar-pro";
pub const DEFAULT_INSIGHT_MODEL: &str = "claude-3-5-haiku-latest";
pub const PERPLEXITY_BASE_URL: &str = "https://api.perplexity.ai";

/// Per-call overrides for [`Provider::invoke`].
#[derive(Default)]
pub struct InvokeOptions<'a> {
    /// Replaces the provider's default per-attempt timeout.
    pub timeout: Option<Duration>,
    /// Aborts the in-flight request when cancelled.
    pub cancel: Option<&'a CancellationToken>,
    /// Invoked before each retry with (attempt, delay, reason).
    pub on_retry: RetryCallback<'a>,
}

/// Text returned by a provider, plus call accounting.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    /// Attempts spent, first call included.
    pub attempts: u32,
    pub model: String,
    pub metadata: Option<serde_json::Value>,
    pub citations: Vec<String>,
}

/// A configured provider adapter.
///
/// # Example
///
/// ```
/// use prfaq_pipeline::provider::Provider;
/// use prfaq_pipeline::stage::ProviderKind;
/// use prfaq_pipeline::backend::MockBackend;
/// use std::sync::Arc;
///
/// let provider = Provider::builder(ProviderKind::Chat, "http://unused")
///     .backend(Arc::new(MockBackend::fixed("hello")))
///     .model("test-model")
///     .build()
///     .unwrap();
/// assert_eq!(provider.model(), "test-model");
/// ```
pub struct Provider {
    name: String,
    kind: ProviderKind,
    client: Client,
    base_url: String,
    backend: Arc<dyn Backend>,
    model: String,
    config: LlmConfig,
    backoff: BackoffConfig,
    timeout: Duration,
}

impl Provider {
    /// Create a new builder.
    pub fn builder(kind: ProviderKind, base_url: impl Into<String>) -> ProviderBuilder {
        ProviderBuilder {
            name: None,
            kind,
            client: None,
            base_url: base_url.into(),
            backend: None,
            model: None,
            config: None,
            backoff: None,
            timeout: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn backoff(&self) -> &BackoffConfig {
        &self.backoff
    }

    pub fn default_timeout(&self) -> Duration {
        self.timeout
    }

    /// Send one system/user prompt pair with retry, timeout and cancellation.
    pub async fn invoke(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        opts: InvokeOptions<'_>,
    ) -> Result<Completion> {
        let InvokeOptions {
            timeout,
            cancel,
            on_retry: mut caller_retry,
        } = opts;
        let timeout = timeout.unwrap_or(self.timeout);
        let request = LlmRequest {
            model: self.model.clone(),
            system_prompt: (!system_prompt.is_empty()).then(|| system_prompt.to_string()),
            prompt: user_prompt.to_string(),
            config: self.config.clone(),
        };

        let provider = self.name.as_str();
        let mut on_retry = |attempt: u32, delay: Duration, reason: &str| {
            warn!(
                provider,
                attempt,
                delay_ms = delay.as_millis() as u64,
                reason = %parsing::preview(reason, 200),
                "retrying provider call"
            );
            if let Some(cb) = caller_retry.as_mut() {
                cb(attempt, delay, reason);
            }
        };

        debug!(
            provider,
            model = %self.model,
            prompt_chars = user_prompt.chars().count(),
            timeout_s = timeout.as_secs(),
            "invoking provider"
        );
        let started = Instant::now();
        let outcome = with_backoff(
            &self.backend,
            &self.client,
            &self.base_url,
            &request,
            &self.backoff,
            CallOptions {
                timeout: Some(timeout),
                cancel,
                on_retry: Some(&mut on_retry),
            },
        )
        .await?;

        debug!(
            provider,
            attempts = outcome.attempts,
            chars = outcome.response.text.chars().count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            preview = %parsing::preview(&outcome.response.text, 80),
            "provider call complete"
        );

        Ok(Completion {
            text: outcome.response.text,
            attempts: outcome.attempts,
            model: self.model.clone(),
            metadata: outcome.response.metadata,
            citations: outcome.response.citations,
        })
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("backend", &self.backend.name())
            .field("model", &self.model)
            .field("backoff", &self.backoff)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Builder for [`Provider`].
pub struct ProviderBuilder {
    name: Option<String>,
    kind: ProviderKind,
    client: Option<Client>,
    base_url: String,
    backend: Option<Arc<dyn Backend>>,
    model: Option<String>,
    config: Option<LlmConfig>,
    backoff: Option<BackoffConfig>,
    timeout: Option<Duration>,
}

impl ProviderBuilder {
    /// Name used in logs. Default: the backend's name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the HTTP client. If not set, a default client is created.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use the Anthropic Messages API with the given key.
    pub fn anthropic(mut self, api_key: impl Into<String>) -> Self {
        self.backend = Some(Arc::new(AnthropicBackend::new(api_key)));
        self
    }

    /// Use an OpenAI-compatible API with `Authorization: Bearer {key}`.
    pub fn openai_with_key(mut self, api_key: impl Into<String>) -> Self {
        self.backend = Some(Arc::new(OpenAiBackend::new().with_api_key(api_key)));
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn config(mut self, config: LlmConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the transport retry configuration. Default: [`BackoffConfig::canonical()`].
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.backoff = Some(config);
        self
    }

    /// Per-attempt timeout. Default: 180s for chat, 120s for research.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the provider. Fails when no backend was chosen.
    pub fn build(self) -> Result<Provider> {
        let backend = self.backend.ok_or_else(|| {
            PipelineError::InvalidConfig(format!("{:?} provider has no backend", self.kind))
        })?;
        let client = match self.client {
            Some(client) => client,
            None => Client::builder()
                .connect_timeout(Duration::from_secs(15))
                .build()
                .map_err(|e| PipelineError::InvalidConfig(format!("HTTP client: {}", e)))?,
        };
        let (model, config, timeout) = match self.kind {
            ProviderKind::Chat => (DEFAULT_CHAT_MODEL, LlmConfig::drafting(), Duration::from_secs(180)),
            ProviderKind::Research => (
                DEFAULT_RESEARCH_MODEL,
                LlmConfig::research(),
                Duration::from_secs(120),
            ),
        };

        Ok(Provider {
            name: self.name.unwrap_or_else(|| backend.name().to_string()),
            kind: self.kind,
            client,
            base_url: normalize_base_url(&self.base_url),
            backend,
            model: self.model.unwrap_or_else(|| model.to_string()),
            config: self.config.unwrap_or(config),
            backoff: self.backoff.unwrap_or_default(),
            timeout: self.timeout.unwrap_or(timeout),
        })
    }
}

/// Strip endpoint paths a user may paste into a base URL.
/// This prevents double-pathing when backends append their own paths.
/// e.g., "https://api.anthropic.com/v1/messages" -> "https://api.anthropic.com"
fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    for suffix in ["/v1/messages", "/chat/completions"] {
        if let Some(stripped) = trimmed.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    trimmed.to_string()
}
