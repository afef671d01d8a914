//! Backend trait and normalized request/response types.
//!
//! The [`Backend`] trait abstracts over LLM providers, translating between
//! normalized [`LlmRequest`]/[`LlmResponse`] types and provider-specific
//! HTTP APIs. Built-in implementations: [`AnthropicBackend`] for chat stages,
//! [`OpenAiBackend`] for OpenAI-compatible research endpoints (Perplexity),
//! and [`MockBackend`] for tests.
//!
//! ## Architecture
//!
//! ```text
//! Provider::invoke ──► LlmRequest ──► with_backoff ──► Backend::complete() ──► LlmResponse
//!                                          │
//!                               ┌──────────┴──────────┐
//!                        AnthropicBackend        OpenAiBackend
//!                          /v1/messages        /chat/completions
//! ```

pub mod anthropic;
pub mod backoff;
pub mod mock;
pub mod openai;

pub use anthropic::AnthropicBackend;
pub use backoff::BackoffConfig;
pub use mock::{MockBackend, MockReply};
pub use openai::OpenAiBackend;

use crate::client::LlmConfig;
use crate::error::Result;
use crate::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Type alias for the callback invoked before each transport retry.
///
/// Arguments: `(attempt_number, delay_before_retry, reason_for_retry)`.
pub type RetryCallback<'a> = Option<&'a mut (dyn FnMut(u32, Duration, &str) + Send)>;

/// A normalized, provider-agnostic LLM request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Model identifier (e.g. `"claude-sonnet-4-20250514"`, `"sonar-pro"`).
    pub model: String,

    /// Optional system instructions.
    pub system_prompt: Option<String>,

    /// The user prompt text.
    pub prompt: String,

    /// Sampling configuration (temperature, max_tokens, top_p).
    pub config: LlmConfig,
}

/// A normalized LLM response.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// The generated text content.
    pub text: String,

    /// HTTP status code (for diagnostics/logging).
    pub status: u16,

    /// Provider-specific metadata (token counts, model info).
    /// Stored as raw JSON since each provider returns different fields.
    pub metadata: Option<serde_json::Value>,

    /// Source URLs returned by research providers.
    pub citations: Vec<String>,
}

impl LlmResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            status: 200,
            metadata: None,
            citations: Vec::new(),
        }
    }
}

/// Abstraction over LLM providers.
///
/// Implementors translate between the normalized [`LlmRequest`]/[`LlmResponse`]
/// and the provider's HTTP API. Implementations must not retry on their own;
/// [`with_backoff`] owns the retry loop.
///
/// # Object Safety
///
/// This trait is object-safe and designed to be used as `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Execute a single non-streaming LLM call.
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Per-call knobs for [`with_backoff`].
#[derive(Default)]
pub struct CallOptions<'a> {
    /// Wall-clock budget for each attempt. Exceeding it is transient.
    pub timeout: Option<Duration>,
    /// Aborts the in-flight attempt or backoff sleep when cancelled.
    pub cancel: Option<&'a CancellationToken>,
    /// Invoked before each retry with (attempt, delay, reason).
    pub on_retry: RetryCallback<'a>,
}

/// A successful call and the number of attempts it took.
#[derive(Debug, Clone)]
pub struct BackoffOutcome {
    pub response: LlmResponse,
    pub attempts: u32,
}

/// Check whether a [`PipelineError`] is retryable based on the backoff config.
///
/// Retryable conditions:
/// - [`PipelineError::HttpError`] with a status in `config.retryable_statuses`
/// - [`PipelineError::Request`] connection or timeout failures
/// - [`PipelineError::Timeout`] from the per-attempt budget
pub fn is_retryable(error: &PipelineError, config: &BackoffConfig) -> bool {
    match error {
        PipelineError::HttpError { status, .. } => config.retryable_statuses.contains(status),
        PipelineError::Request(_) | PipelineError::Timeout { .. } => error.is_transient(),
        _ => false,
    }
}

/// Run `fut` under an optional timeout, racing an optional cancellation token.
pub(crate) async fn guarded<T, F>(
    fut: F,
    timeout: Option<Duration>,
    cancel: Option<&CancellationToken>,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let timed = async {
        match timeout {
            Some(after) => tokio::time::timeout(after, fut)
                .await
                .map_err(|_| PipelineError::Timeout { after })?,
            None => fut.await,
        }
    };

    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(PipelineError::Cancelled),
            res = timed => res,
        },
        None => timed.await,
    }
}

/// Execute a backend call with transport-level retry and backoff.
///
/// Wraps `Backend::complete()` with automatic retry on transient failures
/// (429, 5xx, 529, connection errors, per-attempt timeout). Fatal errors
/// such as 401 or a malformed request are returned after the first attempt.
/// An empty completion is reported as [`PipelineError::InvalidResponse`].
///
/// When every attempt fails transiently the last error is wrapped in
/// [`PipelineError::RetriesExhausted`].
pub async fn with_backoff(
    backend: &Arc<dyn Backend>,
    client: &Client,
    base_url: &str,
    request: &LlmRequest,
    config: &BackoffConfig,
    opts: CallOptions<'_>,
) -> Result<BackoffOutcome> {
    let CallOptions {
        timeout,
        cancel,
        mut on_retry,
    } = opts;
    let mut last_error: Option<PipelineError> = None;

    for attempt in 0..=config.max_retries {
        if cancel.is_some_and(|t| t.is_cancelled()) {
            return Err(PipelineError::Cancelled);
        }

        if attempt > 0 {
            let retry_after = match &last_error {
                Some(PipelineError::HttpError { retry_after, .. }) => *retry_after,
                _ => None,
            };
            let delay = config.delay_with_hint(attempt - 1, retry_after);

            let reason = last_error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default();

            if let Some(ref mut cb) = on_retry {
                cb(attempt, delay, &reason);
            }

            guarded(
                async {
                    tokio::time::sleep(delay).await;
                    Ok(())
                },
                None,
                cancel,
            )
            .await?;
        }

        match guarded(backend.complete(client, base_url, request), timeout, cancel).await {
            Ok(response) if response.text.trim().is_empty() => {
                return Err(PipelineError::InvalidResponse(format!(
                    "{} returned an empty completion",
                    backend.name()
                )));
            }
            Ok(response) => {
                return Ok(BackoffOutcome {
                    response,
                    attempts: attempt + 1,
                })
            }
            Err(e) if is_retryable(&e, config) => {
                if attempt < config.max_retries {
                    last_error = Some(e);
                    continue;
                }
                return Err(PipelineError::RetriesExhausted {
                    attempts: attempt + 1,
                    source: Box::new(e),
                });
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or(PipelineError::Other(
        "backoff loop exited unexpectedly".into(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn request() -> LlmRequest {
        LlmRequest {
            model: "test".into(),
            system_prompt: None,
            prompt: "test".into(),
            config: LlmConfig::default(),
        }
    }

    async fn call(
        mock: &Arc<MockBackend>,
        config: &BackoffConfig,
        opts: CallOptions<'_>,
    ) -> Result<BackoffOutcome> {
        let backend: Arc<dyn Backend> = mock.clone();
        with_backoff(&backend, &Client::new(), "http://unused", &request(), config, opts).await
    }

    #[test]
    fn test_is_retryable_statuses() {
        let config = BackoffConfig::canonical();
        for status in [408, 429, 500, 503, 529] {
            let err = PipelineError::HttpError {
                status,
                body: String::new(),
                retry_after: None,
            };
            assert!(is_retryable(&err, &config), "{status} should retry");
        }
        for status in [400, 401, 403, 404] {
            let err = PipelineError::HttpError {
                status,
                body: String::new(),
                retry_after: None,
            };
            assert!(!is_retryable(&err, &config), "{status} should not retry");
        }
    }

    #[test]
    fn test_status_kind_agrees_with_retry_policy() {
        let config = BackoffConfig::canonical();
        for status in 400..600 {
            let err = PipelineError::HttpError {
                status,
                body: String::new(),
                retry_after: None,
            };
            assert_eq!(err.is_transient(), is_retryable(&err, &config), "status {status}");
        }
    }

    #[test]
    fn test_is_retryable_other_errors() {
        let config = BackoffConfig::canonical();
        assert!(is_retryable(
            &PipelineError::Timeout {
                after: Duration::from_secs(1)
            },
            &config
        ));
        assert!(!is_retryable(&PipelineError::Cancelled, &config));
        assert!(!is_retryable(&PipelineError::Other("x".into()), &config));
        assert!(!is_retryable(&PipelineError::InvalidResponse("x".into()), &config));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let mock = Arc::new(MockBackend::scripted(vec![
            MockReply::http(429, "slow down"),
            MockReply::http(429, "slow down"),
            MockReply::text("done"),
        ]));
        let mut retries = Vec::new();
        let mut on_retry = |attempt: u32, _: Duration, reason: &str| {
            retries.push((attempt, reason.to_string()));
        };
        let outcome = call(
            &mock,
            &BackoffConfig::immediate(3),
            CallOptions {
                on_retry: Some(&mut on_retry),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.response.text, "done");
        assert_eq!(outcome.attempts, 3);
        assert_eq!(mock.call_count(), 3);
        assert_eq!(retries.len(), 2);
        assert_eq!(retries[0].0, 1);
        assert!(retries[0].1.contains("429"));
    }

    #[tokio::test]
    async fn test_retry_bound_is_respected() {
        let mock = Arc::new(MockBackend::scripted(vec![MockReply::http(503, "down")]));
        let err = call(&mock, &BackoffConfig::immediate(3), CallOptions::default())
            .await
            .unwrap_err();

        assert_eq!(mock.call_count(), 4);
        assert!(matches!(err, PipelineError::RetriesExhausted { attempts: 4, .. }));
        assert_eq!(err.root_cause().kind(), ErrorKind::Overloaded);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let mock = Arc::new(MockBackend::scripted(vec![MockReply::http(
            401,
            "invalid x-api-key",
        )]));
        let err = call(&mock, &BackoffConfig::immediate(3), CallOptions::default())
            .await
            .unwrap_err();

        assert_eq!(mock.call_count(), 1);
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[tokio::test]
    async fn test_empty_completion_is_invalid() {
        let mock = Arc::new(MockBackend::fixed("   "));
        let err = call(&mock, &BackoffConfig::immediate(3), CallOptions::default())
            .await
            .unwrap_err();

        assert_eq!(mock.call_count(), 1);
        assert!(matches!(err, PipelineError::InvalidResponse(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried() {
        let mock = Arc::new(MockBackend::scripted(vec![
            MockReply::Hang,
            MockReply::text("second try"),
        ]));
        let outcome = call(
            &mock,
            &BackoffConfig::canonical(),
            CallOptions {
                timeout: Some(Duration::from_secs(30)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.response.text, "second try");
    }

    #[tokio::test]
    async fn test_backoff_respects_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mock = Arc::new(MockBackend::fixed("never"));
        let result = call(
            &mock,
            &BackoffConfig::canonical(),
            CallOptions {
                cancel: Some(&cancel),
                ..Default::default()
            },
        )
        .await;

        assert!(matches!(result.unwrap_err(), PipelineError::Cancelled));
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_in_flight_call() {
        let cancel = CancellationToken::new();
        let mock = Arc::new(MockBackend::scripted(vec![MockReply::Hang]));
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let result = call(
            &mock,
            &BackoffConfig::canonical(),
            CallOptions {
                cancel: Some(&cancel),
                ..Default::default()
            },
        )
        .await;

        assert!(matches!(result.unwrap_err(), PipelineError::Cancelled));
        assert_eq!(mock.call_count(), 1);
    }
}
