//! Mock backend for testing without a live provider.
//!
//! [`MockBackend`] plays back scripted replies, allowing downstream
//! consumers to write deterministic tests against this crate: canned text,
//! HTTP failures, or a call that never returns. Every request is recorded.
//!
//! # Example
//!
//! ```
//! use prfaq_pipeline::backend::{MockBackend, MockReply};
//!
//! let mock = MockBackend::fixed("Hello, world!");
//! let flaky = MockBackend::scripted(vec![
//!     MockReply::http(429, "rate limited"),
//!     MockReply::text("ok"),
//! ]);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::Client;

use super::{Backend, LlmRequest, LlmResponse};
use crate::error::Result;
use crate::PipelineError;

/// One scripted outcome for a mock call.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Succeed with this text.
    Text(String),
    /// Fail with an HTTP status and body.
    Http { status: u16, body: String },
    /// Never complete. Exercises timeouts and cancellation.
    Hang,
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        MockReply::Text(text.into())
    }

    pub fn http(status: u16, body: impl Into<String>) -> Self {
        MockReply::Http {
            status,
            body: body.into(),
        }
    }
}

type Responder = Arc<dyn Fn(&LlmRequest) -> MockReply + Send + Sync>;

enum Script {
    Sequence(Vec<MockReply>),
    Responder(Responder),
}

/// A test backend that returns scripted replies.
///
/// Sequences cycle back to the beginning when exhausted.
pub struct MockBackend {
    script: Script,
    index: AtomicUsize,
    requests: Mutex<Vec<LlmRequest>>,
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let script = match &self.script {
            Script::Sequence(replies) => format!("{} replies", replies.len()),
            Script::Responder(_) => "responder".to_string(),
        };
        f.debug_struct("MockBackend")
            .field("script", &script)
            .field("calls", &self.call_count())
            .finish()
    }
}

impl MockBackend {
    /// Create a mock backend with the given canned text responses.
    pub fn new(responses: Vec<String>) -> Self {
        Self::scripted(responses.into_iter().map(MockReply::Text).collect())
    }

    /// Create a mock that always returns the same text.
    pub fn fixed(response: impl Into<String>) -> Self {
        Self::scripted(vec![MockReply::text(response)])
    }

    /// Create a mock that plays back `replies` in order. An empty script
    /// answers with empty text, which callers see as an invalid response.
    pub fn scripted(replies: Vec<MockReply>) -> Self {
        Self::with_script(Script::Sequence(replies))
    }

    /// Create a mock that decides each reply from the request.
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&LlmRequest) -> MockReply + Send + Sync + 'static,
    {
        Self::with_script(Script::Responder(Arc::new(responder)))
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            index: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Number of calls made so far.
    pub fn call_count(&self) -> usize {
        self.index.load(Ordering::SeqCst)
    }

    /// Snapshot of every request received, in order.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn next_reply(&self, request: &LlmRequest) -> MockReply {
        let idx = self.index.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut log) = self.requests.lock() {
            log.push(request.clone());
        }
        match &self.script {
            Script::Sequence(replies) => replies
                .get(idx % replies.len().max(1))
                .cloned()
                .unwrap_or_else(|| MockReply::text("")),
            Script::Responder(f) => f(request),
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn complete(
        &self,
        _client: &Client,
        _base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        match self.next_reply(request) {
            MockReply::Text(text) => Ok(LlmResponse::text(text)),
            MockReply::Http { status, body } => Err(PipelineError::HttpError {
                status,
                body,
                retry_after: None,
            }),
            MockReply::Hang => std::future::pending().await,
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
