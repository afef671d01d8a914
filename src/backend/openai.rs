//! Backend for OpenAI-compatible chat completion APIs.
//!
//! [`OpenAiBackend`] drives the research stage against Perplexity
//! (`https://api.perplexity.ai/chat/completions`), and works unchanged
//! against other OpenAI-compatible servers by overriding the path.
//!
//! Reasoning models may wrap their deliberation in `<think>` tags; those are
//! stripped. Citations returned alongside the answer are exposed on
//! [`LlmResponse::citations`] and, by default, appended as a numbered
//! `Sources` list.

use super::{Backend, LlmRequest, LlmResponse};
use crate::error::Result;
use crate::parsing;
use crate::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

/// Backend for any OpenAI-compatible API.
///
/// # Example
///
/// ```
/// use prfaq_pipeline::backend::OpenAiBackend;
///
/// let perplexity = OpenAiBackend::new().with_api_key("pplx-...");
/// let openai = OpenAiBackend::new()
///     .with_api_key("sk-...")
///     .with_path("/v1/chat/completions");
/// ```
#[derive(Clone)]
pub struct OpenAiBackend {
    /// Optional API key. If set, sent as `Authorization: Bearer {key}`.
    pub(crate) api_key: Option<String>,
    /// Path appended to the base URL. Default: `/chat/completions`.
    pub(crate) path: String,
    /// Append returned citations to the text as a `Sources` section.
    pub(crate) append_citations: bool,
}

impl std::fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field("api_key", &self.api_key.as_deref().map(parsing::redact_key))
            .field("path", &self.path)
            .field("append_citations", &self.append_citations)
            .finish()
    }
}

impl OpenAiBackend {
    /// Create a new OpenAI-compatible backend without authentication.
    pub fn new() -> Self {
        Self {
            api_key: None,
            path: "/chat/completions".to_string(),
            append_citations: true,
        }
    }

    /// Set the API key for authentication.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Override the request path (e.g. `/v1/chat/completions`).
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Keep citations out of the returned text.
    pub fn without_citation_footer(mut self) -> Self {
        self.append_citations = false;
        self
    }

    /// Returns `true` if an API key has been configured.
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn build_messages(request: &LlmRequest) -> Vec<Value> {
        let mut messages = Vec::new();
        if let Some(ref sys) = request.system_prompt {
            if !sys.is_empty() {
                messages.push(json!({"role": "system", "content": sys}));
            }
        }
        messages.push(json!({"role": "user", "content": request.prompt}));
        messages
    }

    /// Build the request body for the chat completions endpoint.
    fn build_body(request: &LlmRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": Self::build_messages(request),
            "temperature": request.config.temperature,
            "max_tokens": request.config.max_tokens,
            "stream": false,
        });
        if let Some(top_p) = request.config.top_p {
            body["top_p"] = json!(top_p);
        }
        body
    }

    fn build_http_request(
        &self,
        client: &Client,
        url: &str,
        body: &Value,
    ) -> reqwest::RequestBuilder {
        let mut req = client.post(url).json(body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        req
    }

    /// Citations arrive either as a flat `citations` string array or as
    /// `search_results` objects with a `url` field.
    fn extract_citations(json_resp: &Value) -> Vec<String> {
        if let Some(list) = json_resp.get("citations").and_then(|v| v.as_array()) {
            return list
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
        }
        json_resp
            .get("search_results")
            .and_then(|v| v.as_array())
            .map(|list| {
                list.iter()
                    .filter_map(|r| r.get("url").and_then(|u| u.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn extract_metadata(json_resp: &Value) -> Option<Value> {
        let mut meta = serde_json::Map::new();
        for key in ["usage", "model", "id"] {
            if let Some(v) = json_resp.get(key) {
                meta.insert(key.into(), v.clone());
            }
        }
        if meta.is_empty() {
            None
        } else {
            Some(Value::Object(meta))
        }
    }

    /// Turn a successful response body into an [`LlmResponse`].
    fn parse_response(&self, status: u16, json_resp: &Value) -> Result<LlmResponse> {
        let content = json_resp
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                PipelineError::InvalidResponse("response has no choices[0].message.content".into())
            })?;

        let (_thinking, cleaned) = parsing::extract_thinking(content);
        if cleaned.trim().is_empty() {
            return Err(PipelineError::InvalidResponse(
                "response has no answer outside reasoning blocks".into(),
            ));
        }
        let citations = Self::extract_citations(json_resp);
        let text = if self.append_citations {
            parsing::append_sources(&cleaned, &citations)
        } else {
            cleaned
        };

        Ok(LlmResponse {
            text,
            status,
            metadata: Self::extract_metadata(json_resp),
            citations,
        })
    }
}

impl Default for OpenAiBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for OpenAiBackend {
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        let base = base_url.trim_end_matches('/');
        let url = format!("{}{}", base, self.path);
        let body = Self::build_body(request);

        let resp = self.build_http_request(client, &url, &body).send().await?;
        let status = resp.status().as_u16();

        if !resp.status().is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parsing::parse_retry_after);
            let text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::HttpError {
                status,
                body: parsing::provider_error_message(&text),
                retry_after,
            });
        }

        let json_resp: Value = resp.json().await?;
        self.parse_response(status, &json_resp)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::LlmConfig;

    fn test_request() -> LlmRequest {
        LlmRequest {
            model: "sonar-pro".into(),
            system_prompt: None,
            prompt: "Size the smart bottle market".into(),
            config: LlmConfig::research(),
        }
    }

    #[test]
    fn test_research_payload() {
        let mut request = test_request();
        request.system_prompt = Some("You are a market analyst.".into());

        let body = OpenAiBackend::build_body(&request);

        assert_eq!(body["model"], "sonar-pro");
        assert_eq!(body["temperature"], 0.3);
        assert_eq!(body["top_p"], 0.9);
        assert_eq!(body["stream"], false);

        let messages = body["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[1]["content"], "Size the smart bottle market");
    }

    #[test]
    fn test_no_system_no_top_p() {
        let mut request = test_request();
        request.config.top_p = None;
        let body = OpenAiBackend::build_body(&request);

        assert_eq!(body["messages"].as_array().expect("messages").len(), 1);
        assert!(body.get("top_p").is_none());
    }

    #[test]
    fn test_parse_response_appends_sources() {
        let backend = OpenAiBackend::new();
        let resp = json!({
            "id": "abc",
            "model": "sonar-pro",
            "choices": [{"message": {"content": "<think>hmm</think>Market is $2B"}}],
            "citations": ["https://a.example", "https://b.example"]
        });
        let parsed = backend.parse_response(200, &resp).unwrap();

        assert!(parsed.text.starts_with("Market is $2B"));
        assert!(parsed.text.contains("1. https://a.example"));
        assert!(!parsed.text.contains("hmm"));
        assert_eq!(parsed.citations.len(), 2);
        assert_eq!(parsed.metadata.unwrap()["id"], "abc");
    }

    #[test]
    fn test_parse_response_search_results() {
        let backend = OpenAiBackend::new().without_citation_footer();
        let resp = json!({
            "choices": [{"message": {"content": "answer"}}],
            "search_results": [{"title": "t", "url": "https://c.example"}]
        });
        let parsed = backend.parse_response(200, &resp).unwrap();
        assert_eq!(parsed.text, "answer");
        assert_eq!(parsed.citations, vec!["https://c.example".to_string()]);
    }

    #[test]
    fn test_parse_response_missing_content() {
        let backend = OpenAiBackend::new();
        let err = backend.parse_response(200, &json!({"choices": []})).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidResponse(_)));
    }

    #[test]
    fn test_reasoning_only_answer_is_invalid() {
        let backend = OpenAiBackend::new();
        for content in ["<think>hmm</think>", "", "  \n "] {
            let resp = json!({
                "choices": [{"message": {"content": content}}],
                "citations": ["https://a.example"]
            });
            let err = backend.parse_response(200, &resp).unwrap_err();
            assert!(matches!(err, PipelineError::InvalidResponse(_)), "{content:?}");
        }
    }

    #[test]
    fn test_auth_header() {
        let backend = OpenAiBackend::new().with_api_key("pplx-test123");
        let req = backend
            .build_http_request(&Client::new(), "https://api.perplexity.ai/chat/completions", &json!({}))
            .build()
            .expect("build request");

        let auth = req.headers().get("Authorization").expect("auth header");
        assert_eq!(auth, "Bearer pplx-test123");
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let backend = OpenAiBackend::new().with_api_key("pplx-1234567890abcdef");
        let debug_output = format!("{:?}", backend);
        assert!(!debug_output.contains("1234567890abcdef"), "API key must not appear in Debug output");
        assert!(debug_output.contains("pplx-1"), "Prefix should be visible for identification");
        assert!(debug_output.contains("***"), "Redaction marker must be present");
    }

    #[test]
    fn test_has_api_key() {
        assert!(!OpenAiBackend::new().has_api_key());
        assert!(OpenAiBackend::new().with_api_key("k").has_api_key());
    }
}
