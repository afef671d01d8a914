//! Backend for the Anthropic Messages API (`/v1/messages`).
//!
//! Drives every chat stage. Authentication is the `x-api-key` header; the
//! API version is pinned through `anthropic-version`. HTTP 529 signals an
//! overloaded service and is retried like a 503.

use super::{Backend, LlmRequest, LlmResponse};
use crate::error::Result;
use crate::parsing;
use crate::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Default public endpoint.
pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API backend.
///
/// # Example
///
/// ```
/// use prfaq_pipeline::backend::AnthropicBackend;
///
/// let backend = AnthropicBackend::new("sk-ant-...");
/// ```
#[derive(Clone)]
pub struct AnthropicBackend {
    api_key: String,
    version: String,
}

impl std::fmt::Debug for AnthropicBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicBackend")
            .field("api_key", &parsing::redact_key(&self.api_key))
            .field("version", &self.version)
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<Message<'a>>,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<serde_json::Value>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicBackend {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            version: ANTHROPIC_VERSION.to_string(),
        }
    }

    /// Override the `anthropic-version` header.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    fn build_body(request: &LlmRequest) -> MessagesRequest<'_> {
        MessagesRequest {
            model: &request.model,
            max_tokens: request.config.max_tokens,
            system: request
                .system_prompt
                .as_deref()
                .filter(|s| !s.is_empty()),
            messages: vec![Message {
                role: "user",
                content: &request.prompt,
            }],
            temperature: request.config.temperature,
            top_p: request.config.top_p,
        }
    }

    fn build_http_request<T: Serialize + ?Sized>(
        &self,
        client: &Client,
        url: &str,
        body: &T,
    ) -> reqwest::RequestBuilder {
        client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.version)
            .json(body)
    }

    /// Concatenate the text blocks of a response.
    fn parse_response(status: u16, body: &str) -> Result<LlmResponse> {
        let parsed: MessagesResponse = serde_json::from_str(body)?;

        let text = parsed
            .content
            .iter()
            .filter(|b| b.block_type == "text")
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        if text.is_empty() {
            return Err(PipelineError::InvalidResponse(
                "no text content in response".into(),
            ));
        }

        let metadata = serde_json::json!({
            "id": parsed.id,
            "model": parsed.model,
            "usage": parsed.usage,
            "stop_reason": parsed.stop_reason,
        });

        Ok(LlmResponse {
            text,
            status,
            metadata: Some(metadata),
            citations: Vec::new(),
        })
    }
}

#[async_trait]
impl Backend for AnthropicBackend {
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        let url = format!("{}/v1/messages", base_url.trim_end_matches('/'));
        let body = Self::build_body(request);

        let resp = self.build_http_request(client, &url, &body).send().await?;
        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(parsing::parse_retry_after);
        let text = resp.text().await?;

        if !(200..300).contains(&status) {
            return Err(PipelineError::HttpError {
                status,
                body: parsing::provider_error_message(&text),
                retry_after,
            });
        }

        Self::parse_response(status, &text)
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::LlmConfig;

    fn test_request() -> LlmRequest {
        LlmRequest {
            model: "claude-sonnet-4-20250514".into(),
            system_prompt: Some("You are a product manager.".into()),
            prompt: "Draft a press release".into(),
            config: LlmConfig::drafting(),
        }
    }

    #[test]
    fn test_messages_payload() {
        let request = test_request();
        let body = serde_json::to_value(AnthropicBackend::build_body(&request)).unwrap();

        assert_eq!(body["model"], "claude-sonnet-4-20250514");
        assert_eq!(body["max_tokens"], 8192);
        assert_eq!(body["system"], "You are a product manager.");
        assert_eq!(body["top_p"], 0.95);
        let messages = body["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"], "Draft a press release");
    }

    #[test]
    fn test_empty_system_prompt_omitted() {
        let mut request = test_request();
        request.system_prompt = Some(String::new());
        request.config.top_p = None;
        let body = serde_json::to_value(AnthropicBackend::build_body(&request)).unwrap();
        assert!(body.get("system").is_none());
        assert!(body.get("top_p").is_none());
    }

    #[test]
    fn test_headers() {
        let backend = AnthropicBackend::new("sk-ant-test");
        let req = backend
            .build_http_request(&Client::new(), "https://api.anthropic.com/v1/messages", &serde_json::json!({}))
            .build()
            .expect("build request");
        assert_eq!(req.headers().get("x-api-key").expect("key"), "sk-ant-test");
        assert_eq!(
            req.headers().get("anthropic-version").expect("version"),
            ANTHROPIC_VERSION
        );
    }

    #[test]
    fn test_parse_text_blocks() {
        let body = r#"{
            "id": "msg_1",
            "model": "claude",
            "content": [
                {"type": "text", "text": "Hello"},
                {"type": "tool_use", "id": "x"},
                {"type": "text", "text": " world"}
            ],
            "usage": {"input_tokens": 3, "output_tokens": 2},
            "stop_reason": "end_turn"
        }"#;
        let resp = AnthropicBackend::parse_response(200, body).unwrap();
        assert_eq!(resp.text, "Hello world");
        assert_eq!(resp.metadata.unwrap()["usage"]["output_tokens"], 2);
    }

    #[test]
    fn test_parse_without_text_is_invalid() {
        let err = AnthropicBackend::parse_response(200, r#"{"content": []}"#).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidResponse(_)));
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let backend = AnthropicBackend::new("sk-ant-1234567890abcdef");
        let debug_output = format!("{:?}", backend);
        assert!(!debug_output.contains("1234567890abcdef"));
        assert!(debug_output.contains("***"));
    }
}
