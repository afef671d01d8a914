use serde::{Deserialize, Serialize};

/// Sampling configuration for LLM requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Temperature (0.0 = deterministic, 1.0 = creative).
    pub temperature: f64,

    /// Maximum tokens to generate.
    pub max_tokens: u32,

    /// Nucleus sampling cutoff. Omitted from the request when `None`.
    pub top_p: Option<f64>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2048,
            top_p: None,
        }
    }
}

impl LlmConfig {
    /// Long-form drafting: 8192 tokens, temperature 0.7, top_p 0.95.
    pub fn drafting() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 8192,
            top_p: Some(0.95),
        }
    }

    /// Factual web research: temperature 0.3, top_p 0.9.
    pub fn research() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 4096,
            top_p: Some(0.9),
        }
    }

    /// One-sentence summaries.
    pub fn brief() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 150,
            top_p: None,
        }
    }

    pub fn with_temperature(mut self, temp: f64) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = tokens;
        self
    }

    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }
}
