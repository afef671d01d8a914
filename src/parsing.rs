//! Text utilities for provider responses.
//!
//! Defensive cleanup of model output (reasoning blocks, citation footers),
//! provider error bodies, and short previews for logs.

use std::time::Duration;

/// Extract `<think>...</think>` blocks from a response (reasoning-model style).
///
/// Returns `(thinking_content, cleaned_text)` where `cleaned_text` has the
/// thinking block removed and is trimmed.
pub fn extract_thinking(text: &str) -> (Option<String>, String) {
    let think_start = "<think>";
    let think_end = "</think>";

    if let Some(start_idx) = text.find(think_start) {
        if let Some(end_idx) = text.find(think_end) {
            if end_idx > start_idx {
                let thinking = text[start_idx + think_start.len()..end_idx]
                    .trim()
                    .to_string();
                let mut cleaned = String::new();
                cleaned.push_str(&text[..start_idx]);
                cleaned.push_str(&text[end_idx + think_end.len()..]);
                let cleaned = cleaned.trim().to_string();
                let thinking = if thinking.is_empty() {
                    None
                } else {
                    Some(thinking)
                };
                return (thinking, cleaned);
            }
        }
    }

    (None, text.to_string())
}

/// Append a numbered `Sources` list. Returns `text` unchanged when there are
/// no citations.
pub fn append_sources(text: &str, citations: &[String]) -> String {
    if citations.is_empty() {
        return text.to_string();
    }
    let list = citations
        .iter()
        .enumerate()
        .map(|(i, url)| format!("{}. {}", i + 1, url))
        .collect::<Vec<_>>()
        .join("\n");
    format!("{}\n\n## Sources\n{}", text.trim_end(), list)
}

/// First `max_chars` characters of `text`, with `...` appended when cut.
///
/// Counts chars, not bytes, so multi-byte text is never split mid-codepoint.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_string(),
    }
}

/// Single-line preview for log fields.
pub fn preview(text: &str, max_chars: usize) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c.is_whitespace() { ' ' } else { c })
        .collect();
    excerpt(flat.trim(), max_chars)
}

/// Parse a `Retry-After` header value as seconds.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

/// Pull `error.message` out of a JSON error body, falling back to the raw body.
///
/// Both Anthropic (`{"type":"error","error":{"message":..}}`) and
/// OpenAI-compatible providers (`{"error":{"message":..}}`) use this shape.
pub fn provider_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

/// Mask an API key for `Debug` output, keeping a short prefix.
pub fn redact_key(key: &str) -> String {
    match key.char_indices().nth(6) {
        Some((idx, _)) => format!("{}***", &key[..idx]),
        None => "***".to_string(),
    }
}
