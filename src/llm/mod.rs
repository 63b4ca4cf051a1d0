// =============================================================================
// LLM capability — external model calls behind a narrow seam
// =============================================================================

pub mod client;

pub use client::OpenRouterClient;

use anyhow::Result;
use async_trait::async_trait;

use crate::data::screenshot::CapturedImage;

/// Chat-completion capability used by the LLM composer, the grid parameter
/// advisor, and the image feature computer. A failure anywhere behind this
/// seam degrades to a neutral empty result upstream; it never aborts a cycle.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Complete a text prompt and return the raw model output.
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Complete a prompt with image attachments (multimodal models only).
    async fn complete_with_images(&self, prompt: &str, images: &[CapturedImage])
        -> Result<String>;
}

/// Extract the first JSON object or array embedded in a model response.
///
/// Models wrap structured output in prose or code fences more often than
/// not; callers parse the returned slice with serde.
pub fn extract_json(response: &str) -> Option<&str> {
    let trimmed = response.trim();

    // Strip a ```json … ``` fence when present.
    let inner = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.rsplit_once("```"))
        .map(|(body, _)| body.trim())
        .unwrap_or(trimmed);

    let start = inner.find(['{', '['])?;
    let open = inner.as_bytes()[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, byte) in inner.as_bytes()[start..].iter().enumerate() {
        if in_string {
            match byte {
                b'\\' if !escaped => escaped = true,
                b'"' if !escaped => in_string = false,
                _ => escaped = false,
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b if *b == open => depth += 1,
            b if *b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&inner[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bare_object() {
        let out = extract_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(out, r#"{"a": 1}"#);
    }

    #[test]
    fn extracts_fenced_object() {
        let response = "Here is the plan:\n```json\n{\"items\": []}\n```\nDone.";
        // Fence handling applies when the response starts with a fence;
        // otherwise brace matching finds the object anyway.
        let out = extract_json(response).unwrap();
        assert_eq!(out, r#"{"items": []}"#);
    }

    #[test]
    fn extracts_object_with_nested_braces_and_strings() {
        let response = r#"rationale first {"outer": {"inner": "has } brace"}, "n": 2} trailing"#;
        let out = extract_json(response).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(out).unwrap();
        assert_eq!(parsed["n"], 2);
    }

    #[test]
    fn returns_none_without_json() {
        assert!(extract_json("no structure here").is_none());
        assert!(extract_json("{unbalanced").is_none());
    }
}
