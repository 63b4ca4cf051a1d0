// =============================================================================
// OpenRouter chat-completions client
// =============================================================================
//
// Minimal OpenAI-compatible chat client. The API key is never logged or
// serialized. Every call carries an explicit deadline; the composer treats a
// timeout like any other model failure and substitutes an empty plan.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde_json::json;
use tracing::{debug, warn};

use crate::data::screenshot::CapturedImage;

use super::ChatModel;

/// Per-call deadline for chat completions.
const COMPLETION_TIMEOUT_SECS: u64 = 60;

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// OpenRouter-backed implementation of [`ChatModel`].
#[derive(Clone)]
pub struct OpenRouterClient {
    api_key: String,
    model_id: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenRouterClient {
    pub fn new(api_key: impl Into<String>, model_id: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(COMPLETION_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key: api_key.into(),
            model_id: model_id.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client,
        }
    }

    /// Override the base URL (proxies, self-hosted gateways).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn send(&self, messages: serde_json::Value) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model_id,
            "messages": messages,
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("chat completion request failed")?;

        let status = resp.status();
        let payload: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse chat completion response")?;

        if !status.is_success() {
            let msg = payload["error"]["message"]
                .as_str()
                .map(|s| s.to_string())
                .unwrap_or_else(|| payload.to_string());
            warn!(model = %self.model_id, %status, "chat completion failed");
            anyhow::bail!("chat completion returned {status}: {msg}");
        }

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .context("chat completion response missing content")?
            .to_string();

        debug!(model = %self.model_id, chars = content.len(), "chat completion received");
        Ok(content)
    }
}

#[async_trait]
impl ChatModel for OpenRouterClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.send(json!([{ "role": "user", "content": prompt }]))
            .await
    }

    async fn complete_with_images(
        &self,
        prompt: &str,
        images: &[CapturedImage],
    ) -> Result<String> {
        let mut content = vec![json!({ "type": "text", "text": prompt })];
        for image in images {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&image.content);
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:{};base64,{}", image.mime_type, encoded) },
            }));
        }

        self.send(json!([{ "role": "user", "content": content }]))
            .await
    }
}

impl std::fmt::Debug for OpenRouterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterClient")
            .field("api_key", &"<redacted>")
            .field("model_id", &self.model_id)
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_api_key() {
        let client = OpenRouterClient::new("sk-secret-key", "deepseek/deepseek-v3");
        let rendered = format!("{client:?}");
        assert!(!rendered.contains("sk-secret-key"));
        assert!(rendered.contains("deepseek/deepseek-v3"));
    }
}
