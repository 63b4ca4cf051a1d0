// =============================================================================
// Screenshot data source — optional dashboard captures for image analysis
// =============================================================================
//
// Captures a rendered dashboard image once per cycle via an HTTP rendering
// service. The capability is optional: construction failure or a capture
// error degrades the features pipeline to run without image features.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::instrument::InstrumentRef;

/// Per-capture HTTP deadline. Rendering a dashboard is slower than an API
/// call, so this is looser than the exchange timeout.
const CAPTURE_TIMEOUT_SECS: u64 = 30;

/// One captured image handed to the image feature computer.
#[derive(Debug, Clone)]
pub struct CapturedImage {
    pub instrument: InstrumentRef,
    pub content: Vec<u8>,
    pub mime_type: String,
}

/// Screenshot capture seam.
#[async_trait]
pub trait ScreenshotSource: Send + Sync {
    /// One-time resource setup. Idempotent.
    async fn open(&self) -> Result<()>;

    /// Capture the configured dashboard.
    async fn capture(&self) -> Result<Vec<CapturedImage>>;

    /// Release resources. Idempotent.
    async fn close(&self);
}

/// Screenshot source that asks an HTTP rendering endpoint for a PNG of the
/// target dashboard URL.
pub struct HttpScreenshotSource {
    render_endpoint: String,
    target_url: String,
    instrument: InstrumentRef,
    client: reqwest::Client,
}

impl HttpScreenshotSource {
    pub fn new(
        render_endpoint: impl Into<String>,
        target_url: impl Into<String>,
        instrument: InstrumentRef,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(CAPTURE_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        Self {
            render_endpoint: render_endpoint.into(),
            target_url: target_url.into(),
            instrument,
            client,
        }
    }
}

#[async_trait]
impl ScreenshotSource for HttpScreenshotSource {
    async fn open(&self) -> Result<()> {
        info!(endpoint = %self.render_endpoint, target = %self.target_url, "screenshot source ready");
        Ok(())
    }

    async fn capture(&self) -> Result<Vec<CapturedImage>> {
        let url = format!(
            "{}?url={}",
            self.render_endpoint,
            urlencode(&self.target_url)
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("screenshot capture request failed")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("screenshot service returned {status}");
        }

        let mime_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/png")
            .to_string();

        let bytes = resp
            .bytes()
            .await
            .context("failed to read screenshot body")?;

        debug!(bytes = bytes.len(), mime = %mime_type, "dashboard captured");

        Ok(vec![CapturedImage {
            instrument: self.instrument.clone(),
            content: bytes.to_vec(),
            mime_type,
        }])
    }

    async fn close(&self) {
        debug!("screenshot source closed");
    }
}

impl std::fmt::Debug for HttpScreenshotSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpScreenshotSource")
            .field("render_endpoint", &self.render_endpoint)
            .field("target_url", &self.target_url)
            .finish()
    }
}

/// Minimal query-string percent-encoding for the target URL.
fn urlencode(input: &str) -> String {
    let mut out = String::with_capacity(input.len() * 3);
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencode_escapes_reserved_chars() {
        assert_eq!(
            urlencode("https://aggr.trade/?a=1&b=2"),
            "https%3A%2F%2Faggr.trade%2F%3Fa%3D1%26b%3D2"
        );
        assert_eq!(urlencode("plain-text_1.0~x"), "plain-text_1.0~x");
    }
}
