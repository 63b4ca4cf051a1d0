// =============================================================================
// Image feature computer — MLLM analysis of dashboard screenshots
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::data::screenshot::CapturedImage;
use crate::llm::ChatModel;
use crate::types::timestamp_ms;

use super::{FeatureVector, GROUP_IMAGE_ANALYSIS};

/// Prompt sent with each dashboard capture.
const ANALYSIS_PROMPT: &str = "Analyze the trading dashboard in the provided image and \
generate a brief markdown report covering order-flow pressure, notable volume \
clusters, and any divergence between price and aggregated flows.";

/// Extracts a single textual feature vector (`report_markdown`) from one or
/// more dashboard captures via a multimodal model.
pub struct ImageFeatureComputer {
    model: Arc<dyn ChatModel>,
}

impl ImageFeatureComputer {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// Market-wide analysis of the captured images. Returns at most one
    /// vector; empty input yields an empty result.
    pub async fn compute(&self, images: &[CapturedImage]) -> Result<Vec<FeatureVector>> {
        if images.is_empty() {
            warn!("no images provided for image feature computation");
            return Ok(Vec::new());
        }

        let report = self
            .model
            .complete_with_images(ANALYSIS_PROMPT, images)
            .await?;
        info!(chars = report.len(), "image analysis complete");

        let fv = FeatureVector::new(
            timestamp_ms(),
            Some(images[0].instrument.clone()),
            GROUP_IMAGE_ANALYSIS,
        )
        .with_text("report_markdown", report);

        Ok(vec![fv])
    }
}

impl std::fmt::Debug for ImageFeatureComputer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageFeatureComputer").finish()
    }
}
