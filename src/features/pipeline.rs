// =============================================================================
// Features Pipeline — concurrent fan-out of fetchers, fan-in of vectors
// =============================================================================
//
// One `build()` call per decision cycle. Every configured fetch runs
// concurrently; an individual source failure logs, yields an empty sub-list,
// and never aborts the cycle.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, error, info};

use crate::data::market::MarketDataSource;
use crate::data::screenshot::ScreenshotSource;
use crate::data::CandleConfig;

use super::candle::CandleFeatureComputer;
use super::image::ImageFeatureComputer;
use super::snapshot::MarketSnapshotComputer;
use super::FeatureVector;

/// Per-cycle feature producer for one strategy.
pub struct FeaturesPipeline {
    symbols: Vec<String>,
    exchange_id: String,
    market_source: Arc<dyn MarketDataSource>,
    candle_computer: CandleFeatureComputer,
    snapshot_computer: MarketSnapshotComputer,
    candle_configurations: Vec<CandleConfig>,
    screenshot_source: Option<Arc<dyn ScreenshotSource>>,
    image_computer: Option<ImageFeatureComputer>,
    opened: AtomicBool,
    closed: AtomicBool,
}

impl FeaturesPipeline {
    pub fn new(
        symbols: Vec<String>,
        exchange_id: impl Into<String>,
        market_source: Arc<dyn MarketDataSource>,
        candle_configurations: Vec<CandleConfig>,
    ) -> Self {
        Self {
            symbols,
            exchange_id: exchange_id.into(),
            market_source,
            candle_computer: CandleFeatureComputer::new(),
            snapshot_computer: MarketSnapshotComputer::new(),
            candle_configurations,
            screenshot_source: None,
            image_computer: None,
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Attach the optional image-analysis stage.
    pub fn with_image_stage(
        mut self,
        screenshot_source: Arc<dyn ScreenshotSource>,
        image_computer: ImageFeatureComputer,
    ) -> Self {
        self.screenshot_source = Some(screenshot_source);
        self.image_computer = Some(image_computer);
        self
    }

    /// One-time resource setup. Idempotent.
    pub async fn open(&self) {
        if self.opened.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(source) = &self.screenshot_source {
            if let Err(e) = source.open().await {
                error!(error = %e, "screenshot source failed to open; image features disabled for this runtime");
            }
        }
        info!(
            symbols = ?self.symbols,
            candle_sets = self.candle_configurations.len(),
            image_stage = self.image_computer.is_some(),
            "features pipeline opened"
        );
    }

    /// Release resources. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(source) = &self.screenshot_source {
            source.close().await;
        }
        debug!("features pipeline closed");
    }

    /// Build one coherent feature list: candle windows, market snapshot, and
    /// the optional image analysis, all fetched concurrently.
    pub async fn build(&self) -> Vec<FeatureVector> {
        let candle_task = async {
            let fetches = self.candle_configurations.iter().map(|config| async move {
                let candles = self
                    .market_source
                    .recent_candles(&self.symbols, &config.interval, config.lookback)
                    .await;
                self.candle_computer.compute(&candles)
            });
            join_all(fetches)
                .await
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
        };

        let snapshot_task = async {
            let snapshot = self.market_source.market_snapshot(&self.symbols).await;
            self.snapshot_computer.build(&snapshot, &self.exchange_id)
        };

        let image_task = async {
            let (Some(source), Some(computer)) = (&self.screenshot_source, &self.image_computer)
            else {
                return Vec::new();
            };
            let images = match source.capture().await {
                Ok(images) => images,
                Err(e) => {
                    error!(error = %e, "failed to capture screenshot");
                    return Vec::new();
                }
            };
            match computer.compute(&images).await {
                Ok(features) => features,
                Err(e) => {
                    error!(error = %e, "image feature computation failed");
                    Vec::new()
                }
            }
        };

        let (mut features, snapshot_features, image_features) =
            tokio::join!(candle_task, snapshot_task, image_task);

        features.extend(snapshot_features);
        features.extend(image_features);

        debug!(count = features.len(), "features pipeline build complete");
        features
    }
}

impl std::fmt::Debug for FeaturesPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeaturesPipeline")
            .field("symbols", &self.symbols)
            .field("candle_sets", &self.candle_configurations.len())
            .field("image_stage", &self.image_computer.is_some())
            .finish()
    }
}
