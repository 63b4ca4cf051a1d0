// =============================================================================
// Data sources — raw inputs to the features pipeline
// =============================================================================

pub mod market;
pub mod screenshot;

use serde::{Deserialize, Serialize};

use crate::instrument::InstrumentRef;

/// One OHLCV bar produced by a data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub ts_ms: i64,
    pub instrument: InstrumentRef,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub interval: String,
}

/// One candle-window configuration fetched per cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleConfig {
    pub interval: String,
    pub lookback: u32,
}

impl CandleConfig {
    pub fn new(interval: impl Into<String>, lookback: u32) -> Self {
        Self {
            interval: interval.into(),
            lookback,
        }
    }
}

/// Default candle windows: four hours of one-minute bars.
pub fn default_candle_configurations() -> Vec<CandleConfig> {
    vec![CandleConfig::new("1m", 60 * 4)]
}
