// =============================================================================
// Feature vectors — typed inputs for the composer layer
// =============================================================================

pub mod candle;
pub mod image;
pub mod pipeline;
pub mod snapshot;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::instrument::InstrumentRef;

/// Meta key identifying a feature vector's provenance.
pub const GROUP_BY_KEY: &str = "group_by";
/// Provenance tag for point-in-time market snapshots.
pub const GROUP_MARKET_SNAPSHOT: &str = "market_snapshot";
/// Provenance tag for MLLM image analysis.
pub const GROUP_IMAGE_ANALYSIS: &str = "image_analysis";

/// Provenance tag for a candle window, e.g. `candle:1m`.
pub fn candle_group(interval: &str) -> String {
    format!("candle:{interval}")
}

/// A single feature value: numeric or textual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Number(f64),
    Text(String),
}

impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<String> for FeatureValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// One per-instrument (or market-wide) feature vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureVector {
    pub ts_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument: Option<InstrumentRef>,
    pub values: HashMap<String, FeatureValue>,
    pub meta: HashMap<String, serde_json::Value>,
}

impl FeatureVector {
    pub fn new(ts_ms: i64, instrument: Option<InstrumentRef>, group_by: &str) -> Self {
        let mut meta = HashMap::new();
        meta.insert(GROUP_BY_KEY.to_string(), serde_json::json!(group_by));
        Self {
            ts_ms,
            instrument,
            values: HashMap::new(),
            meta,
        }
    }

    pub fn with_number(mut self, key: &str, value: f64) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn with_text(mut self, key: &str, value: impl Into<String>) -> Self {
        self.values.insert(key.to_string(), value.into().into());
        self
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        match self.values.get(key)? {
            FeatureValue::Number(n) => Some(*n),
            FeatureValue::Text(_) => None,
        }
    }

    pub fn group_by(&self) -> Option<&str> {
        self.meta.get(GROUP_BY_KEY)?.as_str()
    }

    pub fn symbol(&self) -> Option<&str> {
        self.instrument.as_ref().map(|i| i.symbol.as_str())
    }
}

/// Subset of feature vectors whose provenance is the market snapshot; the
/// gateway and portfolio use these for pricing.
pub fn extract_market_snapshot_features(features: &[FeatureVector]) -> Vec<FeatureVector> {
    features
        .iter()
        .filter(|fv| fv.group_by() == Some(GROUP_MARKET_SNAPSHOT))
        .cloned()
        .collect()
}

/// Symbol → `price.last` map from market snapshot features.
pub fn price_map(market_features: &[FeatureVector]) -> HashMap<String, f64> {
    market_features
        .iter()
        .filter_map(|fv| {
            let symbol = fv.symbol()?.to_string();
            let price = fv.number("price.last")?;
            (price > 0.0).then_some((symbol, price))
        })
        .collect()
}
