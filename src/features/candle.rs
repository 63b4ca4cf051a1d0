// =============================================================================
// Candle feature computer — momentum and volume per symbol per window
// =============================================================================

use std::collections::HashMap;

use crate::data::Candle;

use super::{candle_group, FeatureVector};

/// Computes the default candle features: latest close, volume, and fractional
/// change from the previous close.
#[derive(Debug, Default)]
pub struct CandleFeatureComputer;

impl CandleFeatureComputer {
    pub fn new() -> Self {
        Self
    }

    /// One feature vector per symbol found in `candles`.
    pub fn compute(&self, candles: &[Candle]) -> Vec<FeatureVector> {
        if candles.is_empty() {
            return Vec::new();
        }

        let mut grouped: HashMap<&str, Vec<&Candle>> = HashMap::new();
        for candle in candles {
            grouped
                .entry(candle.instrument.symbol.as_str())
                .or_default()
                .push(candle);
        }

        let mut features = Vec::with_capacity(grouped.len());
        for (_, mut series) in grouped {
            series.sort_by_key(|c| c.ts_ms);
            let last = series[series.len() - 1];
            let prev = if series.len() > 1 {
                series[series.len() - 2]
            } else {
                last
            };

            let change_pct = if prev.close > 0.0 {
                (last.close - prev.close) / prev.close
            } else {
                0.0
            };

            let mut fv = FeatureVector::new(
                last.ts_ms,
                Some(last.instrument.clone()),
                &candle_group(&last.interval),
            )
            .with_number("close", last.close)
            .with_number("volume", last.volume)
            .with_number("change_pct", change_pct);
            fv.meta.insert("interval".into(), serde_json::json!(last.interval));
            fv.meta.insert("count".into(), serde_json::json!(series.len()));
            features.push(fv);
        }

        features
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::InstrumentRef;

    fn candle(symbol: &str, ts_ms: i64, close: f64) -> Candle {
        Candle {
            ts_ms,
            instrument: InstrumentRef::new(symbol, "binance"),
            open: close,
            high: close,
            low: close,
            close,
            volume: 5.0,
            interval: "1m".into(),
        }
    }

    #[test]
    fn computes_change_from_previous_close() {
        let computer = CandleFeatureComputer::new();
        let features = computer.compute(&[
            candle("BTC/USDT", 1_000, 100.0),
            candle("BTC/USDT", 2_000, 102.0),
        ]);

        assert_eq!(features.len(), 1);
        let fv = &features[0];
        assert_eq!(fv.number("close"), Some(102.0));
        assert!((fv.number("change_pct").unwrap() - 0.02).abs() < 1e-12);
        assert_eq!(fv.group_by(), Some("candle:1m"));
    }

    #[test]
    fn single_candle_yields_zero_change() {
        let computer = CandleFeatureComputer::new();
        let features = computer.compute(&[candle("ETH/USDT", 1_000, 2000.0)]);
        assert_eq!(features[0].number("change_pct"), Some(0.0));
    }

    #[test]
    fn one_vector_per_symbol() {
        let computer = CandleFeatureComputer::new();
        let features = computer.compute(&[
            candle("BTC/USDT", 1_000, 100.0),
            candle("ETH/USDT", 1_000, 2000.0),
            candle("BTC/USDT", 2_000, 99.0),
        ]);
        assert_eq!(features.len(), 2);
    }

    #[test]
    fn unsorted_input_is_ordered_by_timestamp() {
        let computer = CandleFeatureComputer::new();
        let features = computer.compute(&[
            candle("BTC/USDT", 3_000, 103.0),
            candle("BTC/USDT", 1_000, 100.0),
            candle("BTC/USDT", 2_000, 101.0),
        ]);
        // last=103 (ts 3000), prev=101 (ts 2000)
        let change = features[0].number("change_pct").unwrap();
        assert!((change - (103.0 - 101.0) / 101.0).abs() < 1e-12);
    }
}
