// =============================================================================
// Market snapshot feature computer — pricing features per symbol
// =============================================================================

use crate::data::market::MarketSnapshot;
use crate::instrument::InstrumentRef;
use crate::types::timestamp_ms;

use super::{FeatureVector, GROUP_MARKET_SNAPSHOT};

/// Turns a raw market snapshot into one feature vector per symbol. These
/// vectors are the engine's pricing source: the paper gateway and the
/// portfolio both read `price.last` from them.
#[derive(Debug, Default)]
pub struct MarketSnapshotComputer;

impl MarketSnapshotComputer {
    pub fn new() -> Self {
        Self
    }

    pub fn build(&self, snapshot: &MarketSnapshot, exchange_id: &str) -> Vec<FeatureVector> {
        let ts = timestamp_ms();
        let mut features = Vec::with_capacity(snapshot.len());

        for (symbol, data) in snapshot {
            let mut fv = FeatureVector::new(
                ts,
                Some(InstrumentRef::new(symbol, exchange_id)),
                GROUP_MARKET_SNAPSHOT,
            )
            .with_number("price.last", data.ticker.last)
            .with_number("price.open", data.ticker.open)
            .with_number("volume", data.ticker.volume)
            .with_number("change_pct", data.ticker.change_pct());

            if let Some(oi) = data.open_interest {
                fv = fv.with_number("open_interest", oi);
            }
            if let Some(fr) = data.funding_rate {
                fv = fv.with_number("funding_rate", fr);
            }

            features.push(fv);
        }

        features
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::market::SymbolSnapshot;
    use crate::exchange::Ticker;
    use std::collections::HashMap;

    #[test]
    fn builds_pricing_features_with_optional_extras() {
        let mut snapshot: MarketSnapshot = HashMap::new();
        snapshot.insert(
            "BTC/USDT".into(),
            SymbolSnapshot {
                ticker: Ticker {
                    symbol: "BTC/USDT".into(),
                    last: 102.0,
                    open: 100.0,
                    volume: 500.0,
                },
                open_interest: Some(1_000_000.0),
                funding_rate: None,
            },
        );

        let features = MarketSnapshotComputer::new().build(&snapshot, "binance");
        assert_eq!(features.len(), 1);
        let fv = &features[0];
        assert_eq!(fv.group_by(), Some(GROUP_MARKET_SNAPSHOT));
        assert_eq!(fv.number("price.last"), Some(102.0));
        assert_eq!(fv.number("price.open"), Some(100.0));
        assert!((fv.number("change_pct").unwrap() - 0.02).abs() < 1e-12);
        assert_eq!(fv.number("open_interest"), Some(1_000_000.0));
        assert_eq!(fv.number("funding_rate"), None);
    }

    #[test]
    fn empty_snapshot_builds_nothing() {
        let features = MarketSnapshotComputer::new().build(&HashMap::new(), "binance");
        assert!(features.is_empty());
    }
}
