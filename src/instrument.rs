// =============================================================================
// Instrument references and symbol normalization
// =============================================================================
//
// External systems deliver symbols in several formats ("BTC-USDT",
// "BTC/USDT", "BTC/USDT:USDT"). Internally every symbol is canonical
// "BASE/QUOTE" (spot) or "BASE/QUOTE:SETTLE" (derivatives), and map keys use
// the settle-stripped form so exchange and local views line up.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::MarketType;

/// Immutable reference to a tradable instrument on a specific exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentRef {
    /// Canonical symbol: "BASE/QUOTE" or "BASE/QUOTE:SETTLE".
    pub symbol: String,
    pub exchange_id: String,
}

impl InstrumentRef {
    pub fn new(symbol: impl Into<String>, exchange_id: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            exchange_id: exchange_id.into(),
        }
    }

    /// Normalized constructor: accepts any external symbol format.
    pub fn normalized(
        symbol: &str,
        exchange_id: impl Into<String>,
        market_type: MarketType,
    ) -> Self {
        Self {
            symbol: normalize_symbol(symbol, market_type),
            exchange_id: exchange_id.into(),
        }
    }

    /// Key used for position maps: settle suffix stripped.
    pub fn canonical_key(&self) -> String {
        canonical_symbol_key(&self.symbol)
    }
}

impl std::fmt::Display for InstrumentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.exchange_id)
    }
}

/// Normalize an external symbol to the canonical internal format.
///
/// `-` separators collapse to `/`; derivatives get a `:QUOTE` settle suffix
/// when none is present. Idempotent: normalizing an already-canonical symbol
/// returns it unchanged.
pub fn normalize_symbol(symbol: &str, market_type: MarketType) -> String {
    let base = symbol.trim().replace('-', "/");

    match market_type {
        MarketType::Spot => base,
        MarketType::Derivative => {
            if base.contains(':') {
                return base;
            }
            let parts: Vec<&str> = base.split('/').collect();
            if parts.len() == 2 {
                format!("{}/{}:{}", parts[0], parts[1], parts[1])
            } else {
                base
            }
        }
    }
}

/// Collapse a symbol to its map key: "SOL/USDT:USDT" -> "SOL/USDT",
/// "SOL-USDT" -> "SOL/USDT".
pub fn canonical_symbol_key(symbol: &str) -> String {
    let base = symbol.trim().replace('-', "/");
    match base.split_once(':') {
        Some((head, _settle)) => head.to_string(),
        None => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spot_normalization_collapses_dash() {
        assert_eq!(normalize_symbol("BTC-USDT", MarketType::Spot), "BTC/USDT");
        assert_eq!(normalize_symbol("BTC/USDT", MarketType::Spot), "BTC/USDT");
    }

    #[test]
    fn derivative_normalization_appends_settle() {
        assert_eq!(
            normalize_symbol("BTC-USDT", MarketType::Derivative),
            "BTC/USDT:USDT"
        );
        assert_eq!(
            normalize_symbol("ETH/USD", MarketType::Derivative),
            "ETH/USD:USD"
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        for (sym, market) in [
            ("BTC-USDT", MarketType::Spot),
            ("BTC-USDT", MarketType::Derivative),
            ("SOL/USDT:USDT", MarketType::Derivative),
        ] {
            let once = normalize_symbol(sym, market);
            let twice = normalize_symbol(&once, market);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn canonical_key_strips_settle() {
        assert_eq!(canonical_symbol_key("SOL/USDT:USDT"), "SOL/USDT");
        assert_eq!(canonical_symbol_key("SOL-USDT"), "SOL/USDT");
        assert_eq!(canonical_symbol_key("SOL/USDT"), "SOL/USDT");
    }

    #[test]
    fn instrument_roundtrip() {
        let inst = InstrumentRef::normalized("DOGE-USDT", "binance", MarketType::Derivative);
        assert_eq!(inst.symbol, "DOGE/USDT:USDT");
        assert_eq!(inst.canonical_key(), "DOGE/USDT");

        let json = serde_json::to_string(&inst).unwrap();
        let back: InstrumentRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, inst);
    }
}
