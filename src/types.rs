// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Whether the execution gateway talks to a real venue or simulates locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradingMode {
    Live,
    Virtual,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Virtual
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "LIVE"),
            Self::Virtual => write!(f, "VIRTUAL"),
        }
    }
}

/// Market type: derivatives support leverage, shorts, and funding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketType {
    Spot,
    Derivative,
}

impl Default for MarketType {
    fn default() -> Self {
        Self::Spot
    }
}

impl std::fmt::Display for MarketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spot => write!(f, "SPOT"),
            Self::Derivative => write!(f, "DERIVATIVE"),
        }
    }
}

/// Order side from the venue's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    /// The side that closes a position of the given signed quantity.
    pub fn closing(signed_qty: f64) -> Self {
        if signed_qty > 0.0 {
            Self::Sell
        } else {
            Self::Buy
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeType {
    Long,
    Short,
}

impl Default for TradeType {
    fn default() -> Self {
        Self::Long
    }
}

impl std::fmt::Display for TradeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// High-level action proposed by a composer for a single instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeAction {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    Flat,
    Noop,
}

impl TradeAction {
    /// True when the action reduces or exits an existing position.
    pub fn is_close(self) -> bool {
        matches!(self, Self::CloseLong | Self::CloseShort | Self::Flat)
    }
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OpenLong => "OPEN_LONG",
            Self::OpenShort => "OPEN_SHORT",
            Self::CloseLong => "CLOSE_LONG",
            Self::CloseShort => "CLOSE_SHORT",
            Self::Flat => "FLAT",
            Self::Noop => "NOOP",
        };
        write!(f, "{s}")
    }
}

/// How an instruction should be priced at the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PriceMode {
    Market,
    Limit,
}

impl Default for PriceMode {
    fn default() -> Self {
        Self::Market
    }
}

/// Outcome of executing a single instruction.
///
/// `Filled` and `Partial` imply a positive filled quantity; the other
/// statuses mean the instruction produced no trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TxStatus {
    Filled,
    Partial,
    Rejected,
    Error,
}

impl TxStatus {
    pub fn is_fill(self) -> bool {
        matches!(self, Self::Filled | Self::Partial)
    }
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filled => write!(f, "FILLED"),
            Self::Partial => write!(f, "PARTIAL"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Lifecycle status of a strategy runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StrategyStatus {
    Running,
    Stopped,
    Error,
}

impl std::fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Why a strategy stopped, recorded in the final summary metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopReason {
    StopLoss,
    NormalExit,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => write!(f, "STOP_LOSS"),
            Self::NormalExit => write!(f, "NORMAL_EXIT"),
        }
    }
}

/// Rolling per-strategy performance summary emitted after every cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySummary {
    pub strategy_id: String,
    pub name: String,
    pub model_provider: String,
    pub model_id: String,
    pub exchange_id: String,
    pub mode: TradingMode,
    pub status: StrategyStatus,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unrealized_pnl_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl_pct: Option<f64>,
    /// Equity.
    pub total_value: f64,
    pub last_updated_ts: i64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Current UNIX timestamp in milliseconds.
pub fn timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a prefixed opaque unique id, e.g. `compose-5f0c…`.
pub fn generate_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_closing_matches_position_sign() {
        assert_eq!(TradeSide::closing(1.5), TradeSide::Sell);
        assert_eq!(TradeSide::closing(-0.2), TradeSide::Buy);
    }

    #[test]
    fn tx_status_fill_semantics() {
        assert!(TxStatus::Filled.is_fill());
        assert!(TxStatus::Partial.is_fill());
        assert!(!TxStatus::Rejected.is_fill());
        assert!(!TxStatus::Error.is_fill());
    }

    #[test]
    fn serde_uses_wire_casing() {
        assert_eq!(
            serde_json::to_string(&TradeAction::OpenLong).unwrap(),
            "\"OPEN_LONG\""
        );
        assert_eq!(
            serde_json::to_string(&TradingMode::Virtual).unwrap(),
            "\"VIRTUAL\""
        );
        let side: TradeSide = serde_json::from_str("\"SELL\"").unwrap();
        assert_eq!(side, TradeSide::Sell);
    }

    #[test]
    fn summary_roundtrip() {
        let summary = StrategySummary {
            strategy_id: "strategy-1".into(),
            name: "grid-btc".into(),
            model_provider: "openrouter".into(),
            model_id: "deepseek/deepseek-v3".into(),
            exchange_id: "binance".into(),
            mode: TradingMode::Virtual,
            status: StrategyStatus::Running,
            realized_pnl: 12.5,
            unrealized_pnl: -3.0,
            unrealized_pnl_pct: Some(-0.3),
            pnl_pct: Some(0.0095),
            total_value: 10_009.5,
            last_updated_ts: 1_730_000_000_000,
            metadata: HashMap::new(),
        };
        let json = serde_json::to_string(&summary).unwrap();
        let back: StrategySummary = serde_json::from_str(&json).unwrap();
        assert_eq!(back.strategy_id, summary.strategy_id);
        assert_eq!(back.status, StrategyStatus::Running);
        assert_eq!(back.total_value, summary.total_value);
    }
}
