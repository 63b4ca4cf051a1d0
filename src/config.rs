// =============================================================================
// Strategy Request Configuration — the document that creates a runtime
// =============================================================================
//
// A `UserRequest` is a single JSON document submitted to the orchestrator.
// Unknown fields are rejected. Every tunable carries a serde default so a
// request only needs to name what it changes.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::EngineError;
use crate::types::{MarketType, TradingMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_decide_interval() -> u64 {
    60
}

fn default_max_positions() -> u32 {
    5
}

fn default_max_leverage() -> f64 {
    1.0
}

fn default_risk_per_trade() -> f64 {
    0.02
}

fn default_take_profit_pct() -> f64 {
    22.0
}

fn default_stop_loss_pct() -> f64 {
    -20.0
}

fn default_partial_tp_threshold_pct() -> f64 {
    15.0
}

fn default_partial_tp_close_ratio() -> f64 {
    0.3
}

fn default_trailing_stop_drawdown_pct() -> f64 {
    3.0
}

// =============================================================================
// Sub-configurations
// =============================================================================

/// Which LLM backs the composer and the grid parameter advisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmModelConfig {
    pub provider: String,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Which venue the strategy trades on and in which mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExchangeConfig {
    pub exchange_id: String,
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default)]
    pub market_type: MarketType,
}

/// Tunable trading parameters: sizing limits and the tiered exit ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TradingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_name: Option<String>,

    /// Symbols the strategy trades, in priority order.
    pub symbols: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_capital: Option<f64>,

    /// Seconds between decision cycles.
    #[serde(default = "default_decide_interval")]
    pub decide_interval: u64,

    /// Maximum number of concurrently open positions.
    #[serde(default = "default_max_positions")]
    pub max_positions: u32,

    #[serde(default = "default_max_leverage")]
    pub max_leverage: f64,

    /// Fraction of equity risked per trade.
    #[serde(default = "default_risk_per_trade")]
    pub risk_per_trade: f64,

    /// Full take-profit threshold on leveraged PnL percent.
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,

    /// Stop-loss threshold on leveraged PnL percent (negative).
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,

    #[serde(default = "default_true")]
    pub partial_tp_enabled: bool,

    /// Leveraged PnL percent at which the partial take-profit fires.
    #[serde(default = "default_partial_tp_threshold_pct")]
    pub partial_tp_threshold_pct: f64,

    /// Fraction of the position closed by the partial take-profit.
    #[serde(default = "default_partial_tp_close_ratio")]
    pub partial_tp_close_ratio: f64,

    /// Drawdown from the post-partial peak that closes the remainder.
    #[serde(default = "default_trailing_stop_drawdown_pct")]
    pub trailing_stop_drawdown_pct: f64,
}

// =============================================================================
// UserRequest
// =============================================================================

/// Full strategy creation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserRequest {
    pub llm_model_config: LlmModelConfig,
    pub exchange_config: ExchangeConfig,
    pub trading_config: TradingConfig,
}

impl UserRequest {
    /// Validate the request and normalize its symbol list in place.
    ///
    /// Symbols are deduplicated preserving order. Empty symbol lists and
    /// non-positive intervals fail fast — the strategy loop must never start
    /// from a malformed request.
    pub fn validate(&mut self) -> std::result::Result<(), EngineError> {
        let mut seen = std::collections::HashSet::new();
        self.trading_config
            .symbols
            .retain(|s| !s.trim().is_empty() && seen.insert(s.clone()));

        if self.trading_config.symbols.is_empty() {
            return Err(EngineError::Input("symbols must not be empty".into()));
        }
        if self.trading_config.decide_interval == 0 {
            return Err(EngineError::Input("decide_interval must be positive".into()));
        }
        if self.trading_config.max_leverage < 1.0 {
            return Err(EngineError::Input("max_leverage must be >= 1".into()));
        }
        if let Some(capital) = self.trading_config.initial_capital {
            if capital < 0.0 {
                return Err(EngineError::Input("initial_capital must be >= 0".into()));
            }
        }
        let ratio = self.trading_config.partial_tp_close_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(EngineError::Input(
                "partial_tp_close_ratio must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }

    /// Display name: explicit strategy name or the strategy id fallback.
    pub fn display_name(&self, strategy_id: &str) -> String {
        self.trading_config
            .strategy_name
            .clone()
            .unwrap_or_else(|| strategy_id.to_string())
    }

    /// Load a request from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read request from {}", path.display()))?;
        let mut request: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse request from {}", path.display()))?;
        request
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid request in {}: {e}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?request.trading_config.symbols,
            mode = %request.exchange_config.trading_mode,
            "strategy request loaded"
        );
        Ok(request)
    }

    /// Persist the request to `path` using an atomic write (write to `.tmp`,
    /// then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialise request to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp request to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp request to {}", path.display()))?;

        info!(path = %path.display(), "strategy request saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> &'static str {
        r#"{
            "llm_model_config": {"provider": "openrouter", "model_id": "deepseek/deepseek-v3"},
            "exchange_config": {"exchange_id": "binance"},
            "trading_config": {"symbols": ["BTC/USDT", "ETH/USDT"]}
        }"#
    }

    #[test]
    fn minimal_request_fills_defaults() {
        let req: UserRequest = serde_json::from_str(minimal_json()).unwrap();
        assert_eq!(req.exchange_config.trading_mode, TradingMode::Virtual);
        assert_eq!(req.exchange_config.market_type, MarketType::Spot);
        assert_eq!(req.trading_config.decide_interval, 60);
        assert_eq!(req.trading_config.max_positions, 5);
        assert!(req.trading_config.partial_tp_enabled);
        assert!((req.trading_config.take_profit_pct - 22.0).abs() < f64::EPSILON);
        assert!((req.trading_config.stop_loss_pct + 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let json = r#"{
            "llm_model_config": {"provider": "p", "model_id": "m"},
            "exchange_config": {"exchange_id": "binance"},
            "trading_config": {"symbols": ["BTC/USDT"]},
            "surprise": true
        }"#;
        assert!(serde_json::from_str::<UserRequest>(json).is_err());
    }

    #[test]
    fn validate_dedupes_symbols_preserving_order() {
        let mut req: UserRequest = serde_json::from_str(minimal_json()).unwrap();
        req.trading_config.symbols = vec![
            "BTC/USDT".into(),
            "ETH/USDT".into(),
            "BTC/USDT".into(),
            "SOL/USDT".into(),
            "ETH/USDT".into(),
        ];
        req.validate().unwrap();
        assert_eq!(
            req.trading_config.symbols,
            vec!["BTC/USDT", "ETH/USDT", "SOL/USDT"]
        );
    }

    #[test]
    fn validate_rejects_empty_symbols() {
        let mut req: UserRequest = serde_json::from_str(minimal_json()).unwrap();
        req.trading_config.symbols.clear();
        assert!(req.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_interval() {
        let mut req: UserRequest = serde_json::from_str(minimal_json()).unwrap();
        req.trading_config.decide_interval = 0;
        assert!(req.validate().is_err());
    }

    #[test]
    fn roundtrip_serialisation() {
        let req: UserRequest = serde_json::from_str(minimal_json()).unwrap();
        let json = serde_json::to_string(&req).unwrap();
        let back: UserRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.trading_config.symbols, req.trading_config.symbols);
        assert_eq!(back.trading_config.max_positions, req.trading_config.max_positions);
        assert_eq!(back.exchange_config.exchange_id, req.exchange_config.exchange_id);
    }
}
