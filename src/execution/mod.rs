// =============================================================================
// Execution Gateway — instructions in, results out, 1:1 by instruction_id
// =============================================================================

pub mod live;
pub mod paper;

pub use live::LiveExecutionGateway;
pub use paper::PaperExecutionGateway;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::features::FeatureVector;
use crate::instrument::InstrumentRef;
use crate::types::{PriceMode, TradeAction, TradeSide, TxStatus};

/// Free-form instruction/result metadata (rationale, reduce-only flag,
/// normalization audit fields).
pub type Meta = HashMap<String, serde_json::Value>;

/// One executable order derived from a composer plan. Idempotent by
/// `instruction_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeInstruction {
    pub instruction_id: String,
    pub compose_id: String,
    pub instrument: InstrumentRef,
    pub action: TradeAction,
    pub side: TradeSide,
    pub quantity: f64,
    #[serde(default)]
    pub price_mode: PriceMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    pub max_slippage_bps: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leverage: Option<f64>,
    #[serde(default)]
    pub meta: Meta,
}

impl TradeInstruction {
    /// Closing orders carry `meta.reduceOnly = true` so a live venue never
    /// flips the position on an oversized close.
    pub fn reduce_only(&self) -> bool {
        self.meta
            .get("reduceOnly")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn rationale(&self) -> Option<&str> {
        self.meta.get("rationale").and_then(|v| v.as_str())
    }
}

/// Outcome of one instruction. `status ∈ {Filled, Partial}` implies
/// `filled_qty > 0`; any other status must not create a trade record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxResult {
    pub instruction_id: String,
    pub instrument: InstrumentRef,
    pub side: TradeSide,
    pub requested_qty: f64,
    pub filled_qty: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_exec_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_cost: Option<f64>,
    pub status: TxStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leverage: Option<f64>,
    #[serde(default)]
    pub meta: Meta,
}

impl TxResult {
    /// Failed result preserving the instruction's identity.
    pub fn failed(instruction: &TradeInstruction, status: TxStatus, reason: impl Into<String>) -> Self {
        Self {
            instruction_id: instruction.instruction_id.clone(),
            instrument: instruction.instrument.clone(),
            side: instruction.side,
            requested_qty: instruction.quantity,
            filled_qty: 0.0,
            avg_exec_price: None,
            fee_cost: None,
            status,
            reason: Some(reason.into()),
            leverage: instruction.leverage,
            meta: instruction.meta.clone(),
        }
    }
}

/// Venue-facing execution seam. `execute` returns exactly one result per
/// instruction, in instruction order.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    async fn execute(
        &self,
        instructions: &[TradeInstruction],
        market_features: &[FeatureVector],
    ) -> Vec<TxResult>;

    /// Release venue resources. Idempotent.
    async fn close(&self);
}

#[cfg(test)]
pub(crate) fn instruction_for_test(
    symbol: &str,
    side: TradeSide,
    quantity: f64,
) -> TradeInstruction {
    TradeInstruction {
        instruction_id: format!("compose-test:{symbol}:0"),
        compose_id: "compose-test".into(),
        instrument: InstrumentRef::new(symbol, "binance"),
        action: match side {
            TradeSide::Buy => TradeAction::OpenLong,
            TradeSide::Sell => TradeAction::OpenShort,
        },
        side,
        quantity,
        price_mode: PriceMode::Market,
        limit_price: None,
        max_slippage_bps: 25,
        leverage: None,
        meta: Meta::new(),
    }
}
