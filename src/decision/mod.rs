// =============================================================================
// Decision layer — composers that turn context into trade instructions
// =============================================================================

pub mod advisor;
pub mod grid;
pub mod llm;
pub mod normalize;

pub use advisor::{GridParamAdvice, GridParamAdvisor};
pub use grid::GridComposer;
pub use llm::LlmComposer;

use serde::{Deserialize, Serialize};

use crate::features::FeatureVector;
use crate::history::TradeDigest;
use crate::instrument::InstrumentRef;
use crate::portfolio::PortfolioView;
use crate::types::TradeAction;

use crate::execution::TradeInstruction;

/// Everything a composer sees for one cycle.
#[derive(Debug, Clone)]
pub struct ComposeContext {
    pub ts: i64,
    pub compose_id: String,
    pub strategy_id: String,
    pub features: Vec<FeatureVector>,
    pub portfolio: PortfolioView,
    pub digest: TradeDigest,
    pub constraints: Option<VenueConstraints>,
}

/// Venue filters and account limits applied during normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VenueConstraints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_positions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_leverage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity_step: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_trade_qty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_order_qty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_position_qty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_notional: Option<f64>,
}

/// One per-symbol proposal inside a raw plan.
///
/// `target_qty` semantics follow the action: OPEN_* carry the absolute
/// position size to hold, CLOSE_* carry the quantity to close, FLAT/NOOP
/// ignore it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeDecisionItem {
    pub instrument: InstrumentRef,
    pub action: TradeAction,
    #[serde(default)]
    pub target_qty: f64,
    #[serde(default)]
    pub leverage: Option<f64>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub rationale: Option<String>,
}

/// Final composer output for one cycle.
#[derive(Debug, Clone)]
pub struct ComposeResult {
    pub instructions: Vec<TradeInstruction>,
    pub rationale: String,
    pub should_stop: bool,
}

impl ComposeResult {
    pub fn empty(rationale: impl Into<String>) -> Self {
        Self {
            instructions: Vec::new(),
            rationale: rationale.into(),
            should_stop: false,
        }
    }
}

/// Tagged composer variant dispatched by the coordinator.
#[derive(Debug)]
pub enum Composer {
    Grid(GridComposer),
    Llm(LlmComposer),
}

impl Composer {
    pub async fn compose(&mut self, context: &ComposeContext) -> ComposeResult {
        match self {
            Self::Grid(composer) => composer.compose(context).await,
            Self::Llm(composer) => composer.compose(context).await,
        }
    }
}
