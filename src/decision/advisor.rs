// =============================================================================
// Grid Parameter Advisor — LLM-proposed grid tuning
// =============================================================================
//
// Consumes the compose context and returns advisory grid parameters plus a
// textual rationale. Any model failure (timeout, schema mismatch, missing
// JSON) degrades to `None`; the composer keeps its current parameters.
// =============================================================================

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::llm::{extract_json, ChatModel};

use super::grid::GridParams;
use super::ComposeContext;

/// Advisory grid parameters returned by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridParamAdvice {
    pub grid_step_pct: f64,
    pub grid_max_steps: u32,
    pub grid_base_fraction: f64,
    #[serde(default)]
    pub grid_lower_pct: Option<f64>,
    #[serde(default)]
    pub grid_upper_pct: Option<f64>,
    #[serde(default)]
    pub grid_count: Option<u32>,
    #[serde(default)]
    pub advisor_rationale: Option<String>,
}

/// LLM-backed advisor for the grid composer.
pub struct GridParamAdvisor {
    model: Arc<dyn ChatModel>,
}

impl GridParamAdvisor {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// Ask the model for fresh grid parameters. `None` on any failure.
    pub async fn advise(
        &self,
        context: &ComposeContext,
        prev_params: &GridParams,
    ) -> Option<GridParamAdvice> {
        let prompt = self.build_prompt(context, prev_params);

        let response = match self.model.complete(&prompt).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "grid param advisor call failed");
                return None;
            }
        };

        let Some(raw) = extract_json(&response) else {
            warn!("grid param advisor returned no JSON");
            return None;
        };

        match serde_json::from_str::<GridParamAdvice>(raw) {
            Ok(advice) => {
                debug!(
                    step_pct = advice.grid_step_pct,
                    max_steps = advice.grid_max_steps,
                    base_fraction = advice.grid_base_fraction,
                    "grid param advice received"
                );
                Some(advice)
            }
            Err(e) => {
                warn!(error = %e, "grid param advice failed validation");
                None
            }
        }
    }

    fn build_prompt(&self, context: &ComposeContext, prev_params: &GridParams) -> String {
        let market: Vec<serde_json::Value> = context
            .features
            .iter()
            .filter(|fv| fv.group_by() == Some(crate::features::GROUP_MARKET_SNAPSHOT))
            .map(|fv| {
                json!({
                    "symbol": fv.symbol(),
                    "last": fv.number("price.last"),
                    "open": fv.number("price.open"),
                    "change_pct": fv.number("change_pct"),
                    "volume": fv.number("volume"),
                })
            })
            .collect();

        let positions: Vec<serde_json::Value> = context
            .portfolio
            .open_positions()
            .map(|(symbol, pos)| {
                json!({
                    "symbol": symbol,
                    "quantity": pos.quantity,
                    "avg_price": pos.avg_price,
                    "unrealized_pnl": pos.unrealized_pnl,
                })
            })
            .collect();

        let payload = json!({
            "timestamp": context.ts,
            "market": market,
            "positions": positions,
            "digest": context.digest,
            "buying_power": context.portfolio.buying_power,
            "equity": context.portfolio.total_value,
            "previous_params": prev_params,
        });

        format!(
            "You are a grid-trading parameter advisor. Given the JSON context, \
             propose grid parameters as a JSON object with fields grid_step_pct \
             (fraction, e.g. 0.005), grid_max_steps (integer), grid_base_fraction \
             (fraction of equity per grid order), and optionally grid_lower_pct, \
             grid_upper_pct (zone bounds relative to average price) and grid_count \
             (number of grid lines). Include a short advisor_rationale string.\n\n\
             Context:\n{}",
            serde_json::to_string_pretty(&payload).unwrap_or_default()
        )
    }
}

impl std::fmt::Debug for GridParamAdvisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridParamAdvisor").finish()
    }
}
