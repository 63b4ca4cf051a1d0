// =============================================================================
// Plan normalization — shared guardrails between the grid and LLM composers
// =============================================================================
//
// Turns a raw plan into executable instructions against a projected
// positions map: each emitted instruction updates the projection so later
// items in the same plan see its effect. Venue filters run in a fixed
// order: max_order_qty cap, quantity_step quantization, min_trade_qty,
// min_notional.
// =============================================================================

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::execution::{Meta, TradeInstruction};
use crate::portfolio::{PortfolioView, QUANTITY_PRECISION};
use crate::types::{PriceMode, TradeAction, TradeSide};

use super::{TradeDecisionItem, VenueConstraints};

/// Default slippage allowance on normalized instructions, in basis points.
pub const DEFAULT_SLIPPAGE_BPS: u32 = 25;

/// Settings for one normalization pass.
#[derive(Debug, Clone)]
pub struct NormalizeSettings {
    pub default_slippage_bps: u32,
    pub quantity_precision: f64,
    pub max_positions: Option<u32>,
}

impl Default for NormalizeSettings {
    fn default() -> Self {
        Self {
            default_slippage_bps: DEFAULT_SLIPPAGE_BPS,
            quantity_precision: QUANTITY_PRECISION,
            max_positions: None,
        }
    }
}

/// Outcome of a normalization pass: instructions plus the reasons items
/// were skipped (surfaced in the composer rationale).
#[derive(Debug, Default)]
pub struct NormalizedPlan {
    pub instructions: Vec<TradeInstruction>,
    pub skipped: Vec<String>,
}

/// Normalize a raw plan into executable instructions.
///
/// `prices` maps symbol → last price and backs the min-notional filter; an
/// item without a price fails that filter.
pub fn normalize_plan(
    compose_id: &str,
    portfolio: &PortfolioView,
    items: &[TradeDecisionItem],
    constraints: &VenueConstraints,
    prices: &HashMap<String, f64>,
    settings: &NormalizeSettings,
) -> NormalizedPlan {
    let precision = settings.quantity_precision;

    let mut projected: HashMap<String, f64> = portfolio
        .positions
        .iter()
        .map(|(symbol, snapshot)| (symbol.clone(), snapshot.quantity))
        .collect();
    let mut active_positions = projected
        .values()
        .filter(|qty| qty.abs() > precision)
        .count() as u32;

    let max_positions = settings.max_positions.or(constraints.max_positions);
    let mut plan = NormalizedPlan::default();

    for (index, item) in items.iter().enumerate() {
        let symbol = item.instrument.canonical_key();
        let current_qty = projected.get(&symbol).copied().unwrap_or(0.0);

        let target_qty = resolve_target_quantity(item, current_qty, constraints.max_position_qty);
        let delta = target_qty - current_qty;

        if delta.abs() <= precision {
            debug!(symbol = %symbol, delta, "skipping item at quantity precision");
            continue;
        }

        let is_new_position = current_qty.abs() <= precision && target_qty.abs() > precision;
        if is_new_position {
            if let Some(max) = max_positions {
                if active_positions >= max {
                    warn!(
                        symbol = %symbol,
                        active_positions,
                        max,
                        "skipping item due to max_positions constraint"
                    );
                    plan.skipped
                        .push(format!("{symbol}: max_positions reached ({active_positions}/{max})"));
                    continue;
                }
            }
        }

        let side = if delta > 0.0 {
            TradeSide::Buy
        } else {
            TradeSide::Sell
        };
        let mut quantity = delta.abs();

        // Venue filters, in order.
        if let Some(max_order) = constraints.max_order_qty {
            quantity = quantity.min(max_order);
        }
        if let Some(step) = constraints.quantity_step.filter(|s| *s > 0.0) {
            quantity = (quantity / step).floor() * step;
        }
        if quantity <= precision {
            plan.skipped
                .push(format!("{symbol}: quantity quantized to zero"));
            continue;
        }
        if let Some(min_qty) = constraints.min_trade_qty {
            if quantity < min_qty {
                plan.skipped
                    .push(format!("{symbol}: quantity {quantity} below min_trade_qty {min_qty}"));
                continue;
            }
        }
        if let Some(min_notional) = constraints.min_notional {
            let Some(price) = prices.get(&symbol).copied().filter(|p| *p > 0.0) else {
                plan.skipped
                    .push(format!("{symbol}: no price for min_notional check"));
                continue;
            };
            let notional = quantity * price;
            if notional + 1e-9 < min_notional {
                plan.skipped.push(format!(
                    "{symbol}: notional {notional:.4} below min_notional {min_notional}"
                ));
                continue;
            }
        }

        // Commit the projection.
        let signed_delta = if side == TradeSide::Buy {
            quantity
        } else {
            -quantity
        };
        let final_target = current_qty + signed_delta;
        projected.insert(symbol.clone(), final_target);

        if is_new_position {
            active_positions += 1;
        }
        if final_target.abs() <= precision {
            active_positions = active_positions.saturating_sub(1);
        }

        let mut meta = Meta::new();
        meta.insert("requested_target_qty".into(), serde_json::json!(target_qty));
        meta.insert("current_qty".into(), serde_json::json!(current_qty));
        meta.insert("final_target_qty".into(), serde_json::json!(final_target));
        meta.insert("action".into(), serde_json::json!(item.action));
        if let Some(confidence) = item.confidence {
            meta.insert("confidence".into(), serde_json::json!(confidence));
        }
        if let Some(rationale) = &item.rationale {
            meta.insert("rationale".into(), serde_json::json!(rationale));
        }
        if item.action.is_close() {
            meta.insert("reduceOnly".into(), serde_json::json!(true));
        }

        plan.instructions.push(TradeInstruction {
            instruction_id: format!("{compose_id}:{symbol}:{index}"),
            compose_id: compose_id.to_string(),
            instrument: item.instrument.clone(),
            action: item.action,
            side,
            quantity,
            price_mode: PriceMode::Market,
            limit_price: None,
            max_slippage_bps: settings.default_slippage_bps,
            leverage: item.leverage,
            meta,
        });
    }

    plan
}

/// Resolve an item's absolute target position from its action.
fn resolve_target_quantity(
    item: &TradeDecisionItem,
    current_qty: f64,
    max_position_qty: Option<f64>,
) -> f64 {
    let mut target = match item.action {
        TradeAction::Noop => current_qty,
        TradeAction::Flat => 0.0,
        // Closes move toward zero, never past it, and only against a
        // position in the named direction.
        TradeAction::CloseLong if current_qty > 0.0 => {
            let close_qty = item.target_qty.abs().min(current_qty);
            (current_qty - close_qty).max(0.0)
        }
        TradeAction::CloseShort if current_qty < 0.0 => {
            let close_qty = item.target_qty.abs().min(-current_qty);
            (current_qty + close_qty).min(0.0)
        }
        TradeAction::CloseLong | TradeAction::CloseShort => current_qty,
        TradeAction::OpenLong => item.target_qty.abs(),
        TradeAction::OpenShort => -item.target_qty.abs(),
    };

    if let Some(max_position) = max_position_qty {
        let cap = max_position.abs();
        target = target.clamp(-cap, cap);
    }
    target
}
