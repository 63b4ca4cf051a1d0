// =============================================================================
// Grid Composer — rule-based mean-reversion grid with a tiered exit ladder
// =============================================================================
//
// Per cycle, per symbol:
//   1. Exit ladder first: partial take-profit, trailing stop after the
//      partial, full take-profit, stop-loss (stop-loss blacklists the symbol
//      and requests a strategy stop).
//   2. Grid rules for every symbol not handled above: discrete price-grid
//      crossings add or reduce positions, capped at `max_steps` per cycle.
//
// `stopped_symbols` and the take-profit tracking map persist across cycles
// of the same strategy.
// =============================================================================

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::UserRequest;
use crate::features::{price_map, FeatureVector, GROUP_MARKET_SNAPSHOT};
use crate::instrument::InstrumentRef;
use crate::types::{MarketType, TradeAction};

use super::advisor::GridParamAdvisor;
use super::normalize::{normalize_plan, NormalizeSettings};
use super::{ComposeContext, ComposeResult, TradeDecisionItem, VenueConstraints};

/// Lowest grid step the advisor may set (0.3%).
const MIN_STEP_PCT: f64 = 0.003;
/// Minimum grid zone half-width relative to the average price (±10%).
const MIN_GRID_ZONE_PCT: f64 = 0.10;
/// Largest per-update change of `grid_count`, to prevent oscillation.
const MAX_GRID_COUNT_DELTA: u32 = 2;
/// Advisor refresh cadence.
const ADVICE_REFRESH_MS: i64 = 300_000;
/// Absolute market change that justifies applying fresh advice (1%).
const MARKET_CHANGE_THRESHOLD: f64 = 0.01;
/// Below this buying power, with no positions, the cycle is a no-op.
const MIN_REQUIRED_BUYING_POWER: f64 = 1.0;

/// Dynamic grid parameters, refreshable by the advisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridParams {
    pub step_pct: f64,
    pub max_steps: u32,
    pub base_fraction: f64,
    pub grid_lower_pct: Option<f64>,
    pub grid_upper_pct: Option<f64>,
    pub grid_count: Option<u32>,
}

impl Default for GridParams {
    fn default() -> Self {
        Self {
            step_pct: 0.005,
            max_steps: 3,
            base_fraction: 0.08,
            grid_lower_pct: None,
            grid_upper_pct: None,
            grid_count: None,
        }
    }
}

/// Tiered take-profit state per symbol.
#[derive(Debug, Clone, Default)]
struct TpTracking {
    partial_closed: bool,
    peak_pnl: f64,
}

/// Rule-based grid composer.
pub struct GridComposer {
    request: UserRequest,
    params: GridParams,
    advisor: Option<GridParamAdvisor>,
    params_applied: bool,
    last_advice_ts: Option<i64>,
    advice_rationale: Option<String>,
    stopped_symbols: HashSet<String>,
    tp_tracking: HashMap<String, TpTracking>,
    settings: NormalizeSettings,
}

impl GridComposer {
    pub fn new(request: UserRequest) -> Self {
        let settings = NormalizeSettings {
            max_positions: Some(request.trading_config.max_positions),
            ..Default::default()
        };
        Self {
            request,
            params: GridParams::default(),
            advisor: None,
            params_applied: false,
            last_advice_ts: None,
            advice_rationale: None,
            stopped_symbols: HashSet::new(),
            tp_tracking: HashMap::new(),
            settings,
        }
    }

    /// Attach the LLM parameter advisor.
    pub fn with_advisor(mut self, advisor: GridParamAdvisor) -> Self {
        self.advisor = Some(advisor);
        self
    }

    #[cfg(test)]
    pub fn with_params(mut self, params: GridParams) -> Self {
        self.params = params;
        self
    }

    #[cfg(test)]
    pub fn stopped_symbols(&self) -> &HashSet<String> {
        &self.stopped_symbols
    }

    pub async fn compose(&mut self, context: &ComposeContext) -> ComposeResult {
        let ts = context.ts;
        let symbols = self.request.trading_config.symbols.clone();
        let is_spot = self.request.exchange_config.market_type == MarketType::Spot;

        // Quick pre-check: nothing to manage and nothing to spend.
        let has_positions = symbols.iter().any(|symbol| {
            context
                .portfolio
                .positions
                .get(symbol)
                .is_some_and(|p| !p.is_closed())
        });
        let buying_power = context.portfolio.buying_power;
        if !has_positions && buying_power < MIN_REQUIRED_BUYING_POWER {
            warn!(
                buying_power,
                "skipping compose: no positions and insufficient buying power"
            );
            return ComposeResult::empty(format!(
                "No action: insufficient buying power (${buying_power:.2}) and no positions to manage."
            ));
        }

        self.refresh_advice(context, ts).await;

        let market_features: Vec<FeatureVector> = context
            .features
            .iter()
            .filter(|fv| fv.group_by() == Some(GROUP_MARKET_SNAPSHOT))
            .cloned()
            .collect();
        let prices = price_map(&market_features);

        let equity = if context.portfolio.total_value > 0.0 {
            context.portfolio.total_value
        } else {
            buying_power
        };

        let mut items: Vec<TradeDecisionItem> = Vec::new();
        let mut noop_reasons: Vec<String> = Vec::new();
        let mut exit_notes: Vec<String> = Vec::new();
        let mut should_stop = false;

        // ── 1. Exit ladder: partial TP → trailing → full TP → stop-loss ──
        for symbol in &symbols {
            if self.stopped_symbols.contains(symbol) {
                continue;
            }
            let Some(pos) = context.portfolio.positions.get(symbol) else {
                continue;
            };
            let quantity = pos.quantity;
            if quantity.abs() <= self.settings.quantity_precision {
                continue;
            }

            let mark = prices
                .get(symbol)
                .copied()
                .or(pos.mark_price)
                .unwrap_or(0.0);
            let avg = pos.avg_price;
            if mark <= 0.0 || avg <= 0.0 {
                continue;
            }

            let price_move_pct = if quantity > 0.0 {
                (mark - avg) / avg * 100.0
            } else {
                (avg - mark) / avg * 100.0
            };
            let leverage = pos.leverage.max(1.0);
            let pnl_pct = price_move_pct * leverage;

            let cfg = &self.request.trading_config;
            debug!(
                symbol = %symbol,
                quantity,
                mark,
                avg,
                price_move_pct,
                leverage,
                pnl_pct,
                "exit ladder check"
            );

            let close_action = if quantity > 0.0 {
                TradeAction::CloseLong
            } else {
                TradeAction::CloseShort
            };
            let instrument =
                InstrumentRef::new(symbol.clone(), self.request.exchange_config.exchange_id.clone());
            let track = self.tp_tracking.entry(symbol.clone()).or_default();

            if cfg.partial_tp_enabled
                && !track.partial_closed
                && pnl_pct >= cfg.partial_tp_threshold_pct
            {
                let close_qty = quantity.abs() * cfg.partial_tp_close_ratio;
                let note = format!(
                    "Partial TP {symbol}: pnl={pnl_pct:.2}% >= {:.2}%, closing {:.0}% ({close_qty:.4})",
                    cfg.partial_tp_threshold_pct,
                    cfg.partial_tp_close_ratio * 100.0
                );
                info!("{note}");
                items.push(TradeDecisionItem {
                    instrument,
                    action: close_action,
                    target_qty: close_qty,
                    leverage: Some(1.0),
                    confidence: Some(1.0),
                    rationale: Some(note.clone()),
                });
                exit_notes.push(note);
                track.partial_closed = true;
                track.peak_pnl = pnl_pct;
                continue;
            }

            if cfg.partial_tp_enabled && track.partial_closed {
                track.peak_pnl = track.peak_pnl.max(pnl_pct);
                let drawdown = track.peak_pnl - pnl_pct;
                if drawdown >= cfg.trailing_stop_drawdown_pct {
                    let note = format!(
                        "Trailing stop {symbol}: drawdown={drawdown:.2}% from peak={:.2}%, closing remaining {:.4}",
                        track.peak_pnl,
                        quantity.abs()
                    );
                    info!("{note}");
                    items.push(TradeDecisionItem {
                        instrument,
                        action: close_action,
                        target_qty: quantity.abs(),
                        leverage: Some(1.0),
                        confidence: Some(1.0),
                        rationale: Some(note.clone()),
                    });
                    exit_notes.push(note);
                    self.tp_tracking.remove(symbol);
                    continue;
                }
                continue;
            }

            if pnl_pct >= cfg.take_profit_pct {
                let note = format!(
                    "Full TP {symbol}: pnl={pnl_pct:.2}% >= {:.2}%, closing {:.4}",
                    cfg.take_profit_pct,
                    quantity.abs()
                );
                info!("{note}");
                items.push(TradeDecisionItem {
                    instrument,
                    action: close_action,
                    target_qty: quantity.abs(),
                    leverage: Some(1.0),
                    confidence: Some(1.0),
                    rationale: Some(note.clone()),
                });
                exit_notes.push(note);
                self.tp_tracking.remove(symbol);
                continue;
            }

            if pnl_pct <= cfg.stop_loss_pct {
                let note = format!(
                    "Stop Loss triggered for {symbol}: pnl={pnl_pct:.2}% <= {:.2}%, closing {:.4} and stopping the strategy",
                    cfg.stop_loss_pct,
                    quantity.abs()
                );
                warn!("{note}");
                items.push(TradeDecisionItem {
                    instrument,
                    action: close_action,
                    target_qty: quantity.abs(),
                    leverage: Some(1.0),
                    confidence: Some(1.0),
                    rationale: Some(note.clone()),
                });
                exit_notes.push(note);
                self.stopped_symbols.insert(symbol.clone());
                should_stop = true;
                continue;
            }
        }

        // ── 2. Grid rules for symbols without an exit action ─────────────
        for symbol in &symbols {
            if items.iter().any(|item| item.instrument.symbol == *symbol) {
                continue;
            }
            if self.stopped_symbols.contains(symbol) {
                noop_reasons.push(format!("{symbol}: stopped after stop-loss"));
                continue;
            }

            let Some(price) = prices.get(symbol).copied().filter(|p| *p > 0.0) else {
                noop_reasons.push(format!("{symbol}: missing or invalid price"));
                continue;
            };

            let (qty, avg) = context
                .portfolio
                .positions
                .get(symbol)
                .map(|p| (p.quantity, p.avg_price))
                .unwrap_or((0.0, 0.0));

            // Base order size per grid, raised to meet the venue floor.
            let mut base_qty = (equity * self.params.base_fraction) / price;
            if let Some(min_notional) = context
                .constraints
                .as_ref()
                .and_then(|c| c.min_notional)
                .filter(|mn| *mn > 0.0)
            {
                if base_qty * price < min_notional {
                    let min_qty = min_notional / price;
                    debug!(
                        symbol = %symbol,
                        base_qty,
                        min_qty,
                        "raising base_qty to meet min_notional"
                    );
                    base_qty = min_qty;
                }
            }
            if base_qty <= 0.0 {
                noop_reasons.push(format!(
                    "{symbol}: base_qty=0 (equity={equity:.4}, base_fraction={:.4})",
                    self.params.base_fraction
                ));
                continue;
            }

            let Some((prev_px, curr_px)) = self.resolve_prev_curr(context, symbol, price) else {
                noop_reasons.push(format!("{symbol}: prev/curr price unavailable"));
                continue;
            };

            let leverage = self.open_leverage(is_spot, context.constraints.as_ref());
            let instrument =
                InstrumentRef::new(symbol.clone(), self.request.exchange_config.exchange_id.clone());

            // Flat: open when the price crosses one full step.
            if qty.abs() <= self.settings.quantity_precision {
                let moved_down = curr_px <= prev_px * (1.0 - self.params.step_pct);
                let moved_up = curr_px >= prev_px * (1.0 + self.params.step_pct);
                if moved_down {
                    items.push(TradeDecisionItem {
                        instrument,
                        action: TradeAction::OpenLong,
                        target_qty: base_qty,
                        leverage: Some(leverage),
                        confidence: Some(1.0),
                        rationale: Some(format!(
                            "Grid open-long: crossed down >=1 step from {prev_px:.4} to {curr_px:.4}{}",
                            self.zone_suffix(avg)
                        )),
                    });
                } else if !is_spot && moved_up {
                    items.push(TradeDecisionItem {
                        instrument,
                        action: TradeAction::OpenShort,
                        target_qty: base_qty,
                        leverage: Some(leverage),
                        confidence: Some(1.0),
                        rationale: Some(format!(
                            "Grid open-short: crossed up >=1 step from {prev_px:.4} to {curr_px:.4}{}",
                            self.zone_suffix(avg)
                        )),
                    });
                } else {
                    noop_reasons.push(format!(
                        "{symbol}: no grid step crossed (prev={prev_px:.4}, curr={curr_px:.4})"
                    ));
                }
                continue;
            }

            if avg <= 0.0 {
                noop_reasons.push(format!("{symbol}: holding without avg price"));
                continue;
            }

            // Zone bounds: outside the configured window the grid stays idle.
            if self.params.grid_lower_pct.is_some() || self.params.grid_upper_pct.is_some() {
                let lower_bound = avg * (1.0 - self.params.grid_lower_pct.unwrap_or(0.0));
                let upper_bound = avg * (1.0 + self.params.grid_upper_pct.unwrap_or(0.0));
                if price < lower_bound || price > upper_bound {
                    noop_reasons.push(format!(
                        "{symbol}: price {price:.4} outside grid zone [{lower_bound:.4}, {upper_bound:.4}]"
                    ));
                    continue;
                }
            }

            let delta_idx = self.grid_index(curr_px, avg) - self.grid_index(prev_px, avg);
            if delta_idx == 0 {
                noop_reasons.push(format!(
                    "{symbol}: no grid index change (prev={prev_px:.4}, curr={curr_px:.4})"
                ));
                continue;
            }
            let applied_steps = delta_idx.unsigned_abs().min(self.params.max_steps as u64) as u32;
            let confidence = (applied_steps as f64 / self.params.max_steps.max(1) as f64).min(1.0);
            let add_qty = base_qty * applied_steps as f64;

            if qty > 0.0 {
                // Long: add on down-crossings, reduce on up-crossings.
                if delta_idx < 0 {
                    items.push(TradeDecisionItem {
                        instrument,
                        action: TradeAction::OpenLong,
                        target_qty: qty + add_qty,
                        leverage: Some(leverage),
                        confidence: Some(confidence),
                        rationale: Some(format!(
                            "Grid long add: crossed {} grid(s) down, applying {applied_steps} (prev={prev_px:.4} -> curr={curr_px:.4}) around avg {avg:.4}{}",
                            delta_idx.abs(),
                            self.zone_suffix(avg)
                        )),
                    });
                } else {
                    items.push(TradeDecisionItem {
                        instrument,
                        action: TradeAction::CloseLong,
                        target_qty: qty.abs().min(add_qty),
                        leverage: Some(1.0),
                        confidence: Some(confidence),
                        rationale: Some(format!(
                            "Grid long reduce: crossed {} grid(s) up, applying {applied_steps} (prev={prev_px:.4} -> curr={curr_px:.4}) around avg {avg:.4}{}",
                            delta_idx.abs(),
                            self.zone_suffix(avg)
                        )),
                    });
                }
            } else {
                // Short: add on up-crossings, cover on down-crossings.
                if delta_idx > 0 && !is_spot {
                    items.push(TradeDecisionItem {
                        instrument,
                        action: TradeAction::OpenShort,
                        target_qty: qty.abs() + add_qty,
                        leverage: Some(leverage),
                        confidence: Some(confidence),
                        rationale: Some(format!(
                            "Grid short add: crossed {} grid(s) up, applying {applied_steps} (prev={prev_px:.4} -> curr={curr_px:.4}) around avg {avg:.4}{}",
                            delta_idx.abs(),
                            self.zone_suffix(avg)
                        )),
                    });
                } else if delta_idx < 0 {
                    items.push(TradeDecisionItem {
                        instrument,
                        action: TradeAction::CloseShort,
                        target_qty: qty.abs().min(add_qty),
                        leverage: Some(1.0),
                        confidence: Some(confidence),
                        rationale: Some(format!(
                            "Grid short cover: crossed {} grid(s) down, applying {applied_steps} (prev={prev_px:.4} -> curr={curr_px:.4}) around avg {avg:.4}{}",
                            delta_idx.abs(),
                            self.zone_suffix(avg)
                        )),
                    });
                } else {
                    noop_reasons.push(format!(
                        "{symbol}: short position with no applicable crossing"
                    ));
                }
            }
        }

        // ── 3. Assemble rationale and normalize ──────────────────────────
        let params_desc = self.params_desc();
        let advisor_desc = self
            .advice_rationale
            .as_ref()
            .map(|r| format!("; advisor_rationale={r}"))
            .unwrap_or_default();
        let stopped_desc = if self.stopped_symbols.is_empty() {
            String::new()
        } else {
            let mut stopped: Vec<&String> = self.stopped_symbols.iter().collect();
            stopped.sort();
            format!(". STOPPED_SYMBOLS={stopped:?}")
        };
        let exits_desc = if exit_notes.is_empty() {
            String::new()
        } else {
            format!(" {}.", exit_notes.join("; "))
        };

        if items.is_empty() {
            let summary = if noop_reasons.is_empty() {
                "no triggers hit".to_string()
            } else {
                noop_reasons.join("; ")
            };
            debug!(compose_id = %context.compose_id, "grid composer produced no-op plan");
            return ComposeResult {
                instructions: Vec::new(),
                rationale: format!(
                    "Grid NOOP — reasons: {summary}. {params_desc}{advisor_desc}{stopped_desc}"
                ),
                should_stop,
            };
        }

        let plan = normalize_plan(
            &context.compose_id,
            &context.portfolio,
            &items,
            context.constraints.as_ref().unwrap_or(&VenueConstraints::default()),
            &prices,
            &self.settings,
        );

        let mut rationale =
            format!("Grid plan —{exits_desc} {params_desc}{advisor_desc}{stopped_desc}");
        if !plan.skipped.is_empty() {
            rationale.push_str(&format!(". Skipped: {}", plan.skipped.join("; ")));
        }

        ComposeResult {
            instructions: plan.instructions,
            rationale,
            should_stop,
        }
    }

    // -------------------------------------------------------------------------
    // Advisor refresh & application
    // -------------------------------------------------------------------------

    async fn refresh_advice(&mut self, context: &ComposeContext, ts: i64) {
        let Some(advisor) = &self.advisor else {
            return;
        };

        let should_refresh = match self.last_advice_ts {
            None => true,
            Some(last) => ts - last >= ADVICE_REFRESH_MS || !self.params_applied,
        };
        if !should_refresh {
            return;
        }

        let Some(advice) = advisor.advise(context, &self.params).await else {
            return;
        };

        let apply = !self.params_applied || self.market_changed(context);
        if apply {
            self.apply_advice(&advice);
            info!(
                step_pct = self.params.step_pct,
                max_steps = self.params.max_steps,
                base_fraction = self.params.base_fraction,
                "applied dynamic grid params"
            );
        } else {
            info!(
                threshold = MARKET_CHANGE_THRESHOLD,
                "suppressed grid param update in stable market"
            );
        }
        self.advice_rationale = advice.advisor_rationale.clone();
        self.last_advice_ts = Some(ts);
    }

    /// Apply advisory parameters with sanity clamps.
    pub(crate) fn apply_advice(&mut self, advice: &super::advisor::GridParamAdvice) {
        self.params.step_pct = advice.grid_step_pct.max(MIN_STEP_PCT);
        self.params.max_steps = advice.grid_max_steps.max(1);
        self.params.base_fraction = advice.grid_base_fraction.max(1e-6);

        let proposed_lower = advice.grid_lower_pct.unwrap_or(MIN_GRID_ZONE_PCT).max(0.0);
        let proposed_upper = advice.grid_upper_pct.unwrap_or(MIN_GRID_ZONE_PCT).max(0.0);
        self.params.grid_lower_pct = Some(proposed_lower.max(MIN_GRID_ZONE_PCT));
        self.params.grid_upper_pct = Some(proposed_upper.max(MIN_GRID_ZONE_PCT));

        if let Some(proposed_count) = advice.grid_count {
            let proposed_count = proposed_count.max(1);
            let count = match self.params.grid_count {
                Some(current) => {
                    let lower = current.saturating_sub(MAX_GRID_COUNT_DELTA).max(1);
                    let upper = current + MAX_GRID_COUNT_DELTA;
                    proposed_count.clamp(lower, upper)
                }
                None => proposed_count,
            };
            self.params.grid_count = Some(count);

            let total_span = self.params.grid_lower_pct.unwrap_or(0.0)
                + self.params.grid_upper_pct.unwrap_or(0.0);
            if total_span > 0.0 {
                self.params.step_pct = (total_span / count as f64).max(1e-6);
                self.params.max_steps = count;
            }
        }

        self.params_applied = true;
    }

    fn market_changed(&self, context: &ComposeContext) -> bool {
        self.max_abs_change_pct(context)
            .is_some_and(|change| change >= MARKET_CHANGE_THRESHOLD)
    }

    fn max_abs_change_pct(&self, context: &ComposeContext) -> Option<f64> {
        let symbols = &self.request.trading_config.symbols;
        context
            .features
            .iter()
            .filter(|fv| fv.symbol().is_some_and(|s| symbols.iter().any(|x| x == s)))
            .filter_map(|fv| {
                fv.number("change_pct").or_else(|| {
                    let last = fv.number("price.last")?;
                    let open = fv.number("price.open")?;
                    (open > 0.0).then(|| (last - open) / open)
                })
            })
            .map(f64::abs)
            .fold(None, |max, v| Some(max.map_or(v, |m: f64| m.max(v))))
    }

    // -------------------------------------------------------------------------
    // Grid helpers
    // -------------------------------------------------------------------------

    fn grid_index(&self, price: f64, avg: f64) -> i64 {
        ((price / avg - 1.0) / self.params.step_pct.max(1e-9)).floor() as i64
    }

    /// Previous/current price pair for crossing detection: snapshot open and
    /// last when present, otherwise a synthetic half-step previous.
    fn resolve_prev_curr(
        &self,
        context: &ComposeContext,
        symbol: &str,
        fallback_price: f64,
    ) -> Option<(f64, f64)> {
        for fv in &context.features {
            if fv.symbol() != Some(symbol) || fv.group_by() != Some(GROUP_MARKET_SNAPSHOT) {
                continue;
            }
            if let (Some(curr), Some(prev)) = (fv.number("price.last"), fv.number("price.open")) {
                if curr > 0.0 && prev > 0.0 {
                    return Some((prev, curr));
                }
            }
        }
        (fallback_price > 0.0)
            .then(|| (fallback_price * (1.0 - self.params.step_pct / 2.0), fallback_price))
    }

    fn open_leverage(&self, is_spot: bool, constraints: Option<&VenueConstraints>) -> f64 {
        if is_spot {
            return 1.0;
        }
        let configured = self.request.trading_config.max_leverage.max(1.0);
        match constraints.and_then(|c| c.max_leverage) {
            Some(venue_max) => configured.min(venue_max.max(1.0)),
            None => configured,
        }
    }

    fn zone_suffix(&self, avg: f64) -> String {
        match (self.params.grid_lower_pct, self.params.grid_upper_pct) {
            (None, None) => String::new(),
            (lower, upper) if avg > 0.0 => {
                let lower_bound = avg * (1.0 - lower.unwrap_or(0.0));
                let upper_bound = avg * (1.0 + upper.unwrap_or(0.0));
                format!(" — zone=[{lower_bound:.4}, {upper_bound:.4}]")
            }
            (lower, upper) => format!(
                " — zone_pct=[-{:.4}, +{:.4}]",
                lower.unwrap_or(0.0),
                upper.unwrap_or(0.0)
            ),
        }
    }

    fn params_desc(&self) -> String {
        let count_desc = self
            .params
            .grid_count
            .map(|c| format!(", count={c}"))
            .unwrap_or_default();
        format!(
            "params(step_pct={:.4}, max_steps={}, base_fraction={:.4}{count_desc})",
            self.params.step_pct, self.params.max_steps, self.params.base_fraction
        )
    }
}

impl std::fmt::Debug for GridComposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridComposer")
            .field("params", &self.params)
            .field("stopped_symbols", &self.stopped_symbols)
            .field("advisor", &self.advisor.is_some())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::advisor::GridParamAdvice;
    use crate::history::TradeDigest;
    use crate::portfolio::{PortfolioView, PositionSnapshot};
    use crate::types::{TradeSide, TradingMode};

    fn request(market_type: MarketType) -> UserRequest {
        let mut req: UserRequest = serde_json::from_str(
            r#"{
                "llm_model_config": {"provider": "openrouter", "model_id": "deepseek/deepseek-v3"},
                "exchange_config": {"exchange_id": "binance"},
                "trading_config": {"symbols": ["BTC/USDT"]}
            }"#,
        )
        .unwrap();
        req.exchange_config.market_type = market_type;
        req.exchange_config.trading_mode = TradingMode::Virtual;
        req.validate().unwrap();
        req
    }

    fn snapshot_feature(symbol: &str, last: f64, open: f64) -> FeatureVector {
        FeatureVector::new(
            1_730_000_000_000,
            Some(InstrumentRef::new(symbol, "binance")),
            GROUP_MARKET_SNAPSHOT,
        )
        .with_number("price.last", last)
        .with_number("price.open", open)
        .with_number("change_pct", if open > 0.0 { (last - open) / open } else { 0.0 })
    }

    fn context_with(
        portfolio: PortfolioView,
        features: Vec<FeatureVector>,
        constraints: Option<VenueConstraints>,
    ) -> ComposeContext {
        ComposeContext {
            ts: 1_730_000_000_000,
            compose_id: "compose-1".into(),
            strategy_id: "strategy-1".into(),
            features,
            portfolio,
            digest: TradeDigest {
                ts_ms: 0,
                by_instrument: Default::default(),
            },
            constraints,
        }
    }

    fn portfolio_flat(total_value: f64) -> PortfolioView {
        let mut view = PortfolioView::new("strategy-1", total_value);
        view.total_value = total_value;
        view.buying_power = total_value;
        view
    }

    fn portfolio_holding(
        symbol: &str,
        qty: f64,
        avg: f64,
        leverage: f64,
        total_value: f64,
    ) -> PortfolioView {
        let mut view = portfolio_flat(total_value);
        let mut pos = PositionSnapshot::new(InstrumentRef::new(symbol, "binance"));
        pos.quantity = qty;
        pos.avg_price = avg;
        pos.leverage = leverage;
        view.positions.insert(symbol.to_string(), pos);
        view
    }

    #[tokio::test]
    async fn opens_long_on_one_step_drop_from_flat() {
        let mut composer = GridComposer::new(request(MarketType::Spot)).with_params(GridParams {
            step_pct: 0.01,
            base_fraction: 0.10,
            ..Default::default()
        });
        let ctx = context_with(
            portfolio_flat(10_000.0),
            vec![snapshot_feature("BTC/USDT", 98.5, 100.0)],
            None,
        );

        let result = composer.compose(&ctx).await;
        assert_eq!(result.instructions.len(), 1);
        let instruction = &result.instructions[0];
        assert_eq!(instruction.side, TradeSide::Buy);
        assert_eq!(instruction.action, TradeAction::OpenLong);
        assert_eq!(instruction.instruction_id, "compose-1:BTC/USDT:0");
        let expected_qty = (10_000.0 * 0.10) / 98.5;
        assert!((instruction.quantity - expected_qty).abs() < 1e-6);
        assert!(!result.should_stop);
    }

    #[tokio::test]
    async fn spot_never_opens_short_on_rise() {
        let mut composer = GridComposer::new(request(MarketType::Spot)).with_params(GridParams {
            step_pct: 0.01,
            ..Default::default()
        });
        let ctx = context_with(
            portfolio_flat(10_000.0),
            vec![snapshot_feature("BTC/USDT", 102.0, 100.0)],
            None,
        );
        let result = composer.compose(&ctx).await;
        assert!(result.instructions.is_empty());
    }

    #[tokio::test]
    async fn derivative_opens_short_on_rise() {
        let mut composer =
            GridComposer::new(request(MarketType::Derivative)).with_params(GridParams {
                step_pct: 0.01,
                ..Default::default()
            });
        let ctx = context_with(
            portfolio_flat(10_000.0),
            vec![snapshot_feature("BTC/USDT", 102.0, 100.0)],
            None,
        );
        let result = composer.compose(&ctx).await;
        assert_eq!(result.instructions.len(), 1);
        assert_eq!(result.instructions[0].action, TradeAction::OpenShort);
        assert_eq!(result.instructions[0].side, TradeSide::Sell);
    }

    #[tokio::test]
    async fn stop_loss_closes_blacklists_and_requests_stop() {
        let mut composer = GridComposer::new(request(MarketType::Derivative));
        // Long 2 @ 100, mark 98, leverage 5: move -2%, pnl -10% <= -10%.
        let mut req = request(MarketType::Derivative);
        req.trading_config.take_profit_pct = 20.0;
        req.trading_config.stop_loss_pct = -10.0;
        composer.request = req;

        let ctx = context_with(
            portfolio_holding("BTC/USDT", 2.0, 100.0, 5.0, 10_000.0),
            vec![snapshot_feature("BTC/USDT", 98.0, 98.0)],
            None,
        );

        let result = composer.compose(&ctx).await;
        assert_eq!(result.instructions.len(), 1);
        let instruction = &result.instructions[0];
        assert_eq!(instruction.action, TradeAction::CloseLong);
        assert_eq!(instruction.side, TradeSide::Sell);
        assert!((instruction.quantity - 2.0).abs() < 1e-9);
        assert!(result.should_stop);
        assert!(result.rationale.contains("Stop Loss triggered"));
        assert!(composer.stopped_symbols().contains("BTC/USDT"));
    }

    #[tokio::test]
    async fn stopped_symbol_produces_no_further_instructions() {
        let mut composer = GridComposer::new(request(MarketType::Spot));
        composer.stopped_symbols.insert("BTC/USDT".into());

        let ctx = context_with(
            portfolio_flat(10_000.0),
            vec![snapshot_feature("BTC/USDT", 90.0, 100.0)],
            None,
        );
        let result = composer.compose(&ctx).await;
        assert!(result.instructions.is_empty());
        assert!(result.rationale.contains("stopped after stop-loss"));
    }

    #[tokio::test]
    async fn partial_tp_then_trailing_stop_sequence() {
        let mut req = request(MarketType::Spot);
        req.trading_config.partial_tp_enabled = true;
        req.trading_config.partial_tp_threshold_pct = 15.0;
        req.trading_config.partial_tp_close_ratio = 0.3;
        req.trading_config.trailing_stop_drawdown_pct = 3.0;
        let mut composer = GridComposer::new(req);

        // Cycle A: mark 115, pnl 15% -> partial close of 3.
        let ctx = context_with(
            portfolio_holding("BTC/USDT", 10.0, 100.0, 1.0, 10_000.0),
            vec![snapshot_feature("BTC/USDT", 115.0, 115.0)],
            None,
        );
        let result = composer.compose(&ctx).await;
        assert_eq!(result.instructions.len(), 1);
        assert!((result.instructions[0].quantity - 3.0).abs() < 1e-9);
        assert_eq!(result.instructions[0].action, TradeAction::CloseLong);

        // Cycle B: mark 118, pnl 18% -> peak tracks up, nothing closes.
        let ctx = context_with(
            portfolio_holding("BTC/USDT", 7.0, 100.0, 1.0, 10_000.0),
            vec![snapshot_feature("BTC/USDT", 118.0, 118.0)],
            None,
        );
        let result = composer.compose(&ctx).await;
        assert!(result.instructions.is_empty());

        // Cycle C: mark 114, pnl 14%, drawdown 4% >= 3% -> close remaining 7.
        let ctx = context_with(
            portfolio_holding("BTC/USDT", 7.0, 100.0, 1.0, 10_000.0),
            vec![snapshot_feature("BTC/USDT", 114.0, 114.0)],
            None,
        );
        let result = composer.compose(&ctx).await;
        assert_eq!(result.instructions.len(), 1);
        assert!((result.instructions[0].quantity - 7.0).abs() < 1e-9);
        assert!(result.rationale.contains("Trailing stop"));
    }

    #[tokio::test]
    async fn long_add_on_down_crossing_and_reduce_on_up() {
        let mut composer = GridComposer::new(request(MarketType::Spot)).with_params(GridParams {
            step_pct: 0.01,
            max_steps: 3,
            base_fraction: 0.10,
            ..Default::default()
        });

        // Holding 5 @ 100; price crossed from 100 down to 98.05 (2 grids).
        let ctx = context_with(
            portfolio_holding("BTC/USDT", 5.0, 100.0, 1.0, 10_000.0),
            vec![snapshot_feature("BTC/USDT", 98.05, 100.0)],
            None,
        );
        let result = composer.compose(&ctx).await;
        assert_eq!(result.instructions.len(), 1);
        let instruction = &result.instructions[0];
        assert_eq!(instruction.side, TradeSide::Buy);
        // Two crossings at base (10_000 * 0.10 / 98.05).
        let base = 10_000.0 * 0.10 / 98.05;
        assert!((instruction.quantity - base * 2.0).abs() < 1e-6);

        // Reduce: crossed up two grids.
        let mut composer = GridComposer::new(request(MarketType::Spot)).with_params(GridParams {
            step_pct: 0.01,
            max_steps: 3,
            base_fraction: 0.10,
            ..Default::default()
        });
        let ctx = context_with(
            portfolio_holding("BTC/USDT", 5.0, 100.0, 1.0, 10_000.0),
            vec![snapshot_feature("BTC/USDT", 102.1, 100.0)],
            None,
        );
        let result = composer.compose(&ctx).await;
        assert_eq!(result.instructions.len(), 1);
        assert_eq!(result.instructions[0].side, TradeSide::Sell);
        assert!(result.instructions[0].reduce_only());
    }

    #[tokio::test]
    async fn crossings_are_capped_by_max_steps() {
        let mut composer = GridComposer::new(request(MarketType::Spot)).with_params(GridParams {
            step_pct: 0.01,
            max_steps: 2,
            base_fraction: 0.10,
            ..Default::default()
        });
        // Five grids down; only two applied.
        let ctx = context_with(
            portfolio_holding("BTC/USDT", 5.0, 100.0, 1.0, 10_000.0),
            vec![snapshot_feature("BTC/USDT", 94.9, 100.0)],
            None,
        );
        let result = composer.compose(&ctx).await;
        let base = 10_000.0 * 0.10 / 94.9;
        assert!((result.instructions[0].quantity - base * 2.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn price_outside_zone_is_a_noop() {
        let mut composer = GridComposer::new(request(MarketType::Spot)).with_params(GridParams {
            step_pct: 0.01,
            grid_lower_pct: Some(0.10),
            grid_upper_pct: Some(0.10),
            ..Default::default()
        });
        // Price 85 is below avg*(1-0.10)=90.
        let ctx = context_with(
            portfolio_holding("BTC/USDT", 5.0, 100.0, 1.0, 10_000.0),
            vec![snapshot_feature("BTC/USDT", 85.0, 86.0)],
            None,
        );
        let result = composer.compose(&ctx).await;
        assert!(result.instructions.is_empty());
        assert!(result.rationale.contains("outside grid zone"));
    }

    #[tokio::test]
    async fn base_qty_is_raised_to_meet_min_notional() {
        let mut composer = GridComposer::new(request(MarketType::Spot)).with_params(GridParams {
            step_pct: 0.01,
            base_fraction: 0.0001,
            ..Default::default()
        });
        let constraints = VenueConstraints {
            min_notional: Some(50.0),
            ..Default::default()
        };
        let ctx = context_with(
            portfolio_flat(10_000.0),
            vec![snapshot_feature("BTC/USDT", 98.5, 100.0)],
            Some(constraints),
        );
        let result = composer.compose(&ctx).await;
        assert_eq!(result.instructions.len(), 1);
        // Raised from 10_000*0.0001/98.5 ≈ 0.01015 to 50/98.5.
        assert!((result.instructions[0].quantity - 50.0 / 98.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn no_positions_and_no_buying_power_short_circuits() {
        let mut composer = GridComposer::new(request(MarketType::Spot));
        let mut portfolio = portfolio_flat(0.0);
        portfolio.buying_power = 0.25;
        let ctx = context_with(
            portfolio,
            vec![snapshot_feature("BTC/USDT", 98.5, 100.0)],
            None,
        );
        let result = composer.compose(&ctx).await;
        assert!(result.instructions.is_empty());
        assert!(result.rationale.contains("insufficient buying power"));
    }

    // ── Advisor clamp behaviour ──────────────────────────────────────────

    #[test]
    fn advice_clamps_floor_values() {
        let mut composer = GridComposer::new(request(MarketType::Spot));
        composer.apply_advice(&GridParamAdvice {
            grid_step_pct: 0.0001,
            grid_max_steps: 0,
            grid_base_fraction: -1.0,
            grid_lower_pct: Some(0.02),
            grid_upper_pct: Some(0.05),
            grid_count: None,
            advisor_rationale: None,
        });

        assert!((composer.params.step_pct - 0.003).abs() < 1e-12);
        assert_eq!(composer.params.max_steps, 1);
        assert!(composer.params.base_fraction > 0.0);
        // Zone floors at ±10%.
        assert!((composer.params.grid_lower_pct.unwrap() - 0.10).abs() < 1e-12);
        assert!((composer.params.grid_upper_pct.unwrap() - 0.10).abs() < 1e-12);
    }

    #[test]
    fn grid_count_changes_are_rate_limited() {
        let mut composer = GridComposer::new(request(MarketType::Spot));
        composer.params.grid_count = Some(10);
        composer.apply_advice(&GridParamAdvice {
            grid_step_pct: 0.005,
            grid_max_steps: 3,
            grid_base_fraction: 0.08,
            grid_lower_pct: Some(0.10),
            grid_upper_pct: Some(0.10),
            grid_count: Some(20),
            advisor_rationale: None,
        });
        // 10 ± 2 caps the jump at 12.
        assert_eq!(composer.params.grid_count, Some(12));
    }

    #[test]
    fn zone_and_count_derive_step_and_max_steps() {
        let mut composer = GridComposer::new(request(MarketType::Spot));
        composer.apply_advice(&GridParamAdvice {
            grid_step_pct: 0.005,
            grid_max_steps: 3,
            grid_base_fraction: 0.08,
            grid_lower_pct: Some(0.15),
            grid_upper_pct: Some(0.25),
            grid_count: Some(8),
            advisor_rationale: None,
        });
        // step = (0.15 + 0.25) / 8 = 0.05; max_steps = 8.
        assert!((composer.params.step_pct - 0.05).abs() < 1e-12);
        assert_eq!(composer.params.max_steps, 8);
    }
}
