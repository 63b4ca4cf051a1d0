// =============================================================================
// Decision Coordinator — one end-to-end cycle of the strategy pipeline
// =============================================================================
//
// Per cycle: portfolio view → LIVE reconciliation → features → compose
// context → composer → execution gateway → trade records → portfolio apply →
// strategy summary → four history records → digest.
//
// Recoverable failures (data, compose, execution, reconcile) degrade inside
// `run_once` and surface through the rationale and summary; only fatal
// programmer errors propagate.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::UserRequest;
use crate::decision::{ComposeContext, ComposeResult, Composer, VenueConstraints};
use crate::error::EngineError;
use crate::exchange::ExchangeAdapter;
use crate::execution::{ExecutionGateway, Meta, TradeInstruction, TxResult};
use crate::features::{extract_market_snapshot_features, FeatureVector};
use crate::features::pipeline::FeaturesPipeline;
use crate::history::{
    DigestBuilder, HistoryRecord, HistoryRecorder, RecordKind, TradeDigest, TradeHistoryEntry,
};
use crate::instrument::canonical_symbol_key;
use crate::portfolio::{PortfolioService, PortfolioView, PositionSnapshot};
use crate::types::{
    generate_id, timestamp_ms, MarketType, PriceMode, StopReason, StrategyStatus, StrategySummary,
    TradeAction, TradeSide, TradeType, TradingMode,
};

/// Close-detection tolerance on quantity comparison.
const CLOSE_EPSILON: f64 = 1e-12;

/// Everything produced by one decision cycle.
#[derive(Debug, Clone)]
pub struct DecisionCycleResult {
    pub compose_id: String,
    pub timestamp_ms: i64,
    pub cycle_index: u64,
    pub rationale: String,
    pub strategy_summary: StrategySummary,
    pub instructions: Vec<TradeInstruction>,
    pub trades: Vec<TradeHistoryEntry>,
    pub history_records: Vec<HistoryRecord>,
    pub digest: TradeDigest,
    pub portfolio_view: PortfolioView,
}

/// Persistence collaborator. Implementations deduplicate on `trade_id` for
/// trades and `(strategy_id, ts_ms)` for portfolio snapshots.
#[async_trait]
pub trait PersistenceHook: Send + Sync {
    async fn save_trade(&self, trade: &TradeHistoryEntry);
    async fn save_portfolio(&self, view: &PortfolioView);
}

/// Drives the full decision pipeline for one strategy.
pub struct DecisionCoordinator {
    request: UserRequest,
    strategy_id: String,
    strategy_name: String,
    portfolio: Arc<PortfolioService>,
    pipeline: Arc<FeaturesPipeline>,
    composer: Composer,
    gateway: Arc<dyn ExecutionGateway>,
    recorder: Arc<HistoryRecorder>,
    digest_builder: DigestBuilder,
    adapter: Option<Arc<dyn ExchangeAdapter>>,
    persistence: Option<Arc<dyn PersistenceHook>>,
    constraints: VenueConstraints,
    realized_pnl: f64,
    unrealized_pnl: f64,
    cycle_index: u64,
    closed: bool,
}

impl DecisionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request: UserRequest,
        strategy_id: impl Into<String>,
        portfolio: Arc<PortfolioService>,
        pipeline: Arc<FeaturesPipeline>,
        composer: Composer,
        gateway: Arc<dyn ExecutionGateway>,
        recorder: Arc<HistoryRecorder>,
        digest_builder: DigestBuilder,
    ) -> Self {
        let strategy_id = strategy_id.into();
        let strategy_name = request.display_name(&strategy_id);
        let constraints = VenueConstraints {
            max_positions: Some(request.trading_config.max_positions),
            max_leverage: Some(request.trading_config.max_leverage),
            ..Default::default()
        };
        Self {
            request,
            strategy_id,
            strategy_name,
            portfolio,
            pipeline,
            composer,
            gateway,
            recorder,
            digest_builder,
            adapter: None,
            persistence: None,
            constraints,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            cycle_index: 0,
            closed: false,
        }
    }

    /// Attach the exchange adapter used for LIVE reconciliation.
    pub fn with_adapter(mut self, adapter: Arc<dyn ExchangeAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn with_persistence(mut self, hook: Arc<dyn PersistenceHook>) -> Self {
        self.persistence = Some(hook);
        self
    }

    /// Merge venue filters into the compose constraints.
    pub fn with_venue_filters(mut self, filters: VenueConstraints) -> Self {
        self.constraints = VenueConstraints {
            max_positions: self.constraints.max_positions,
            max_leverage: self.constraints.max_leverage.or(filters.max_leverage),
            quantity_step: filters.quantity_step,
            min_trade_qty: filters.min_trade_qty,
            max_order_qty: filters.max_order_qty,
            max_position_qty: filters.max_position_qty,
            min_notional: filters.min_notional,
        };
        self
    }

    pub fn strategy_id(&self) -> &str {
        &self.strategy_id
    }

    pub fn cycle_index(&self) -> u64 {
        self.cycle_index
    }

    // =========================================================================
    // run_once
    // =========================================================================

    pub async fn run_once(&mut self) -> Result<DecisionCycleResult, EngineError> {
        let ts = timestamp_ms();
        let compose_id = generate_id("compose");

        // ── 1. Portfolio view, reconciled against the exchange in LIVE ──
        if self.request.exchange_config.trading_mode == TradingMode::Live {
            if let Err(e) = self.reconcile_live().await {
                warn!(
                    strategy_id = %self.strategy_id,
                    error = %e,
                    "reconciliation failed, using cached portfolio view"
                );
            }
        }
        let portfolio = self.portfolio.get_view();

        // ── 2. Features ─────────────────────────────────────────────────
        let features = self.pipeline.build().await;
        let market_features = extract_market_snapshot_features(&features);

        // ── 3. Compose ──────────────────────────────────────────────────
        let digest = self.digest_builder.build(&self.recorder.get_records());
        let context = ComposeContext {
            ts,
            compose_id: compose_id.clone(),
            strategy_id: self.strategy_id.clone(),
            features: features.clone(),
            portfolio,
            digest,
            constraints: Some(self.constraints.clone()),
        };
        let ComposeResult {
            instructions,
            mut rationale,
            should_stop,
        } = self.composer.compose(&context).await;

        info!(
            strategy_id = %self.strategy_id,
            compose_id = %compose_id,
            count = instructions.len(),
            "composer returned instructions"
        );

        // ── 4. Execute ──────────────────────────────────────────────────
        let tx_results = if instructions.is_empty() {
            Vec::new()
        } else {
            self.gateway.execute(&instructions, &market_features).await
        };

        // ── 5. Drop failed instructions, annotate the rationale ─────────
        let mut failed_ids: HashSet<String> = HashSet::new();
        let mut failure_msgs: Vec<String> = Vec::new();
        for tx in &tx_results {
            if !tx.status.is_fill() {
                failed_ids.insert(tx.instruction_id.clone());
                let reason = tx.reason.clone().unwrap_or_else(|| "Unknown error".into());
                warn!(
                    instruction_id = %tx.instruction_id,
                    symbol = %tx.instrument.symbol,
                    status = %tx.status,
                    reason = %reason,
                    "instruction failed"
                );
                failure_msgs.push(format!(
                    "Skipped {} {} qty={}: {reason}",
                    tx.instrument.symbol, tx.side, tx.requested_qty
                ));
            }
        }
        if !failure_msgs.is_empty() {
            rationale.push_str("\n\n**Execution Warnings:**\n");
            for msg in &failure_msgs {
                rationale.push_str(&format!("- {msg}\n"));
            }
        }
        let instructions: Vec<TradeInstruction> = instructions
            .into_iter()
            .filter(|i| !failed_ids.contains(&i.instruction_id))
            .collect();

        // ── 6. Trades + portfolio apply ─────────────────────────────────
        let (trades, fills) = self.create_trades(&tx_results, &compose_id, ts);
        self.portfolio.apply_trades(&fills, &market_features);

        // ── 7. Summary + history + digest ───────────────────────────────
        let mut summary = self.build_summary(ts);
        summary.realized_pnl = {
            let delta: f64 = trades.iter().filter_map(|t| t.realized_pnl).sum();
            self.realized_pnl += delta;
            self.realized_pnl
        };
        // Recompute derived ratios now that realized PnL moved.
        if summary.total_value > 0.0 {
            summary.pnl_pct =
                Some((summary.realized_pnl + summary.unrealized_pnl) / summary.total_value);
        }

        let history_records =
            self.create_history_records(ts, &compose_id, &features, &instructions, &trades, &summary);
        for record in &history_records {
            self.recorder.record(record.clone());
        }
        let digest = self.digest_builder.build(&self.recorder.get_records());

        // ── 8. Stop handling ────────────────────────────────────────────
        if should_stop {
            warn!(strategy_id = %self.strategy_id, "composer requested stop");
            summary.status = StrategyStatus::Stopped;
            let stop_reason = if rationale.contains("Stop Loss") || rationale.contains("STOP LOSS")
            {
                summary.metadata.insert(
                    "stop_reason_detail".into(),
                    "Stop loss threshold exceeded".into(),
                );
                StopReason::StopLoss
            } else {
                StopReason::NormalExit
            };
            summary
                .metadata
                .insert("stop_reason".into(), stop_reason.to_string());
        }

        // ── 9. Persist ──────────────────────────────────────────────────
        let portfolio_view = self.portfolio.get_view();
        if let Some(hook) = &self.persistence {
            for trade in &trades {
                hook.save_trade(trade).await;
            }
            hook.save_portfolio(&portfolio_view).await;
        }

        self.cycle_index += 1;

        Ok(DecisionCycleResult {
            compose_id,
            timestamp_ms: ts,
            cycle_index: self.cycle_index,
            rationale,
            strategy_summary: summary,
            instructions,
            trades,
            history_records,
            digest,
            portfolio_view,
        })
    }

    // =========================================================================
    // LIVE reconciliation
    // =========================================================================

    /// Overwrite the local view with exchange truth: balances always,
    /// positions for derivatives. Local positions absent on the exchange are
    /// zeroed.
    async fn reconcile_live(&mut self) -> Result<(), EngineError> {
        let adapter = self
            .adapter
            .as_ref()
            .ok_or_else(|| EngineError::Reconcile("no exchange adapter attached".into()))?
            .clone();

        let balance = adapter
            .fetch_balance()
            .await
            .map_err(|e| EngineError::Reconcile(format!("balance fetch failed: {e}")))?;

        let market_type = self.request.exchange_config.market_type;
        let exchange_id = self.request.exchange_config.exchange_id.clone();

        let exchange_positions = if market_type == MarketType::Derivative {
            adapter
                .fetch_positions(&self.request.trading_config.symbols)
                .await
                .map_err(|e| EngineError::Reconcile(format!("position fetch failed: {e}")))?
        } else {
            Vec::new()
        };

        self.portfolio.reconcile(|view| {
            match market_type {
                MarketType::Spot => {
                    view.account_balance = balance.free_cash;
                    view.buying_power = view.account_balance.max(0.0);
                    view.free_cash = balance.free_cash;
                }
                MarketType::Derivative => {
                    view.account_balance = balance.total_equity;
                    view.buying_power = balance.free_cash;
                    view.free_cash = balance.free_cash;
                }
            }

            if market_type != MarketType::Derivative {
                return;
            }

            let mut seen: HashSet<String> = HashSet::new();
            for exchange_pos in &exchange_positions {
                let symbol = canonical_symbol_key(&exchange_pos.symbol);
                seen.insert(symbol.clone());

                let position = view.positions.entry(symbol.clone()).or_insert_with(|| {
                    warn!(symbol = %symbol, "creating missing position from exchange");
                    PositionSnapshot::new(crate::instrument::InstrumentRef::new(
                        symbol.clone(),
                        exchange_id.clone(),
                    ))
                });

                let drift = (position.quantity - exchange_pos.signed_qty).abs();
                if drift > CLOSE_EPSILON && position.quantity != 0.0 {
                    warn!(
                        symbol = %symbol,
                        local_qty = position.quantity,
                        exchange_qty = exchange_pos.signed_qty,
                        "position drift detected, exchange is source of truth"
                    );
                }

                position.quantity = exchange_pos.signed_qty;
                position.avg_price = exchange_pos.entry_price;
                position.mark_price = Some(exchange_pos.mark_price);
                position.unrealized_pnl = Some(exchange_pos.unrealized_pnl);
                position.leverage = exchange_pos.leverage.max(1.0);
                position.notional = Some(exchange_pos.notional);
                position.trade_type = if exchange_pos.signed_qty >= 0.0 {
                    TradeType::Long
                } else {
                    TradeType::Short
                };
                let entry_notional = exchange_pos.signed_qty.abs() * exchange_pos.entry_price;
                position.unrealized_pnl_pct = (entry_notional > 0.0)
                    .then(|| exchange_pos.unrealized_pnl / entry_notional * 100.0);
            }

            // Local positions absent on the exchange are closed.
            for (symbol, position) in view.positions.iter_mut() {
                if !seen.contains(symbol) && position.quantity != 0.0 {
                    warn!(
                        symbol = %symbol,
                        local_qty = position.quantity,
                        "clearing stale local position not present on exchange"
                    );
                    position.quantity = 0.0;
                    position.unrealized_pnl = Some(0.0);
                    position.unrealized_pnl_pct = None;
                }
            }
        });

        debug!(strategy_id = %self.strategy_id, "live reconciliation complete");
        Ok(())
    }

    // =========================================================================
    // Close detection
    // =========================================================================

    /// Convert fills into trade records (for history) and fill entries (for
    /// portfolio application). A fill that fully closes a prior position
    /// becomes a round-trip record referencing the original open; a partial
    /// reduce pairs itself with the most recent open trade in history.
    fn create_trades(
        &self,
        tx_results: &[TxResult],
        compose_id: &str,
        ts: i64,
    ) -> (Vec<TradeHistoryEntry>, Vec<TradeHistoryEntry>) {
        let pre_view = self.portfolio.get_view();
        let mut trades = Vec::new();
        let mut fills = Vec::new();

        for tx in tx_results {
            if !tx.status.is_fill() || tx.filled_qty <= 0.0 {
                continue;
            }

            let qty = tx.filled_qty;
            let price = tx.avg_exec_price.unwrap_or(0.0);
            let fee = tx.fee_cost.unwrap_or(0.0);
            let notional = (price > 0.0).then(|| price * qty);
            let symbol = tx.instrument.canonical_key();

            let prev = pre_view.positions.get(&symbol);
            let prev_qty = prev.map(|p| p.quantity).unwrap_or(0.0);

            // Direction opposing the prior position closes it.
            let (close_units, position_type) = match prev {
                Some(_) if prev_qty > 0.0 && tx.side == TradeSide::Sell => {
                    (qty.min(prev_qty.abs()), Some(TradeType::Long))
                }
                Some(_) if prev_qty < 0.0 && tx.side == TradeSide::Buy => {
                    (qty.min(prev_qty.abs()), Some(TradeType::Short))
                }
                _ => (0.0, None),
            };
            let is_closing = close_units > 0.0;
            let is_full_close = is_closing && close_units >= prev_qty.abs() - CLOSE_EPSILON;

            let trade = if let (true, Some(prev)) = (is_full_close, prev) {
                let entry_price = prev.avg_price;
                let entry_ts = prev.entry_ts.unwrap_or(ts);
                let direction = position_type.unwrap_or(TradeType::Long);
                let core_pnl = match direction {
                    TradeType::Long => (price - entry_price) * close_units,
                    TradeType::Short => (entry_price - price) * close_units,
                };
                let realized_pnl = core_pnl - fee;
                let notional_entry =
                    (entry_price > 0.0).then(|| entry_price * close_units);
                let realized_pnl_pct = notional_entry
                    .filter(|n| *n > 0.0)
                    .map(|n| realized_pnl / n);

                TradeHistoryEntry {
                    trade_id: generate_id("trade"),
                    compose_id: compose_id.to_string(),
                    instruction_id: tx.instruction_id.clone(),
                    strategy_id: self.strategy_id.clone(),
                    instrument: tx.instrument.clone(),
                    side: tx.side,
                    trade_type: direction,
                    quantity: close_units,
                    entry_price: Some(entry_price),
                    avg_exec_price: tx.avg_exec_price,
                    exit_price: tx.avg_exec_price,
                    notional_entry,
                    notional_exit: (price > 0.0).then(|| price * close_units),
                    entry_ts,
                    exit_ts: Some(ts),
                    trade_ts: ts,
                    holding_ms: Some(ts - entry_ts),
                    unrealized_pnl: 0.0,
                    realized_pnl: Some(realized_pnl),
                    realized_pnl_pct,
                    leverage: Some(prev.leverage).filter(|l| *l > 0.0).or(tx.leverage),
                    fee_cost: (fee > 0.0).then_some(fee),
                    note: meta_rationale(&tx.meta),
                }
            } else {
                // Opens, increases, and partial reduces.
                let mut note = meta_rationale(&tx.meta);
                if is_closing {
                    if let Some(paired_id) = self.recorder.pair_exit(&symbol, price, ts, qty) {
                        let suffix = format!("paired_exit_of:{paired_id}");
                        note = Some(match note {
                            Some(existing) => format!("{existing} {suffix}"),
                            None => suffix,
                        });
                    }
                }

                let realized_pnl = notional.map(|_| -fee);
                TradeHistoryEntry {
                    trade_id: generate_id("trade"),
                    compose_id: compose_id.to_string(),
                    instruction_id: tx.instruction_id.clone(),
                    strategy_id: self.strategy_id.clone(),
                    instrument: tx.instrument.clone(),
                    side: tx.side,
                    trade_type: match tx.side {
                        TradeSide::Buy => TradeType::Long,
                        TradeSide::Sell => TradeType::Short,
                    },
                    quantity: qty,
                    entry_price: (price > 0.0).then_some(price),
                    avg_exec_price: tx.avg_exec_price,
                    exit_price: None,
                    notional_entry: notional,
                    notional_exit: None,
                    entry_ts: ts,
                    exit_ts: None,
                    trade_ts: ts,
                    holding_ms: None,
                    unrealized_pnl: 0.0,
                    realized_pnl,
                    realized_pnl_pct: realized_pnl
                        .zip(notional.filter(|n| *n > 0.0))
                        .map(|(pnl, n)| pnl / n),
                    leverage: tx.leverage,
                    fee_cost: (fee > 0.0).then_some(fee),
                    note,
                }
            };

            // The portfolio applies the raw fill, not the close-units view.
            let mut fill = trade.clone();
            fill.quantity = qty;
            fill.avg_exec_price = tx.avg_exec_price;
            fills.push(fill);
            trades.push(trade);
        }

        (trades, fills)
    }

    // =========================================================================
    // Summary
    // =========================================================================

    fn build_summary(&mut self, ts: i64) -> StrategySummary {
        let view = self.portfolio.get_view();
        let unrealized = view.total_unrealized_pnl;
        let equity = if view.total_value > 0.0 {
            view.total_value
        } else {
            // View degraded: fall back to the internal accumulator.
            self.request
                .trading_config
                .initial_capital
                .map(|capital| capital + unrealized)
                .unwrap_or(0.0)
        };
        self.unrealized_pnl = unrealized;

        let unrealized_pnl_pct = (equity > 0.0).then(|| unrealized / equity * 100.0);
        let pnl_pct = (equity > 0.0).then(|| (self.realized_pnl + unrealized) / equity);

        StrategySummary {
            strategy_id: self.strategy_id.clone(),
            name: self.strategy_name.clone(),
            model_provider: self.request.llm_model_config.provider.clone(),
            model_id: self.request.llm_model_config.model_id.clone(),
            exchange_id: self.request.exchange_config.exchange_id.clone(),
            mode: self.request.exchange_config.trading_mode,
            status: StrategyStatus::Running,
            realized_pnl: self.realized_pnl,
            unrealized_pnl: unrealized,
            unrealized_pnl_pct,
            pnl_pct,
            total_value: equity,
            last_updated_ts: ts,
            metadata: Default::default(),
        }
    }

    fn create_history_records(
        &self,
        ts: i64,
        compose_id: &str,
        features: &[FeatureVector],
        instructions: &[TradeInstruction],
        trades: &[TradeHistoryEntry],
        summary: &StrategySummary,
    ) -> Vec<HistoryRecord> {
        let record = |kind: RecordKind, payload: serde_json::Value| HistoryRecord {
            ts_ms: ts,
            kind,
            reference_id: compose_id.to_string(),
            payload,
        };

        vec![
            record(
                RecordKind::Features,
                serde_json::json!({ "features": features }),
            ),
            record(
                RecordKind::Compose,
                serde_json::json!({ "summary": summary }),
            ),
            record(
                RecordKind::Instructions,
                serde_json::json!({ "instructions": instructions }),
            ),
            record(
                RecordKind::Execution,
                serde_json::json!({ "trades": trades }),
            ),
        ]
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Close every non-zero position with reduce-only market orders and
    /// apply the resulting trades. Records execution history only.
    pub async fn close_all_positions(&mut self) -> Vec<TradeHistoryEntry> {
        info!(strategy_id = %self.strategy_id, "closing all positions");

        let portfolio = self.portfolio.get_view();
        let compose_id = generate_id("close-all");
        let ts = timestamp_ms();

        let mut instructions = Vec::new();
        for (symbol, pos) in portfolio.open_positions() {
            let quantity = pos.quantity;
            let side = TradeSide::closing(quantity);
            let action = if quantity > 0.0 {
                TradeAction::CloseLong
            } else {
                TradeAction::CloseShort
            };

            let mut meta = Meta::new();
            meta.insert(
                "rationale".into(),
                serde_json::json!("Strategy stopped: closing all positions"),
            );
            meta.insert("reduceOnly".into(), serde_json::json!(true));

            instructions.push(TradeInstruction {
                instruction_id: generate_id("inst"),
                compose_id: compose_id.clone(),
                instrument: pos.instrument.clone(),
                action,
                side,
                quantity: quantity.abs(),
                price_mode: PriceMode::Market,
                limit_price: None,
                max_slippage_bps: 25,
                leverage: None,
                meta,
            });
            debug!(symbol = %symbol, side = %side, qty = quantity.abs(), "close instruction built");
        }

        if instructions.is_empty() {
            info!(strategy_id = %self.strategy_id, "no open positions to close");
            return Vec::new();
        }

        // Paper execution needs snapshot pricing; live venues price market
        // orders themselves.
        let market_features =
            if self.request.exchange_config.trading_mode == TradingMode::Virtual {
                let features = self.pipeline.build().await;
                extract_market_snapshot_features(&features)
            } else {
                Vec::new()
            };

        let tx_results = self.gateway.execute(&instructions, &market_features).await;
        let (trades, fills) = self.create_trades(&tx_results, &compose_id, ts);
        self.portfolio.apply_trades(&fills, &market_features);

        if !trades.is_empty() {
            self.recorder.record(HistoryRecord {
                ts_ms: ts,
                kind: RecordKind::Execution,
                reference_id: compose_id,
                payload: serde_json::json!({ "trades": trades }),
            });
        }
        if let Some(hook) = &self.persistence {
            for trade in &trades {
                hook.save_trade(trade).await;
            }
            hook.save_portfolio(&self.portfolio.get_view()).await;
        }

        info!(
            strategy_id = %self.strategy_id,
            count = trades.len(),
            "close-all generated trades"
        );
        trades
    }

    /// Release gateway and pipeline resources. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.gateway.close().await;
        self.pipeline.close().await;
        if let Some(adapter) = &self.adapter {
            adapter.close().await;
        }
        info!(strategy_id = %self.strategy_id, "coordinator closed");
    }
}

fn meta_rationale(meta: &Meta) -> Option<String> {
    meta.get("rationale")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

impl std::fmt::Debug for DecisionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionCoordinator")
            .field("strategy_id", &self.strategy_id)
            .field("cycle_index", &self.cycle_index)
            .field("mode", &self.request.exchange_config.trading_mode)
            .finish()
    }
}
