// =============================================================================
// Portfolio Service — cash, positions, and PnL for one strategy
// =============================================================================
//
// The service owns a single mutable `PortfolioView` behind one lock. Writes
// come only from `apply_trades` and LIVE reconciliation, both driven by the
// coordinator's single-threaded cycle; every read returns a cloned snapshot.
//
// Accounting conventions:
//   - `cash` is the running ledger: BUY subtracts notional + fee, SELL adds
//     notional − fee.
//   - Spot:       account_balance = cash,
//                 total_value = cash + Σ|qty|·mark.
//   - Derivative (VIRTUAL): account_balance = cash + Σ(signed qty · avg)
//                 (ledger cash plus cost basis locked in positions),
//                 total_value = account_balance + total_unrealized_pnl,
//                 buying_power = free margin (equity − used margin).
//   - LIVE: reconciliation overwrites account_balance and buying_power with
//     exchange truth; recomputation preserves them.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::features::{price_map, FeatureVector};
use crate::history::TradeHistoryEntry;
use crate::instrument::InstrumentRef;
use crate::types::{timestamp_ms, MarketType, TradeSide, TradeType, TradingMode};

/// Quantities at or below this magnitude are treated as zero.
pub const QUANTITY_PRECISION: f64 = 1e-9;

// =============================================================================
// Position & view models
// =============================================================================

/// One open position. `quantity` is signed: positive long, negative short.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub instrument: InstrumentRef,
    pub quantity: f64,
    pub avg_price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mark_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unrealized_pnl: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unrealized_pnl_pct: Option<f64>,
    pub leverage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notional: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_ts: Option<i64>,
    pub trade_type: TradeType,
}

impl PositionSnapshot {
    pub fn new(instrument: InstrumentRef) -> Self {
        Self {
            instrument,
            quantity: 0.0,
            avg_price: 0.0,
            mark_price: None,
            unrealized_pnl: None,
            unrealized_pnl_pct: None,
            leverage: 1.0,
            notional: None,
            entry_ts: None,
            trade_type: TradeType::Long,
        }
    }

    /// A position at or below quantity precision is considered closed.
    pub fn is_closed(&self) -> bool {
        self.quantity.abs() <= QUANTITY_PRECISION
    }
}

/// Consistent snapshot of one strategy's holdings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioView {
    pub ts_ms: i64,
    pub strategy_id: String,
    pub cash: f64,
    pub account_balance: f64,
    pub buying_power: f64,
    pub free_cash: f64,
    pub positions: HashMap<String, PositionSnapshot>,
    pub total_value: f64,
    pub total_unrealized_pnl: f64,
    pub available_cash: f64,
}

impl PortfolioView {
    pub fn new(strategy_id: impl Into<String>, initial_capital: f64) -> Self {
        Self {
            ts_ms: timestamp_ms(),
            strategy_id: strategy_id.into(),
            cash: initial_capital,
            account_balance: initial_capital,
            buying_power: initial_capital.max(0.0),
            free_cash: initial_capital,
            positions: HashMap::new(),
            total_value: initial_capital,
            total_unrealized_pnl: 0.0,
            available_cash: initial_capital,
        }
    }

    /// Non-zero positions only.
    pub fn open_positions(&self) -> impl Iterator<Item = (&String, &PositionSnapshot)> {
        self.positions.iter().filter(|(_, p)| !p.is_closed())
    }
}

// =============================================================================
// Portfolio Service
// =============================================================================

/// In-memory portfolio service for one strategy runtime.
pub struct PortfolioService {
    view: RwLock<PortfolioView>,
    market_type: MarketType,
    trading_mode: TradingMode,
}

impl PortfolioService {
    pub fn new(
        strategy_id: impl Into<String>,
        initial_capital: f64,
        market_type: MarketType,
        trading_mode: TradingMode,
    ) -> Self {
        Self {
            view: RwLock::new(PortfolioView::new(strategy_id, initial_capital)),
            market_type,
            trading_mode,
        }
    }

    /// Consistent snapshot with a refreshed timestamp.
    pub fn get_view(&self) -> PortfolioView {
        let mut view = self.view.read().clone();
        view.ts_ms = timestamp_ms();
        view
    }

    /// Mutate the view in place (LIVE reconciliation). The closure runs under
    /// the write lock; totals are recomputed afterwards with the caller's
    /// account figures preserved.
    pub fn reconcile<F: FnOnce(&mut PortfolioView)>(&self, f: F) {
        let mut view = self.view.write();
        f(&mut view);
        Self::recompute_synced_totals(&mut view, self.market_type);
    }

    /// Apply executed fills transactionally and recompute all derived fields.
    ///
    /// Each entry's `quantity` is the executed fill quantity; zero-crossing
    /// fills close the old position and open the opposite direction at the
    /// execution price.
    pub fn apply_trades(&self, trades: &[TradeHistoryEntry], market_features: &[FeatureVector]) {
        if trades.is_empty() && market_features.is_empty() {
            return;
        }

        let prices = price_map(market_features);
        let mut view = self.view.write();

        for trade in trades {
            let symbol = trade.instrument.canonical_key();
            let exec_price = trade
                .avg_exec_price
                .or_else(|| prices.get(&symbol).copied())
                .unwrap_or(0.0);
            if exec_price <= 0.0 || trade.quantity <= 0.0 {
                debug!(symbol = %symbol, "skipping trade apply without price or quantity");
                continue;
            }

            let qty = trade.quantity;
            let fee = trade.fee_cost.unwrap_or(0.0);
            let signed_delta = match trade.side {
                TradeSide::Buy => qty,
                TradeSide::Sell => -qty,
            };

            let position = view
                .positions
                .entry(symbol.clone())
                .or_insert_with(|| PositionSnapshot::new(trade.instrument.clone()));

            let prev_qty = position.quantity;
            let new_qty = prev_qty + signed_delta;

            if prev_qty.abs() <= QUANTITY_PRECISION {
                // Opening from flat.
                position.avg_price = exec_price;
                position.entry_ts = Some(trade.trade_ts);
            } else if prev_qty.signum() == signed_delta.signum() {
                // Same-direction add: weighted average in.
                position.avg_price = (position.avg_price * prev_qty.abs()
                    + exec_price * qty)
                    / (prev_qty.abs() + qty);
            } else if prev_qty.signum() != new_qty.signum() && new_qty.abs() > QUANTITY_PRECISION {
                // Crossed zero: leftover opens the opposite direction.
                position.avg_price = exec_price;
                position.entry_ts = Some(trade.trade_ts);
            }
            // Plain reduce keeps avg_price and entry_ts.

            position.quantity = new_qty;
            position.mark_price = Some(exec_price);
            if let Some(lev) = trade.leverage {
                position.leverage = lev.max(1.0);
            }
            position.trade_type = if new_qty >= 0.0 {
                TradeType::Long
            } else {
                TradeType::Short
            };

            let notional = exec_price * qty;
            match trade.side {
                TradeSide::Buy => view.cash -= notional + fee,
                TradeSide::Sell => view.cash += notional - fee,
            }

            debug!(
                symbol = %symbol,
                side = %trade.side,
                qty,
                exec_price,
                prev_qty,
                new_qty,
                cash = view.cash,
                "trade applied"
            );
        }

        // Drop positions at or below quantity precision.
        view.positions.retain(|symbol, pos| {
            if pos.is_closed() {
                info!(symbol = %symbol, "position closed and removed");
                false
            } else {
                true
            }
        });

        Self::recompute(&mut view, self.market_type, self.trading_mode, &prices);
        view.ts_ms = timestamp_ms();
    }

    /// Refresh marks and derived totals without applying fills.
    pub fn refresh_marks(&self, market_features: &[FeatureVector]) {
        let prices = price_map(market_features);
        if prices.is_empty() {
            return;
        }
        let mut view = self.view.write();
        Self::recompute(&mut view, self.market_type, self.trading_mode, &prices);
        view.ts_ms = timestamp_ms();
    }

    fn recompute(
        view: &mut PortfolioView,
        market_type: MarketType,
        trading_mode: TradingMode,
        prices: &HashMap<String, f64>,
    ) {
        let mut total_unrealized = 0.0;
        let mut gross_mark_value = 0.0;
        let mut cost_basis_signed = 0.0;
        let mut used_margin = 0.0;

        for (symbol, pos) in view.positions.iter_mut() {
            if let Some(mark) = prices.get(symbol).copied().filter(|p| *p > 0.0) {
                pos.mark_price = Some(mark);
            }
            let mark = pos.mark_price.unwrap_or(pos.avg_price);

            // (mark − avg) · signed qty covers both directions.
            let unrealized = (mark - pos.avg_price) * pos.quantity;
            pos.unrealized_pnl = Some(unrealized);
            let entry_notional = pos.quantity.abs() * pos.avg_price;
            pos.unrealized_pnl_pct = (entry_notional > 0.0)
                .then(|| unrealized / entry_notional * 100.0);
            pos.notional = Some(pos.quantity.abs() * mark);

            total_unrealized += unrealized;
            gross_mark_value += pos.quantity.abs() * mark;
            cost_basis_signed += pos.quantity * pos.avg_price;
            used_margin += entry_notional / pos.leverage.max(1.0);
        }

        view.total_unrealized_pnl = total_unrealized;

        if trading_mode == TradingMode::Live {
            Self::recompute_synced_totals(view, market_type);
            return;
        }

        match market_type {
            MarketType::Spot => {
                view.account_balance = view.cash;
                view.free_cash = view.cash;
                view.available_cash = view.cash;
                view.buying_power = view.cash.max(0.0);
                view.total_value = view.cash + gross_mark_value;
            }
            MarketType::Derivative => {
                view.account_balance = view.cash + cost_basis_signed;
                view.total_value = view.account_balance + total_unrealized;
                let free_margin = (view.total_value - used_margin).max(0.0);
                view.free_cash = free_margin;
                view.available_cash = free_margin;
                view.buying_power = free_margin;
            }
        }
    }

    /// Totals for a view whose account figures came from the exchange: keep
    /// `account_balance`/`buying_power` as synced, recompute the rest.
    fn recompute_synced_totals(view: &mut PortfolioView, market_type: MarketType) {
        let total_unrealized: f64 = view
            .positions
            .values()
            .filter(|p| !p.is_closed())
            .map(|p| p.unrealized_pnl.unwrap_or(0.0))
            .sum();
        view.total_unrealized_pnl = total_unrealized;

        match market_type {
            MarketType::Spot => {
                let gross: f64 = view
                    .positions
                    .values()
                    .filter(|p| !p.is_closed())
                    .map(|p| p.quantity.abs() * p.mark_price.unwrap_or(p.avg_price))
                    .sum();
                view.cash = view.account_balance;
                view.total_value = view.account_balance + gross;
            }
            MarketType::Derivative => {
                view.total_value = view.account_balance + total_unrealized;
            }
        }
        view.ts_ms = timestamp_ms();
    }
}

impl std::fmt::Debug for PortfolioService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let view = self.view.read();
        f.debug_struct("PortfolioService")
            .field("strategy_id", &view.strategy_id)
            .field("positions", &view.positions.len())
            .field("total_value", &view.total_value)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::GROUP_MARKET_SNAPSHOT;
    use crate::history::TradeHistoryEntry;

    fn fill(symbol: &str, side: TradeSide, qty: f64, price: f64, fee: f64) -> TradeHistoryEntry {
        TradeHistoryEntry::fill_for_test(symbol, side, qty, price, fee)
    }

    fn snapshot_feature(symbol: &str, last: f64) -> FeatureVector {
        FeatureVector::new(
            timestamp_ms(),
            Some(InstrumentRef::new(symbol, "binance")),
            GROUP_MARKET_SNAPSHOT,
        )
        .with_number("price.last", last)
    }

    fn service(initial: f64) -> PortfolioService {
        PortfolioService::new("strategy-1", initial, MarketType::Spot, TradingMode::Virtual)
    }

    #[test]
    fn buy_opens_position_and_reduces_cash() {
        let svc = service(10_000.0);
        svc.apply_trades(
            &[fill("BTC/USDT", TradeSide::Buy, 2.0, 100.0, 1.0)],
            &[snapshot_feature("BTC/USDT", 100.0)],
        );

        let view = svc.get_view();
        let pos = &view.positions["BTC/USDT"];
        assert_eq!(pos.quantity, 2.0);
        assert_eq!(pos.avg_price, 100.0);
        assert!((view.cash - (10_000.0 - 200.0 - 1.0)).abs() < 1e-9);
    }

    #[test]
    fn same_direction_add_weighted_averages() {
        let svc = service(10_000.0);
        svc.apply_trades(&[fill("BTC/USDT", TradeSide::Buy, 2.0, 100.0, 0.0)], &[]);
        svc.apply_trades(&[fill("BTC/USDT", TradeSide::Buy, 2.0, 110.0, 0.0)], &[]);

        let view = svc.get_view();
        let pos = &view.positions["BTC/USDT"];
        assert_eq!(pos.quantity, 4.0);
        assert!((pos.avg_price - 105.0).abs() < 1e-9);
    }

    #[test]
    fn reduce_keeps_avg_price() {
        let svc = service(10_000.0);
        svc.apply_trades(&[fill("BTC/USDT", TradeSide::Buy, 4.0, 100.0, 0.0)], &[]);
        svc.apply_trades(&[fill("BTC/USDT", TradeSide::Sell, 1.0, 120.0, 0.0)], &[]);

        let view = svc.get_view();
        let pos = &view.positions["BTC/USDT"];
        assert_eq!(pos.quantity, 3.0);
        assert!((pos.avg_price - 100.0).abs() < 1e-9);
    }

    #[test]
    fn exact_close_removes_position() {
        let svc = service(10_000.0);
        svc.apply_trades(&[fill("BTC/USDT", TradeSide::Buy, 1.5, 100.0, 0.0)], &[]);
        svc.apply_trades(&[fill("BTC/USDT", TradeSide::Sell, 1.5, 110.0, 0.0)], &[]);

        let view = svc.get_view();
        assert!(view.positions.is_empty());
        assert!((view.cash - (10_000.0 - 150.0 + 165.0)).abs() < 1e-9);
    }

    #[test]
    fn overshoot_sell_crosses_into_short() {
        let svc = PortfolioService::new(
            "strategy-1",
            10_000.0,
            MarketType::Derivative,
            TradingMode::Virtual,
        );
        svc.apply_trades(&[fill("BTC/USDT", TradeSide::Buy, 1.5, 100.0, 0.0)], &[]);
        svc.apply_trades(&[fill("BTC/USDT", TradeSide::Sell, 2.0, 110.0, 0.0)], &[]);

        let view = svc.get_view();
        let pos = &view.positions["BTC/USDT"];
        assert!((pos.quantity + 0.5).abs() < 1e-9);
        assert_eq!(pos.avg_price, 110.0);
        assert_eq!(pos.trade_type, TradeType::Short);
    }

    #[test]
    fn cost_plus_cash_is_conserved_up_to_fees() {
        let svc = service(10_000.0);
        let fees = 1.0 + 0.5;
        svc.apply_trades(&[fill("BTC/USDT", TradeSide::Buy, 2.0, 100.0, 1.0)], &[]);
        svc.apply_trades(&[fill("ETH/USDT", TradeSide::Buy, 1.0, 50.0, 0.5)], &[]);

        let view = svc.get_view();
        let signed_cost: f64 = view
            .positions
            .values()
            .map(|p| p.quantity * p.avg_price)
            .sum();
        assert!((view.cash + signed_cost - (10_000.0 - fees)).abs() < 1e-6);
    }

    #[test]
    fn spot_total_value_is_cash_plus_marked_positions() {
        let svc = service(10_000.0);
        svc.apply_trades(
            &[fill("BTC/USDT", TradeSide::Buy, 2.0, 100.0, 0.0)],
            &[snapshot_feature("BTC/USDT", 105.0)],
        );

        let view = svc.get_view();
        assert!((view.total_value - (view.cash + 2.0 * 105.0)).abs() < 1e-9);
        let pos = &view.positions["BTC/USDT"];
        assert!((pos.unrealized_pnl.unwrap() - 10.0).abs() < 1e-9);
        assert!((pos.unrealized_pnl_pct.unwrap() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn derivative_equity_is_balance_plus_unrealized() {
        let svc = PortfolioService::new(
            "strategy-1",
            10_000.0,
            MarketType::Derivative,
            TradingMode::Virtual,
        );
        svc.apply_trades(
            &[fill("BTC/USDT", TradeSide::Sell, 1.0, 100.0, 0.0)],
            &[snapshot_feature("BTC/USDT", 90.0)],
        );

        let view = svc.get_view();
        // Short gains as price falls.
        assert!((view.total_unrealized_pnl - 10.0).abs() < 1e-9);
        assert!(
            (view.total_value - (view.account_balance + view.total_unrealized_pnl)).abs() < 1e-9
        );
        // Wallet balance unchanged by opening.
        assert!((view.account_balance - 10_000.0).abs() < 1e-9);
    }

    #[test]
    fn virtual_spot_cash_stays_non_negative_via_buying_power() {
        let svc = service(100.0);
        let view = svc.get_view();
        assert!(view.buying_power >= 0.0);
        assert_eq!(view.buying_power, 100.0);
    }

    #[test]
    fn reconcile_preserves_synced_account_figures() {
        let svc = PortfolioService::new(
            "strategy-1",
            10_000.0,
            MarketType::Derivative,
            TradingMode::Live,
        );
        svc.reconcile(|view| {
            view.account_balance = 12_345.0;
            view.buying_power = 6_000.0;
            let mut pos = PositionSnapshot::new(InstrumentRef::new("ETH/USDT", "binance"));
            pos.quantity = 0.8;
            pos.avg_price = 2_000.0;
            pos.mark_price = Some(2_100.0);
            pos.unrealized_pnl = Some(80.0);
            view.positions.insert("ETH/USDT".into(), pos);
        });

        let view = svc.get_view();
        assert_eq!(view.account_balance, 12_345.0);
        assert_eq!(view.buying_power, 6_000.0);
        assert!((view.total_value - (12_345.0 + 80.0)).abs() < 1e-9);
    }

    #[test]
    fn reconcile_is_idempotent() {
        let svc = PortfolioService::new(
            "strategy-1",
            10_000.0,
            MarketType::Derivative,
            TradingMode::Live,
        );
        let sync = |view: &mut PortfolioView| {
            view.account_balance = 11_000.0;
            view.buying_power = 5_000.0;
            let mut pos = PositionSnapshot::new(InstrumentRef::new("ETH/USDT", "binance"));
            pos.quantity = 1.0;
            pos.avg_price = 2_000.0;
            pos.mark_price = Some(2_050.0);
            pos.unrealized_pnl = Some(50.0);
            view.positions.insert("ETH/USDT".into(), pos);
        };
        svc.reconcile(sync);
        let first = svc.get_view();
        svc.reconcile(sync);
        let second = svc.get_view();

        assert_eq!(first.account_balance, second.account_balance);
        assert_eq!(first.total_value, second.total_value);
        assert_eq!(
            first.positions["ETH/USDT"].quantity,
            second.positions["ETH/USDT"].quantity
        );
    }

    #[test]
    fn view_roundtrip_is_exact() {
        let svc = service(10_000.0);
        svc.apply_trades(&[fill("BTC/USDT", TradeSide::Buy, 1.0, 100.0, 0.1)], &[]);
        let view = svc.get_view();

        let json = serde_json::to_string(&view).unwrap();
        let back: PortfolioView = serde_json::from_str(&json).unwrap();
        assert_eq!(back.strategy_id, view.strategy_id);
        assert_eq!(back.cash, view.cash);
        assert_eq!(
            back.positions["BTC/USDT"].quantity,
            view.positions["BTC/USDT"].quantity
        );
    }
}
