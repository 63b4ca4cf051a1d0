// =============================================================================
// Exchange Adapter contract
// =============================================================================
//
// Everything the engine needs from a venue: balances, open positions
// (derivatives), tickers, OHLCV, order placement, and resource release. All
// calls are async with explicit deadlines enforced by the implementation.
// =============================================================================

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::data::Candle;
use crate::types::{PriceMode, TradeSide};

/// Account balance snapshot from the venue.
///
/// For spot accounts `free_cash` is the quote-currency free balance and
/// `total_equity` equals it. For derivative accounts `free_cash` is free
/// margin and `total_equity` is wallet balance plus unrealized PnL.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountBalance {
    pub free_cash: f64,
    pub total_equity: f64,
}

/// One open derivative position as reported by the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    /// Symbol in the venue's own format; callers canonicalize.
    pub symbol: String,
    /// Signed quantity: positive long, negative short.
    pub signed_qty: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: f64,
    pub notional: f64,
}

/// Point-in-time ticker for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last: f64,
    pub open: f64,
    pub volume: f64,
}

impl Ticker {
    /// Fractional change from open to last.
    pub fn change_pct(&self) -> f64 {
        if self.open > 0.0 {
            (self.last - self.open) / self.open
        } else {
            0.0
        }
    }
}

/// Order submission parameters.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: TradeSide,
    pub price_mode: PriceMode,
    pub quantity: f64,
    pub reduce_only: bool,
    pub limit_price: Option<f64>,
}

/// Venue acknowledgement of a placed order.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub filled_qty: f64,
    pub avg_price: Option<f64>,
    /// True when the venue reports the order fully filled.
    pub fully_filled: bool,
}

/// Order placement failure, split by whether the venue said no or the
/// transport failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OrderError {
    /// The venue refused the order (min-notional, margin, reduce-only).
    #[error("order rejected: {0}")]
    Rejected(String),
    /// Network or venue-internal failure; retryable at the next cycle.
    #[error("order transport error: {0}")]
    Transport(String),
}

/// Venue-facing contract. Implementations enforce per-call deadlines and
/// must make `close` idempotent.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn fetch_balance(&self) -> Result<AccountBalance>;

    /// Open positions for the given symbols. Derivatives only; spot
    /// implementations return an empty list.
    async fn fetch_positions(&self, symbols: &[String]) -> Result<Vec<ExchangePosition>>;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker>;

    /// Best-effort open interest; `None` when the venue has no such feed.
    async fn fetch_open_interest(&self, symbol: &str) -> Result<Option<f64>>;

    /// Best-effort funding rate; `None` when the venue has no such feed.
    async fn fetch_funding_rate(&self, symbol: &str) -> Result<Option<f64>>;

    async fn fetch_ohlcv(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>>;

    async fn create_order(&self, order: OrderRequest) -> Result<OrderAck, OrderError>;

    /// Release held resources. Idempotent.
    async fn close(&self);
}
