// =============================================================================
// Market data source — candles and point-in-time snapshots per cycle
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::exchange::{ExchangeAdapter, Ticker};

use super::Candle;

/// Snapshot for one symbol: latest ticker plus best-effort derivative feeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolSnapshot {
    pub ticker: Ticker,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_interest: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub funding_rate: Option<f64>,
}

/// Point-in-time market snapshot keyed by symbol.
pub type MarketSnapshot = HashMap<String, SymbolSnapshot>;

/// Raw-data seam consumed by the features pipeline.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Recent candles for all symbols at one interval. A symbol whose fetch
    /// fails is logged and omitted; the call itself never fails wholesale.
    async fn recent_candles(&self, symbols: &[String], interval: &str, lookback: u32)
        -> Vec<Candle>;

    /// Latest ticker (plus optional open interest / funding rate) per symbol.
    async fn market_snapshot(&self, symbols: &[String]) -> MarketSnapshot;
}

/// Market data source backed by an exchange adapter.
pub struct AdapterMarketDataSource {
    adapter: Arc<dyn ExchangeAdapter>,
}

impl AdapterMarketDataSource {
    pub fn new(adapter: Arc<dyn ExchangeAdapter>) -> Self {
        Self { adapter }
    }

    async fn snapshot_for(&self, symbol: &str) -> Result<SymbolSnapshot> {
        let ticker = self.adapter.fetch_ticker(symbol).await?;

        // Best-effort extras: failures degrade to None.
        let open_interest = match self.adapter.fetch_open_interest(symbol).await {
            Ok(oi) => oi,
            Err(e) => {
                debug!(symbol, error = %e, "open interest unavailable");
                None
            }
        };
        let funding_rate = match self.adapter.fetch_funding_rate(symbol).await {
            Ok(fr) => fr,
            Err(e) => {
                debug!(symbol, error = %e, "funding rate unavailable");
                None
            }
        };

        Ok(SymbolSnapshot {
            ticker,
            open_interest,
            funding_rate,
        })
    }
}

#[async_trait]
impl MarketDataSource for AdapterMarketDataSource {
    async fn recent_candles(
        &self,
        symbols: &[String],
        interval: &str,
        lookback: u32,
    ) -> Vec<Candle> {
        let fetches = symbols.iter().map(|symbol| {
            let adapter = self.adapter.clone();
            let symbol = symbol.clone();
            let interval = interval.to_string();
            async move {
                match adapter.fetch_ohlcv(&symbol, &interval, lookback).await {
                    Ok(candles) => candles,
                    Err(e) => {
                        warn!(symbol = %symbol, interval = %interval, error = %e, "candle fetch failed");
                        Vec::new()
                    }
                }
            }
        });

        join_all(fetches).await.into_iter().flatten().collect()
    }

    async fn market_snapshot(&self, symbols: &[String]) -> MarketSnapshot {
        let fetches = symbols.iter().map(|symbol| {
            let symbol = symbol.clone();
            async move {
                match self.snapshot_for(&symbol).await {
                    Ok(snapshot) => Some((symbol, snapshot)),
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "market snapshot fetch failed");
                        None
                    }
                }
            }
        });

        join_all(fetches).await.into_iter().flatten().collect()
    }
}

impl std::fmt::Debug for AdapterMarketDataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterMarketDataSource").finish()
    }
}

#[cfg(test)]
pub(crate) mod stubs {
    use super::*;
    use crate::exchange::{AccountBalance, ExchangePosition, OrderAck, OrderError, OrderRequest};
    use crate::instrument::InstrumentRef;
    use parking_lot::RwLock;

    /// Deterministic adapter for tests: fixed tickers and candles, no I/O.
    #[derive(Default)]
    pub struct StubExchange {
        pub tickers: RwLock<HashMap<String, Ticker>>,
        pub candles: RwLock<HashMap<String, Vec<Candle>>>,
        pub fail_tickers: RwLock<bool>,
    }

    impl StubExchange {
        pub fn with_ticker(self, symbol: &str, last: f64, open: f64) -> Self {
            self.tickers.write().insert(
                symbol.to_string(),
                Ticker {
                    symbol: symbol.to_string(),
                    last,
                    open,
                    volume: 1000.0,
                },
            );
            self
        }

        pub fn with_candles(self, symbol: &str, closes: &[f64]) -> Self {
            let series = closes
                .iter()
                .enumerate()
                .map(|(i, close)| Candle {
                    ts_ms: 1_730_000_000_000 + (i as i64) * 60_000,
                    instrument: InstrumentRef::new(symbol, "stub"),
                    open: *close,
                    high: *close,
                    low: *close,
                    close: *close,
                    volume: 10.0,
                    interval: "1m".into(),
                })
                .collect();
            self.candles.write().insert(symbol.to_string(), series);
            self
        }
    }

    #[async_trait]
    impl ExchangeAdapter for StubExchange {
        async fn fetch_balance(&self) -> Result<AccountBalance> {
            Ok(AccountBalance {
                free_cash: 10_000.0,
                total_equity: 10_000.0,
            })
        }

        async fn fetch_positions(&self, _symbols: &[String]) -> Result<Vec<ExchangePosition>> {
            Ok(Vec::new())
        }

        async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
            if *self.fail_tickers.read() {
                anyhow::bail!("ticker feed down");
            }
            self.tickers
                .read()
                .get(symbol)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown symbol {symbol}"))
        }

        async fn fetch_open_interest(&self, _symbol: &str) -> Result<Option<f64>> {
            Ok(None)
        }

        async fn fetch_funding_rate(&self, _symbol: &str) -> Result<Option<f64>> {
            Ok(None)
        }

        async fn fetch_ohlcv(
            &self,
            symbol: &str,
            _interval: &str,
            _limit: u32,
        ) -> Result<Vec<Candle>> {
            Ok(self.candles.read().get(symbol).cloned().unwrap_or_default())
        }

        async fn create_order(&self, _order: OrderRequest) -> Result<OrderAck, OrderError> {
            Err(OrderError::Rejected("stub exchange takes no orders".into()))
        }

        async fn close(&self) {}
    }
}
