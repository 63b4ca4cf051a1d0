// =============================================================================
// Signed REST exchange adapter
// =============================================================================
//
// Binance-compatible REST implementation of `ExchangeAdapter`, covering both
// the spot API (api/v3) and the USD-margined derivatives API (fapi). Public
// market-data endpoints go out unauthenticated; account and order endpoints
// carry the API-key header plus an HMAC-SHA256 signature over the query
// string. The secret never leaves the signing helper and is never logged.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::data::Candle;
use crate::instrument::InstrumentRef;
use crate::types::{timestamp_ms, MarketType, PriceMode, TradeSide};

use super::adapter::{
    AccountBalance, ExchangeAdapter, ExchangePosition, OrderAck, OrderError, OrderRequest, Ticker,
};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the API key on authenticated endpoints.
const API_KEY_HEADER: &str = "X-MBX-APIKEY";

/// Tolerated clock drift between engine and venue, in milliseconds.
const RECV_WINDOW_MS: u64 = 5000;

/// Per-call HTTP deadline.
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Signed REST client for one venue + market type.
#[derive(Clone)]
pub struct SignedRestExchange {
    api_key: String,
    secret: String,
    base_url: String,
    market_type: MarketType,
    client: reqwest::Client,
}

impl SignedRestExchange {
    /// Build an adapter for the given market type. Spot and derivatives live
    /// on different hosts with different path prefixes; everything else about
    /// the two surfaces is shared.
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        market_type: MarketType,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("static client settings are always valid");

        let base_url = match market_type {
            MarketType::Spot => "https://api.binance.com".to_string(),
            MarketType::Derivative => "https://fapi.binance.com".to_string(),
        };

        debug!(%base_url, market_type = %market_type, "SignedRestExchange initialised");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url,
            market_type,
            client,
        }
    }

    /// Override the base URL (testnets, regional mirrors).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// Hex HMAC-SHA256 of `payload`, keyed by the account secret.
    fn signature(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("hmac-sha256 takes keys of any length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Assemble a fully authenticated URL from key/value pairs: the caller's
    /// parameters, then the auth envelope (timestamp + recvWindow), then the
    /// signature over everything before it.
    fn authed_url(&self, path: &str, params: &[(&str, String)]) -> String {
        let mut query: Vec<String> = params
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        query.push(format!("timestamp={}", timestamp_ms()));
        query.push(format!("recvWindow={RECV_WINDOW_MS}"));

        let unsigned = query.join("&");
        let signature = self.signature(&unsigned);
        format!("{}{path}?{unsigned}&signature={signature}", self.base_url)
    }

    /// GET an unauthenticated market-data endpoint.
    async fn get_public(&self, path_and_query: &str) -> Result<serde_json::Value> {
        let url = format!("{}{path_and_query}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {path_and_query} request failed"))?;
        Self::json_body(resp, path_and_query).await
    }

    /// GET a signed account endpoint.
    async fn get_signed(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value> {
        let url = self.authed_url(path, params);
        let resp = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;
        Self::json_body(resp, path).await
    }

    async fn json_body(resp: reqwest::Response, what: &str) -> Result<serde_json::Value> {
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {what} response"))?;
        if !status.is_success() {
            anyhow::bail!("{what} returned {status}: {body}");
        }
        Ok(body)
    }

    /// Venue symbol: canonical "BASE/QUOTE[:SETTLE]" collapsed to "BASEQUOTE".
    fn venue_symbol(symbol: &str) -> String {
        let head = symbol.split(':').next().unwrap_or(symbol);
        head.replace(['/', '-'], "").to_uppercase()
    }

    /// Numeric fields arrive as strings on most endpoints and as numbers on
    /// a few; accept either.
    fn parse_str_f64(val: &serde_json::Value) -> f64 {
        if let Some(s) = val.as_str() {
            s.parse::<f64>().unwrap_or(0.0)
        } else {
            val.as_f64().unwrap_or(0.0)
        }
    }
}

#[async_trait]
impl ExchangeAdapter for SignedRestExchange {
    async fn fetch_balance(&self) -> Result<AccountBalance> {
        match self.market_type {
            MarketType::Spot => {
                let body = self.get_signed("/api/v3/account", &[]).await?;

                // Free quote-currency balance across stablecoins.
                let mut free = 0.0;
                if let Some(balances) = body["balances"].as_array() {
                    for b in balances {
                        let asset = b["asset"].as_str().unwrap_or("");
                        if matches!(asset, "USDT" | "USDC" | "BUSD" | "USD") {
                            free += Self::parse_str_f64(&b["free"]);
                        }
                    }
                }
                debug!(free, "spot balance fetched");
                Ok(AccountBalance {
                    free_cash: free,
                    total_equity: free,
                })
            }
            MarketType::Derivative => {
                let body = self.get_signed("/fapi/v2/account", &[]).await?;

                let free_margin = Self::parse_str_f64(&body["availableBalance"]);
                let wallet = Self::parse_str_f64(&body["totalWalletBalance"]);
                let unrealized = Self::parse_str_f64(&body["totalUnrealizedProfit"]);
                debug!(free_margin, wallet, unrealized, "derivative balance fetched");
                Ok(AccountBalance {
                    free_cash: free_margin,
                    total_equity: wallet + unrealized,
                })
            }
        }
    }

    async fn fetch_positions(&self, symbols: &[String]) -> Result<Vec<ExchangePosition>> {
        if self.market_type == MarketType::Spot {
            return Ok(Vec::new());
        }

        let body = self.get_signed("/fapi/v2/positionRisk", &[]).await?;

        let wanted: Vec<String> = symbols.iter().map(|s| Self::venue_symbol(s)).collect();
        let mut positions = Vec::new();

        for entry in body.as_array().cloned().unwrap_or_default() {
            let symbol = entry["symbol"].as_str().unwrap_or("").to_string();
            if !wanted.is_empty() && !wanted.contains(&symbol) {
                continue;
            }
            let signed_qty = Self::parse_str_f64(&entry["positionAmt"]);
            if signed_qty == 0.0 {
                continue;
            }
            positions.push(ExchangePosition {
                symbol,
                signed_qty,
                entry_price: Self::parse_str_f64(&entry["entryPrice"]),
                mark_price: Self::parse_str_f64(&entry["markPrice"]),
                unrealized_pnl: Self::parse_str_f64(&entry["unRealizedProfit"]),
                leverage: Self::parse_str_f64(&entry["leverage"]).max(1.0),
                notional: Self::parse_str_f64(&entry["notional"]).abs(),
            });
        }

        debug!(count = positions.len(), "open positions fetched");
        Ok(positions)
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        let venue_symbol = Self::venue_symbol(symbol);
        let path = match self.market_type {
            MarketType::Spot => "/api/v3/ticker/24hr",
            MarketType::Derivative => "/fapi/v1/ticker/24hr",
        };
        let body = self
            .get_public(&format!("{path}?symbol={venue_symbol}"))
            .await?;

        Ok(Ticker {
            symbol: symbol.to_string(),
            last: Self::parse_str_f64(&body["lastPrice"]),
            open: Self::parse_str_f64(&body["openPrice"]),
            volume: Self::parse_str_f64(&body["volume"]),
        })
    }

    async fn fetch_open_interest(&self, symbol: &str) -> Result<Option<f64>> {
        if self.market_type == MarketType::Spot {
            return Ok(None);
        }
        let body = self
            .get_public(&format!(
                "/fapi/v1/openInterest?symbol={}",
                Self::venue_symbol(symbol)
            ))
            .await?;
        Ok(Some(Self::parse_str_f64(&body["openInterest"])))
    }

    async fn fetch_funding_rate(&self, symbol: &str) -> Result<Option<f64>> {
        if self.market_type == MarketType::Spot {
            return Ok(None);
        }
        let body = self
            .get_public(&format!(
                "/fapi/v1/premiumIndex?symbol={}",
                Self::venue_symbol(symbol)
            ))
            .await?;
        Ok(Some(Self::parse_str_f64(&body["lastFundingRate"])))
    }

    /// Returns a vector of [`Candle`] structs parsed from the venue's
    /// array-of-arrays kline format.
    ///
    /// Array indices:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume
    async fn fetch_ohlcv(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        let path = match self.market_type {
            MarketType::Spot => "/api/v3/klines",
            MarketType::Derivative => "/fapi/v1/klines",
        };
        let body = self
            .get_public(&format!(
                "{path}?symbol={}&interval={interval}&limit={limit}",
                Self::venue_symbol(symbol)
            ))
            .await?;

        let raw = body.as_array().context("klines response is not an array")?;
        let instrument = InstrumentRef::new(symbol, self.exchange_id());
        let mut candles = Vec::with_capacity(raw.len());

        for entry in raw {
            let arr = match entry.as_array() {
                Some(a) if a.len() >= 6 => a,
                _ => {
                    warn!("skipping malformed kline entry");
                    continue;
                }
            };
            candles.push(Candle {
                ts_ms: arr[0].as_i64().unwrap_or(0),
                instrument: instrument.clone(),
                open: Self::parse_str_f64(&arr[1]),
                high: Self::parse_str_f64(&arr[2]),
                low: Self::parse_str_f64(&arr[3]),
                close: Self::parse_str_f64(&arr[4]),
                volume: Self::parse_str_f64(&arr[5]),
                interval: interval.to_string(),
            });
        }

        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    async fn create_order(&self, order: OrderRequest) -> Result<OrderAck, OrderError> {
        let venue_symbol = Self::venue_symbol(&order.symbol);
        let side = match order.side {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        };

        let mut params: Vec<(&str, String)> = vec![
            ("symbol", venue_symbol.clone()),
            ("side", side.to_string()),
            ("quantity", order.quantity.to_string()),
        ];
        match order.price_mode {
            PriceMode::Market => params.push(("type", "MARKET".to_string())),
            PriceMode::Limit => {
                let price = order.limit_price.ok_or_else(|| {
                    OrderError::Rejected("limit order without limit_price".to_string())
                })?;
                params.push(("type", "LIMIT".to_string()));
                params.push(("timeInForce", "GTC".to_string()));
                params.push(("price", price.to_string()));
            }
        }
        if order.reduce_only && self.market_type == MarketType::Derivative {
            params.push(("reduceOnly", "true".to_string()));
        }

        let path = match self.market_type {
            MarketType::Spot => "/api/v3/order",
            MarketType::Derivative => "/fapi/v1/order",
        };
        let url = self.authed_url(path, &params);

        debug!(symbol = %venue_symbol, side, qty = order.quantity, "placing order");

        let resp = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| OrderError::Transport(format!("POST order request failed: {e}")))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| OrderError::Transport(format!("failed to parse order response: {e}")))?;

        if !status.is_success() {
            let msg = body["msg"]
                .as_str()
                .map(|s| s.to_string())
                .unwrap_or_else(|| body.to_string());
            // 4xx means the venue examined and refused the order; anything
            // else is a transport/venue-internal failure.
            return if status.is_client_error() {
                Err(OrderError::Rejected(msg))
            } else {
                Err(OrderError::Transport(msg))
            };
        }

        let executed = Self::parse_str_f64(&body["executedQty"]);
        let cum_quote = Self::parse_str_f64(if self.market_type == MarketType::Spot {
            &body["cummulativeQuoteQty"]
        } else {
            &body["cumQuote"]
        });
        let avg_price = if executed > 0.0 && cum_quote > 0.0 {
            Some(cum_quote / executed)
        } else {
            body.get("avgPrice").map(Self::parse_str_f64).filter(|p| *p > 0.0)
        };
        let order_status = body["status"].as_str().unwrap_or("");

        debug!(symbol = %venue_symbol, order_status, executed, "order placed");

        Ok(OrderAck {
            order_id: body["orderId"]
                .as_u64()
                .map(|v| v.to_string())
                .unwrap_or_default(),
            filled_qty: executed,
            avg_price,
            fully_filled: order_status == "FILLED",
        })
    }

    async fn close(&self) {
        // The reqwest client releases its pool on drop; nothing else held.
        debug!("exchange adapter closed");
    }
}

impl SignedRestExchange {
    fn exchange_id(&self) -> &'static str {
        "binance"
    }
}

impl std::fmt::Debug for SignedRestExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedRestExchange")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("market_type", &self.market_type)
            .finish()
    }
}
