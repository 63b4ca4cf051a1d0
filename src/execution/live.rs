// =============================================================================
// Live execution gateway — routes instructions to the exchange adapter
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{info, warn};

use crate::exchange::{ExchangeAdapter, OrderAck, OrderError, OrderRequest};
use crate::features::{price_map, FeatureVector};
use crate::types::TxStatus;

use super::{ExecutionGateway, TradeInstruction, TxResult};

/// Sends each instruction to the venue. Per-instruction calls run
/// concurrently; results come back 1:1 in instruction order.
pub struct LiveExecutionGateway {
    adapter: Arc<dyn ExchangeAdapter>,
}

impl LiveExecutionGateway {
    pub fn new(adapter: Arc<dyn ExchangeAdapter>) -> Self {
        Self { adapter }
    }

    fn result_from_ack(
        instruction: &TradeInstruction,
        ack: OrderAck,
        snapshot_price: Option<f64>,
    ) -> TxResult {
        // Market orders on some venues acknowledge before reporting fills;
        // a fully-filled ack without quantities falls back to the request.
        let (filled_qty, status) = if ack.filled_qty > 0.0 {
            if ack.filled_qty + 1e-12 < instruction.quantity && !ack.fully_filled {
                (ack.filled_qty, TxStatus::Partial)
            } else {
                (ack.filled_qty, TxStatus::Filled)
            }
        } else if ack.fully_filled {
            (instruction.quantity, TxStatus::Filled)
        } else {
            (instruction.quantity, TxStatus::Filled)
        };

        let avg_exec_price = ack
            .avg_price
            .or(instruction.limit_price)
            .or(snapshot_price);

        info!(
            instruction_id = %instruction.instruction_id,
            order_id = %ack.order_id,
            status = %status,
            filled_qty,
            "live order executed"
        );

        TxResult {
            instruction_id: instruction.instruction_id.clone(),
            instrument: instruction.instrument.clone(),
            side: instruction.side,
            requested_qty: instruction.quantity,
            filled_qty,
            avg_exec_price,
            fee_cost: None,
            status,
            reason: None,
            leverage: instruction.leverage,
            meta: instruction.meta.clone(),
        }
    }
}

#[async_trait]
impl ExecutionGateway for LiveExecutionGateway {
    async fn execute(
        &self,
        instructions: &[TradeInstruction],
        market_features: &[FeatureVector],
    ) -> Vec<TxResult> {
        let prices = price_map(market_features);

        let calls = instructions.iter().map(|instruction| {
            let adapter = self.adapter.clone();
            let snapshot_price = prices.get(&instruction.instrument.canonical_key()).copied();
            async move {
                let order = OrderRequest {
                    symbol: instruction.instrument.symbol.clone(),
                    side: instruction.side,
                    price_mode: instruction.price_mode,
                    quantity: instruction.quantity,
                    reduce_only: instruction.reduce_only(),
                    limit_price: instruction.limit_price,
                };

                match adapter.create_order(order).await {
                    Ok(ack) => Self::result_from_ack(instruction, ack, snapshot_price),
                    Err(OrderError::Rejected(reason)) => {
                        warn!(
                            instruction_id = %instruction.instruction_id,
                            symbol = %instruction.instrument.symbol,
                            reason = %reason,
                            "venue rejected order"
                        );
                        TxResult::failed(instruction, TxStatus::Rejected, reason)
                    }
                    Err(OrderError::Transport(reason)) => {
                        warn!(
                            instruction_id = %instruction.instruction_id,
                            symbol = %instruction.instrument.symbol,
                            reason = %reason,
                            "order transport error"
                        );
                        TxResult::failed(instruction, TxStatus::Error, reason)
                    }
                }
            }
        });

        // join_all preserves input ordering, keeping results 1:1 with
        // instructions even though the venue calls ran concurrently.
        join_all(calls).await
    }

    async fn close(&self) {
        self.adapter.close().await;
        info!("live execution gateway closed");
    }
}

impl std::fmt::Debug for LiveExecutionGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveExecutionGateway").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Candle;
    use crate::exchange::{AccountBalance, ExchangePosition, Ticker};
    use crate::execution::instruction_for_test;
    use crate::types::TradeSide;
    use anyhow::Result;
    use parking_lot::RwLock;

    /// Adapter scripting one outcome per symbol.
    #[derive(Default)]
    struct ScriptedExchange {
        outcomes: RwLock<std::collections::HashMap<String, Result<OrderAck, OrderError>>>,
        reduce_only_seen: RwLock<Vec<bool>>,
    }

    impl ScriptedExchange {
        fn script(self, symbol: &str, outcome: Result<OrderAck, OrderError>) -> Self {
            self.outcomes.write().insert(symbol.to_string(), outcome);
            self
        }
    }

    #[async_trait]
    impl ExchangeAdapter for ScriptedExchange {
        async fn fetch_balance(&self) -> Result<AccountBalance> {
            unimplemented!("not used in gateway tests")
        }
        async fn fetch_positions(&self, _symbols: &[String]) -> Result<Vec<ExchangePosition>> {
            Ok(Vec::new())
        }
        async fn fetch_ticker(&self, _symbol: &str) -> Result<Ticker> {
            unimplemented!("not used in gateway tests")
        }
        async fn fetch_open_interest(&self, _symbol: &str) -> Result<Option<f64>> {
            Ok(None)
        }
        async fn fetch_funding_rate(&self, _symbol: &str) -> Result<Option<f64>> {
            Ok(None)
        }
        async fn fetch_ohlcv(&self, _s: &str, _i: &str, _l: u32) -> Result<Vec<Candle>> {
            Ok(Vec::new())
        }
        async fn create_order(&self, order: OrderRequest) -> Result<OrderAck, OrderError> {
            self.reduce_only_seen.write().push(order.reduce_only);
            self.outcomes
                .read()
                .get(&order.symbol)
                .map(|outcome| match outcome {
                    Ok(ack) => Ok(ack.clone()),
                    Err(e) => Err(e.clone()),
                })
                .unwrap_or_else(|| Err(OrderError::Transport("unscripted symbol".into())))
        }
        async fn close(&self) {}
    }

    fn filled_ack(qty: f64, price: f64) -> OrderAck {
        OrderAck {
            order_id: "1".into(),
            filled_qty: qty,
            avg_price: Some(price),
            fully_filled: true,
        }
    }

    #[tokio::test]
    async fn maps_venue_outcomes_to_statuses_in_order() {
        let adapter = ScriptedExchange::default()
            .script("BTC/USDT", Ok(filled_ack(1.0, 100.0)))
            .script("ETH/USDT", Err(OrderError::Rejected("min notional".into())))
            .script("SOL/USDT", Err(OrderError::Transport("timeout".into())));
        let gateway = LiveExecutionGateway::new(Arc::new(adapter));

        let instructions = vec![
            instruction_for_test("BTC/USDT", TradeSide::Buy, 1.0),
            instruction_for_test("ETH/USDT", TradeSide::Buy, 1.0),
            instruction_for_test("SOL/USDT", TradeSide::Sell, 1.0),
        ];
        let results = gateway.execute(&instructions, &[]).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].status, TxStatus::Filled);
        assert_eq!(results[0].avg_exec_price, Some(100.0));
        assert_eq!(results[1].status, TxStatus::Rejected);
        assert_eq!(results[1].reason.as_deref(), Some("min notional"));
        assert_eq!(results[2].status, TxStatus::Error);
        for (result, instruction) in results.iter().zip(&instructions) {
            assert_eq!(result.instruction_id, instruction.instruction_id);
        }
    }

    #[tokio::test]
    async fn partial_fill_reports_partial_status() {
        let adapter = ScriptedExchange::default().script(
            "BTC/USDT",
            Ok(OrderAck {
                order_id: "2".into(),
                filled_qty: 0.4,
                avg_price: Some(101.0),
                fully_filled: false,
            }),
        );
        let gateway = LiveExecutionGateway::new(Arc::new(adapter));
        let results = gateway
            .execute(&[instruction_for_test("BTC/USDT", TradeSide::Buy, 1.0)], &[])
            .await;

        assert_eq!(results[0].status, TxStatus::Partial);
        assert_eq!(results[0].filled_qty, 0.4);
    }

    #[tokio::test]
    async fn reduce_only_flag_reaches_the_venue() {
        let adapter = Arc::new(
            ScriptedExchange::default().script("BTC/USDT", Ok(filled_ack(1.0, 100.0))),
        );
        let gateway = LiveExecutionGateway::new(adapter.clone());

        let mut instruction = instruction_for_test("BTC/USDT", TradeSide::Sell, 1.0);
        instruction
            .meta
            .insert("reduceOnly".into(), serde_json::json!(true));
        gateway.execute(&[instruction], &[]).await;

        assert_eq!(*adapter.reduce_only_seen.read(), vec![true]);
    }
}
