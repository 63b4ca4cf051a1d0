// =============================================================================
// Paper execution gateway — local simulation with slippage and fees
// =============================================================================

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::features::{price_map, FeatureVector};
use crate::types::{TradeSide, TxStatus};

use super::{ExecutionGateway, TradeInstruction, TxResult};

/// Simulates fills against the market snapshot. Prices come from the
/// snapshot's `price.last`; slippage is applied in the taker direction and
/// a proportional fee is charged on executed notional.
#[derive(Debug)]
pub struct PaperExecutionGateway {
    fee_rate: f64,
}

impl PaperExecutionGateway {
    pub fn new() -> Self {
        Self { fee_rate: 0.0 }
    }

    pub fn with_fee_rate(fee_rate: f64) -> Self {
        Self {
            fee_rate: fee_rate.max(0.0),
        }
    }

    fn simulate(&self, instruction: &TradeInstruction, last: f64) -> TxResult {
        let slippage = instruction.max_slippage_bps as f64 / 10_000.0;
        // The taker pays the spread: buys fill above last, sells below.
        let exec_price = match instruction.side {
            TradeSide::Buy => last * (1.0 + slippage),
            TradeSide::Sell => last * (1.0 - slippage),
        };
        let fee_cost = (exec_price * instruction.quantity).abs() * self.fee_rate;

        debug!(
            instruction_id = %instruction.instruction_id,
            symbol = %instruction.instrument.symbol,
            side = %instruction.side,
            last,
            exec_price,
            fee_cost,
            "paper fill simulated"
        );

        TxResult {
            instruction_id: instruction.instruction_id.clone(),
            instrument: instruction.instrument.clone(),
            side: instruction.side,
            requested_qty: instruction.quantity,
            filled_qty: instruction.quantity,
            avg_exec_price: Some(exec_price),
            fee_cost: (fee_cost > 0.0).then_some(fee_cost),
            status: TxStatus::Filled,
            reason: None,
            leverage: instruction.leverage,
            meta: instruction.meta.clone(),
        }
    }
}

impl Default for PaperExecutionGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionGateway for PaperExecutionGateway {
    async fn execute(
        &self,
        instructions: &[TradeInstruction],
        market_features: &[FeatureVector],
    ) -> Vec<TxResult> {
        let prices = price_map(market_features);

        instructions
            .iter()
            .map(|instruction| {
                let symbol = instruction.instrument.canonical_key();
                match prices.get(&symbol).copied() {
                    Some(last) if last > 0.0 => self.simulate(instruction, last),
                    _ => {
                        warn!(
                            instruction_id = %instruction.instruction_id,
                            symbol = %symbol,
                            "no snapshot price for instruction — rejecting"
                        );
                        TxResult::failed(instruction, TxStatus::Rejected, "no_price")
                    }
                }
            })
            .collect()
    }

    async fn close(&self) {
        info!("paper execution gateway closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::instruction_for_test;
    use crate::features::{FeatureVector, GROUP_MARKET_SNAPSHOT};
    use crate::instrument::InstrumentRef;

    fn snapshot(symbol: &str, last: f64) -> FeatureVector {
        FeatureVector::new(
            1,
            Some(InstrumentRef::new(symbol, "binance")),
            GROUP_MARKET_SNAPSHOT,
        )
        .with_number("price.last", last)
    }

    #[tokio::test]
    async fn buy_fills_above_last_by_slippage() {
        let gateway = PaperExecutionGateway::new();
        let instruction = instruction_for_test("BTC/USDT", TradeSide::Buy, 2.0);
        let results = gateway
            .execute(&[instruction], &[snapshot("BTC/USDT", 100.0)])
            .await;

        assert_eq!(results.len(), 1);
        let tx = &results[0];
        assert_eq!(tx.status, TxStatus::Filled);
        assert_eq!(tx.filled_qty, 2.0);
        // 25 bps default slippage.
        assert!((tx.avg_exec_price.unwrap() - 100.25).abs() < 1e-9);
        assert!(tx.fee_cost.is_none());
    }

    #[tokio::test]
    async fn sell_fills_below_last() {
        let gateway = PaperExecutionGateway::new();
        let instruction = instruction_for_test("BTC/USDT", TradeSide::Sell, 1.0);
        let results = gateway
            .execute(&[instruction], &[snapshot("BTC/USDT", 100.0)])
            .await;
        assert!((results[0].avg_exec_price.unwrap() - 99.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn fee_is_charged_on_executed_notional() {
        let gateway = PaperExecutionGateway::with_fee_rate(0.001);
        let instruction = instruction_for_test("BTC/USDT", TradeSide::Buy, 2.0);
        let results = gateway
            .execute(&[instruction], &[snapshot("BTC/USDT", 100.0)])
            .await;
        let tx = &results[0];
        let expected_fee = (100.25 * 2.0) * 0.001;
        assert!((tx.fee_cost.unwrap() - expected_fee).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_price_rejects_with_no_price() {
        let gateway = PaperExecutionGateway::new();
        let instruction = instruction_for_test("ETH/USDT", TradeSide::Buy, 1.0);
        let results = gateway
            .execute(&[instruction], &[snapshot("BTC/USDT", 100.0)])
            .await;
        let tx = &results[0];
        assert_eq!(tx.status, TxStatus::Rejected);
        assert_eq!(tx.reason.as_deref(), Some("no_price"));
        assert_eq!(tx.filled_qty, 0.0);
    }

    #[tokio::test]
    async fn results_preserve_instruction_order() {
        let gateway = PaperExecutionGateway::new();
        let instructions = vec![
            instruction_for_test("BTC/USDT", TradeSide::Buy, 1.0),
            instruction_for_test("ETH/USDT", TradeSide::Sell, 2.0),
        ];
        let results = gateway
            .execute(
                &instructions,
                &[snapshot("BTC/USDT", 100.0), snapshot("ETH/USDT", 2000.0)],
            )
            .await;
        assert_eq!(results[0].instruction_id, instructions[0].instruction_id);
        assert_eq!(results[1].instruction_id, instructions[1].instruction_id);
    }
}
