// =============================================================================
// Trade History & Digest — append-only record stream + rolling summary
// =============================================================================
//
// The recorder is a capped FIFO ring. Appends are O(1) and records are
// immutable once written, with one documented exception: a partial reduce
// pairs itself with the most recent open trade of the same symbol by writing
// exit fields into that trade's payload (`pair_exit`).
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::instrument::InstrumentRef;
use crate::types::{TradeSide, TradeType};

/// Default capacity of the in-memory history ring.
pub const HISTORY_RING_CAPACITY: usize = 200;

/// Default number of execution records aggregated into the digest.
pub const DIGEST_WINDOW: usize = 50;

// =============================================================================
// Trade history entry
// =============================================================================

/// One executed trade. Created only for fills; `exit_ts` is set only when
/// the entry fully closes a prior position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeHistoryEntry {
    pub trade_id: String,
    pub compose_id: String,
    pub instruction_id: String,
    pub strategy_id: String,
    pub instrument: InstrumentRef,
    pub side: TradeSide,
    #[serde(rename = "type")]
    pub trade_type: TradeType,
    pub quantity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_exec_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notional_entry: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notional_exit: Option<f64>,
    pub entry_ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_ts: Option<i64>,
    pub trade_ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holding_ms: Option<i64>,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realized_pnl: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realized_pnl_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leverage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[cfg(test)]
impl TradeHistoryEntry {
    /// Minimal executed fill for accounting tests.
    pub fn fill_for_test(symbol: &str, side: TradeSide, qty: f64, price: f64, fee: f64) -> Self {
        let ts = crate::types::timestamp_ms();
        Self {
            trade_id: crate::types::generate_id("trade"),
            compose_id: "compose-test".into(),
            instruction_id: "compose-test:0".into(),
            strategy_id: "strategy-1".into(),
            instrument: InstrumentRef::new(symbol, "binance"),
            side,
            trade_type: match side {
                TradeSide::Buy => TradeType::Long,
                TradeSide::Sell => TradeType::Short,
            },
            quantity: qty,
            entry_price: Some(price),
            avg_exec_price: Some(price),
            exit_price: None,
            notional_entry: Some(price * qty),
            notional_exit: None,
            entry_ts: ts,
            exit_ts: None,
            trade_ts: ts,
            holding_ms: None,
            unrealized_pnl: 0.0,
            realized_pnl: Some(-fee),
            realized_pnl_pct: None,
            leverage: None,
            fee_cost: (fee > 0.0).then_some(fee),
            note: None,
        }
    }
}

// =============================================================================
// History record
// =============================================================================

/// Kind of a per-cycle checkpoint record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Features,
    Compose,
    Instructions,
    Execution,
}

/// One checkpoint appended by the coordinator. Four are appended per cycle,
/// sharing `reference_id = compose_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub ts_ms: i64,
    pub kind: RecordKind,
    pub reference_id: String,
    pub payload: serde_json::Value,
}

// =============================================================================
// Recorder
// =============================================================================

/// Append-only FIFO ring of history records.
pub struct HistoryRecorder {
    records: RwLock<VecDeque<HistoryRecord>>,
    capacity: usize,
}

impl HistoryRecorder {
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_RING_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    /// Append one record, evicting the oldest when the ring is full.
    pub fn record(&self, record: HistoryRecord) {
        let mut records = self.records.write();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Snapshot of the ring, oldest first.
    pub fn get_records(&self) -> Vec<HistoryRecord> {
        self.records.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Pair a partial reduce with the most recent open trade for `symbol`:
    /// writes `exit_price`, `exit_ts`, `holding_ms`, and `notional_exit`
    /// into that trade's payload and returns its `trade_id`.
    pub fn pair_exit(
        &self,
        symbol: &str,
        exit_price: f64,
        exit_ts: i64,
        exit_qty: f64,
    ) -> Option<String> {
        let mut records = self.records.write();
        for record in records.iter_mut().rev() {
            if record.kind != RecordKind::Execution {
                continue;
            }
            let Some(trades) = record.payload.get_mut("trades").and_then(|t| t.as_array_mut())
            else {
                continue;
            };
            for trade in trades.iter_mut().rev() {
                let matches_symbol = trade["instrument"]["symbol"].as_str() == Some(symbol);
                let still_open = trade["exit_ts"].is_null() && trade["exit_price"].is_null();
                if !matches_symbol || !still_open {
                    continue;
                }

                trade["exit_price"] = serde_json::json!(exit_price);
                trade["exit_ts"] = serde_json::json!(exit_ts);
                if let Some(entry_ts) = trade["entry_ts"].as_i64().or(trade["trade_ts"].as_i64())
                {
                    trade["holding_ms"] = serde_json::json!(exit_ts - entry_ts);
                }
                trade["notional_exit"] = serde_json::json!(exit_price * exit_qty);

                let paired = trade["trade_id"].as_str().map(|s| s.to_string());
                debug!(symbol, paired = ?paired, "annotated open trade with exit fields");
                return paired;
            }
        }
        None
    }
}

impl Default for HistoryRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HistoryRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryRecorder")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

// =============================================================================
// Digest
// =============================================================================

/// Per-instrument aggregate of recent executed trades.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DigestEntry {
    pub trade_count: u64,
    pub realized_pnl: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_trade_ts: Option<i64>,
}

/// Rolling trade summary consumed by the composer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeDigest {
    pub ts_ms: i64,
    pub by_instrument: HashMap<String, DigestEntry>,
}

/// Builds a [`TradeDigest`] from the most recent execution records.
#[derive(Debug)]
pub struct DigestBuilder {
    window: usize,
}

impl DigestBuilder {
    pub fn new() -> Self {
        Self::with_window(DIGEST_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            window: window.max(1),
        }
    }

    pub fn build(&self, records: &[HistoryRecord]) -> TradeDigest {
        let executions: Vec<&HistoryRecord> = records
            .iter()
            .filter(|r| r.kind == RecordKind::Execution)
            .collect();
        let recent = &executions[executions.len().saturating_sub(self.window)..];

        let mut by_instrument: HashMap<String, DigestEntry> = HashMap::new();
        for record in recent {
            let Some(trades) = record.payload.get("trades").and_then(|t| t.as_array()) else {
                continue;
            };
            for trade in trades {
                let Some(symbol) = trade["instrument"]["symbol"].as_str() else {
                    continue;
                };
                let entry = by_instrument.entry(symbol.to_string()).or_default();
                entry.trade_count += 1;
                entry.realized_pnl += trade["realized_pnl"].as_f64().unwrap_or(0.0);
                if let Some(ts) = trade["trade_ts"].as_i64() {
                    entry.last_trade_ts = Some(entry.last_trade_ts.map_or(ts, |t| t.max(ts)));
                }
            }
        }

        let ts_ms = recent
            .last()
            .map(|r| r.ts_ms)
            .unwrap_or_else(crate::types::timestamp_ms);
        TradeDigest { ts_ms, by_instrument }
    }
}

impl Default for DigestBuilder {
    fn default() -> Self {
        Self::new()
    }
}
