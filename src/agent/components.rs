// =============================================================================
// UI component payloads — status cards and session equity charts
// =============================================================================
//
// Component payloads are serialized to a JSON string and wrapped in a
// `component_generator` event, so the frontend can route on
// `component_type` without knowing each payload shape.
// =============================================================================

use chrono::{TimeZone, Utc};
use serde_json::json;

use crate::history::TradeHistoryEntry;
use crate::portfolio::PortfolioView;
use crate::types::StrategySummary;

/// Wall-clock format used in chart rows and card timestamps.
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn format_ts(ts_ms: i64) -> String {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .map(|dt| dt.format(TIME_FORMAT).to_string())
        .unwrap_or_default()
}

/// One instance's equity history: `(timestamp_ms, portfolio_value)` samples.
pub type ValueHistory = Vec<(i64, f64)>;

/// Card payload for one running instance: summary numbers, open positions,
/// and the most recent trades.
pub fn instance_status_card(
    instance_id: &str,
    summary: &StrategySummary,
    view: &PortfolioView,
    recent_trades: &[TradeHistoryEntry],
    check_count: u64,
    active: bool,
) -> String {
    let positions: Vec<serde_json::Value> = view
        .open_positions()
        .map(|(symbol, pos)| {
            json!({
                "symbol": symbol,
                "type": pos.trade_type,
                "entry_price": pos.avg_price,
                "mark_price": pos.mark_price,
                "quantity": pos.quantity.abs(),
                "unrealized_pnl": pos.unrealized_pnl,
            })
        })
        .collect();

    let trades: Vec<serde_json::Value> = recent_trades
        .iter()
        .rev()
        .take(5)
        .map(|trade| {
            json!({
                "time": format_ts(trade.trade_ts),
                "symbol": trade.instrument.symbol,
                "side": trade.side,
                "type": trade.trade_type,
                "price": trade.avg_exec_price,
                "pnl": trade.realized_pnl,
            })
        })
        .collect();

    let data = json!({
        "summary": {
            "instance_id": instance_id,
            "model": summary.model_id,
            "status": if active { "active" } else { "stopped" },
            "total_value": summary.total_value,
            "realized_pnl": summary.realized_pnl,
            "unrealized_pnl": summary.unrealized_pnl,
            "open_positions": positions.len(),
            "check_count": check_count,
        },
        "current_positions": positions,
        "recent_trades": trades,
    });

    json!({
        "title": format!("Trading Instance: {instance_id}"),
        "data": data.to_string(),
        "filters": [summary.model_id],
        "table_title": "Instance Details",
        "create_time": format_ts(crate::types::timestamp_ms()),
    })
    .to_string()
}

/// Session-level equity chart: one series per model id.
///
/// Output `data` is a 2D array — header `["Time", model…]`, rows sorted
/// ascending by time, missing cells filled with 0. Returns `None` when no
/// instance has any history yet.
pub fn session_line_chart(session_id: &str, series: &[(String, ValueHistory)]) -> Option<String> {
    let mut model_ids: Vec<&str> = Vec::new();
    let mut rows: std::collections::BTreeMap<String, std::collections::HashMap<&str, f64>> =
        std::collections::BTreeMap::new();

    for (model_id, history) in series {
        if !model_ids.contains(&model_id.as_str()) {
            model_ids.push(model_id.as_str());
        }
        for (ts_ms, value) in history {
            rows.entry(format_ts(*ts_ms))
                .or_default()
                .insert(model_id.as_str(), *value);
        }
    }
    if rows.is_empty() {
        return None;
    }

    let mut data: Vec<Vec<serde_json::Value>> = Vec::with_capacity(rows.len() + 1);
    let mut header: Vec<serde_json::Value> = vec![json!("Time")];
    header.extend(model_ids.iter().map(|m| json!(m)));
    data.push(header);

    for (time, values) in &rows {
        let mut row: Vec<serde_json::Value> = vec![json!(time)];
        for model_id in &model_ids {
            row.push(json!(values.get(model_id).copied().unwrap_or(0.0)));
        }
        data.push(row);
    }

    let short_session: String = session_id.chars().take(8).collect();
    Some(
        json!({
            "title": format!("Portfolio Value History - Session {short_session}"),
            "data": serde_json::to_string(&data).unwrap_or_default(),
            "create_time": format_ts(crate::types::timestamp_ms()),
        })
        .to_string(),
    )
}
