// =============================================================================
// Agent Orchestrator — session registry, control commands, instance loops
// =============================================================================
//
// A session hosts any number of independent strategy instances. Each
// instance runs its own coordinator loop as a Tokio task, emitting events to
// the session's sink. Control commands arrive as natural-language strings
// ("stop", "status", optionally scoped by `instance_id:`) or via RPC.
//
// The registry lock guards structural changes only; instance state lives in
// atomics and per-instance locks. A start lock serializes instance startup.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::UserRequest;
use crate::coordinator::DecisionCoordinator;
use crate::data::market::AdapterMarketDataSource;
use crate::data::screenshot::HttpScreenshotSource;
use crate::data::default_candle_configurations;
use crate::decision::{Composer, GridComposer, GridParamAdvisor, LlmComposer};
use crate::error::EngineError;
use crate::events::{ComponentType, EventSink, StreamEvent};
use crate::exchange::SignedRestExchange;
use crate::execution::{ExecutionGateway, LiveExecutionGateway, PaperExecutionGateway};
use crate::features::image::ImageFeatureComputer;
use crate::features::pipeline::FeaturesPipeline;
use crate::history::{DigestBuilder, HistoryRecorder, TradeHistoryEntry};
use crate::instrument::InstrumentRef;
use crate::llm::{ChatModel, OpenRouterClient};
use crate::portfolio::PortfolioService;
use crate::types::{
    generate_id, timestamp_ms, StrategyStatus, StrategySummary, TradingMode,
};

use super::components::{instance_status_card, session_line_chart, ValueHistory};

/// Default simulated capital when a VIRTUAL request omits it.
const DEFAULT_VIRTUAL_CAPITAL: f64 = 100_000.0;

/// Recent trades retained per instance for status cards.
const RECENT_TRADES_CAP: usize = 50;

/// Which composer variant backs a new instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposerKind {
    Grid,
    Llm,
}

/// One running (or stopped) strategy instance.
pub struct InstanceHandle {
    pub instance_id: String,
    pub strategy_id: String,
    pub model_id: String,
    config: UserRequest,
    portfolio: Arc<PortfolioService>,
    coordinator: Mutex<DecisionCoordinator>,
    active: AtomicBool,
    check_count: AtomicU64,
    last_check_ts: RwLock<Option<i64>>,
    created_ts: i64,
    value_history: RwLock<ValueHistory>,
    recent_trades: RwLock<Vec<TradeHistoryEntry>>,
    last_summary: RwLock<Option<StrategySummary>>,
}

impl InstanceHandle {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn check_count(&self) -> u64 {
        self.check_count.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("instance_id", &self.instance_id)
            .field("active", &self.is_active())
            .field("check_count", &self.check_count())
            .finish()
    }
}

/// Per-session multi-strategy registry and lifecycle manager.
pub struct AgentOrchestrator {
    sessions: RwLock<HashMap<String, HashMap<String, Arc<InstanceHandle>>>>,
    sinks: RwLock<HashMap<String, EventSink>>,
    start_lock: Mutex<()>,
}

impl AgentOrchestrator {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            sinks: RwLock::new(HashMap::new()),
            start_lock: Mutex::new(()),
        }
    }

    /// Get or create the event sink for a session.
    pub fn event_sink(&self, session_id: &str) -> EventSink {
        self.sinks
            .write()
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    // =========================================================================
    // Control commands
    // =========================================================================

    /// Interpret a natural-language control command. Returns `true` when the
    /// text matched a command (and was handled), `false` when the caller
    /// should treat it as something else (e.g. a new strategy request).
    pub async fn handle_command(&self, session_id: &str, query: &str) -> bool {
        let lower = query.to_lowercase();

        if ["stop", "pause", "halt", "停止", "暂停"]
            .iter()
            .any(|cmd| lower.contains(cmd))
        {
            self.handle_stop(session_id, query).await;
            return true;
        }

        if ["status", "summary", "状态", "摘要"]
            .iter()
            .any(|cmd| lower.contains(cmd))
        {
            self.handle_status(session_id).await;
            return true;
        }

        false
    }

    async fn handle_stop(&self, session_id: &str, query: &str) {
        let sink = self.event_sink(session_id);

        // Optional `instance_id:` / `instance:` scope.
        let target = query
            .split_once(':')
            .filter(|_| {
                let lower = query.to_lowercase();
                lower.contains("instance_id:") || lower.contains("instance:")
            })
            .map(|(_, rest)| rest.trim().to_string());

        let instances = {
            let sessions = self.sessions.read();
            sessions.get(session_id).cloned().unwrap_or_default()
        };
        if instances.is_empty() {
            sink.emit(StreamEvent::message_chunk(
                "No active trading instances found in this session.",
            ));
            return;
        }

        match target {
            Some(instance_id) => match instances.get(&instance_id) {
                Some(handle) => {
                    handle.active.store(false, Ordering::SeqCst);
                    let value = handle.portfolio.get_view().total_value;
                    info!(session_id, instance_id = %instance_id, "instance stopped");
                    sink.emit(StreamEvent::message_chunk(format!(
                        "**Trading Instance Stopped**\n\nInstance ID: `{instance_id}`\n\
                         Final Portfolio Value: ${value:.2}\n"
                    )));
                }
                None => {
                    sink.emit(StreamEvent::message_chunk(format!(
                        "Instance ID '{instance_id}' not found."
                    )));
                }
            },
            None => {
                let mut count = 0usize;
                for handle in instances.values() {
                    handle.active.store(false, Ordering::SeqCst);
                    count += 1;
                }
                info!(session_id, count, "all instances stopped");
                sink.emit(StreamEvent::message_chunk(format!(
                    "**All Trading Instances Stopped**\n\nStopped {count} instance(s).\n"
                )));
            }
        }
    }

    async fn handle_status(&self, session_id: &str) {
        let sink = self.event_sink(session_id);
        let instances = {
            let sessions = self.sessions.read();
            sessions.get(session_id).cloned().unwrap_or_default()
        };
        if instances.is_empty() {
            sink.emit(StreamEvent::message_chunk(
                "No trading instances found in this session.",
            ));
            return;
        }

        let short_session: String = session_id.chars().take(8).collect();
        let mut message = format!(
            "**Session Status** - {short_session}\n\n**Total Instances:** {}\n\n",
            instances.len()
        );
        let mut ordered: Vec<&Arc<InstanceHandle>> = instances.values().collect();
        ordered.sort_by(|a, b| a.created_ts.cmp(&b.created_ts));

        for handle in ordered {
            let status = if handle.is_active() { "active" } else { "stopped" };
            let view = handle.portfolio.get_view();
            let realized = handle
                .last_summary
                .read()
                .as_ref()
                .map(|s| s.realized_pnl)
                .unwrap_or(0.0);
            message.push_str(&format!(
                "**Instance:** `{}`  ({status})\n\
                 - Model: {}\n\
                 - Symbols: {}\n\
                 - Portfolio Value: ${:.2}\n\
                 - Realized PnL: ${realized:.2}\n\
                 - Open Positions: {}\n\
                 - Trades: {}\n\
                 - Checks: {}\n\n",
                handle.instance_id,
                handle.model_id,
                handle.config.trading_config.symbols.join(", "),
                view.total_value,
                view.open_positions().count(),
                handle.recent_trades.read().len(),
                handle.check_count(),
            ));
        }
        sink.emit(StreamEvent::message_chunk(message));

        if let Some(chart) = self.session_chart(session_id) {
            sink.emit(StreamEvent::component_generator(
                ComponentType::FilteredLineChart,
                chart,
            ));
        }
    }

    /// Equity chart across every instance in the session, one series per
    /// model id.
    fn session_chart(&self, session_id: &str) -> Option<String> {
        let series: Vec<(String, ValueHistory)> = {
            let sessions = self.sessions.read();
            let instances = sessions.get(session_id)?;
            let mut ordered: Vec<&Arc<InstanceHandle>> = instances.values().collect();
            ordered.sort_by(|a, b| a.created_ts.cmp(&b.created_ts));
            ordered
                .iter()
                .map(|handle| (handle.model_id.clone(), handle.value_history.read().clone()))
                .collect()
        };
        session_line_chart(session_id, &series)
    }

    // =========================================================================
    // Instance startup
    // =========================================================================

    /// Create and launch a strategy instance in `session_id`. Returns the
    /// new instance id.
    pub async fn start_strategy(
        self: &Arc<Self>,
        session_id: &str,
        mut request: UserRequest,
        kind: ComposerKind,
    ) -> Result<String, EngineError> {
        request.validate()?;

        let _guard = self.start_lock.lock().await;

        let strategy_id = generate_id("strategy");
        let instance_id = format!(
            "trade_{}_{}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            &strategy_id[strategy_id.len().saturating_sub(8)..]
        );

        let mode = request.exchange_config.trading_mode;
        let market_type = request.exchange_config.market_type;

        // ── Exchange adapter (market data always; orders in LIVE) ────────
        let api_key = std::env::var("MERIDIAN_EXCHANGE_API_KEY").unwrap_or_default();
        let api_secret = std::env::var("MERIDIAN_EXCHANGE_API_SECRET").unwrap_or_default();
        if mode == TradingMode::Live && (api_key.is_empty() || api_secret.is_empty()) {
            return Err(EngineError::Input(
                "LIVE mode requires exchange API credentials".into(),
            ));
        }
        let adapter = Arc::new(SignedRestExchange::new(api_key, api_secret, market_type));

        // ── LLM model (composer, advisor, image analysis) ────────────────
        let llm_api_key = request
            .llm_model_config
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENROUTER_API_KEY").ok());
        let model: Option<Arc<dyn ChatModel>> = llm_api_key.map(|key| {
            Arc::new(OpenRouterClient::new(key, request.llm_model_config.model_id.clone()))
                as Arc<dyn ChatModel>
        });

        // ── Features pipeline, with the optional image stage ─────────────
        let market_source = Arc::new(AdapterMarketDataSource::new(adapter.clone()));
        let mut pipeline = FeaturesPipeline::new(
            request.trading_config.symbols.clone(),
            request.exchange_config.exchange_id.clone(),
            market_source,
            default_candle_configurations(),
        );
        if let (Ok(render_endpoint), Ok(dashboard_url), Some(model)) = (
            std::env::var("MERIDIAN_RENDER_ENDPOINT"),
            std::env::var("MERIDIAN_DASHBOARD_URL"),
            model.as_ref(),
        ) {
            let screenshot = HttpScreenshotSource::new(
                render_endpoint,
                dashboard_url,
                InstrumentRef::new("BTC/USD", request.exchange_config.exchange_id.clone()),
            );
            pipeline = pipeline.with_image_stage(
                Arc::new(screenshot),
                ImageFeatureComputer::new(model.clone()),
            );
        } else {
            info!("image analysis stage not configured; proceeding without it");
        }
        let pipeline = Arc::new(pipeline);
        pipeline.open().await;

        // ── Composer ─────────────────────────────────────────────────────
        let composer = match kind {
            ComposerKind::Grid => {
                let mut grid = GridComposer::new(request.clone());
                if let Some(model) = &model {
                    grid = grid.with_advisor(GridParamAdvisor::new(model.clone()));
                } else {
                    warn!("no LLM credentials; grid runs with static parameters");
                }
                Composer::Grid(grid)
            }
            ComposerKind::Llm => {
                let model = model.clone().ok_or_else(|| {
                    EngineError::Input("LLM composer requires model credentials".into())
                })?;
                Composer::Llm(LlmComposer::new(request.clone(), model))
            }
        };

        // ── Portfolio + gateway + coordinator ────────────────────────────
        let initial_capital = match mode {
            TradingMode::Virtual => request
                .trading_config
                .initial_capital
                .unwrap_or(DEFAULT_VIRTUAL_CAPITAL),
            // LIVE balances come from reconciliation.
            TradingMode::Live => request.trading_config.initial_capital.unwrap_or(0.0),
        };
        let portfolio = Arc::new(PortfolioService::new(
            strategy_id.clone(),
            initial_capital,
            market_type,
            mode,
        ));
        let gateway: Arc<dyn ExecutionGateway> = match mode {
            TradingMode::Live => Arc::new(LiveExecutionGateway::new(adapter.clone())),
            TradingMode::Virtual => Arc::new(PaperExecutionGateway::new()),
        };

        let mut coordinator = DecisionCoordinator::new(
            request.clone(),
            strategy_id.clone(),
            portfolio.clone(),
            pipeline,
            composer,
            gateway,
            Arc::new(HistoryRecorder::new()),
            DigestBuilder::new(),
        );
        if mode == TradingMode::Live {
            coordinator = coordinator.with_adapter(adapter);
        }

        let handle = Arc::new(InstanceHandle {
            instance_id: instance_id.clone(),
            strategy_id: strategy_id.clone(),
            model_id: request.llm_model_config.model_id.clone(),
            config: request,
            portfolio,
            coordinator: Mutex::new(coordinator),
            active: AtomicBool::new(true),
            check_count: AtomicU64::new(0),
            last_check_ts: RwLock::new(None),
            created_ts: timestamp_ms(),
            value_history: RwLock::new(Vec::new()),
            recent_trades: RwLock::new(Vec::new()),
            last_summary: RwLock::new(None),
        });

        self.sessions
            .write()
            .entry(session_id.to_string())
            .or_default()
            .insert(instance_id.clone(), handle.clone());

        let sink = self.event_sink(session_id);
        sink.emit(StreamEvent::strategy_status(
            &strategy_id,
            StrategyStatus::Running,
        ));
        sink.emit(StreamEvent::message_chunk(format!(
            "**Trading Instance Created**\n\nInstance ID: `{instance_id}`\n\
             Symbols: {}\nMode: {}\nCheck Interval: {}s\n",
            handle.config.trading_config.symbols.join(", "),
            handle.config.exchange_config.trading_mode,
            handle.config.trading_config.decide_interval,
        )));
        let initial_view = handle.portfolio.get_view();
        sink.emit(StreamEvent::message_chunk(format!(
            "**Initial Portfolio**\nTotal Value: ${:.2}\nAvailable: ${:.2}\n",
            initial_view.total_value, initial_view.available_cash
        )));
        sink.emit(StreamEvent::update_portfolio(&initial_view));

        info!(
            session_id,
            instance_id = %instance_id,
            strategy_id = %strategy_id,
            "strategy instance launched"
        );

        let orchestrator = self.clone();
        let session = session_id.to_string();
        tokio::spawn(async move {
            orchestrator.run_instance(session, handle).await;
        });

        Ok(instance_id)
    }

    // =========================================================================
    // Instance loop
    // =========================================================================

    async fn run_instance(self: Arc<Self>, session_id: String, handle: Arc<InstanceHandle>) {
        let sink = self.event_sink(&session_id);
        let interval = handle.config.trading_config.decide_interval;

        while handle.is_active() {
            let check = handle.check_count.fetch_add(1, Ordering::SeqCst) + 1;
            *handle.last_check_ts.write() = Some(timestamp_ms());

            let cycle = {
                let mut coordinator = handle.coordinator.lock().await;
                coordinator.run_once().await
            };

            match cycle {
                Ok(cycle) => {
                    // Market analysis block.
                    sink.emit(StreamEvent::message_chunk(format!(
                        "**Check #{check}** — `{}`\n\n{}\n",
                        handle.instance_id, cycle.rationale
                    )));

                    // Per-trade notifications.
                    for trade in &cycle.trades {
                        sink.emit(StreamEvent::update_trade(trade));
                        let pnl = trade
                            .realized_pnl
                            .map(|p| format!("{p:.2}"))
                            .unwrap_or_else(|| "n/a".into());
                        sink.emit(StreamEvent::message_chunk(format!(
                            "**Trade Executed**: {} {} qty={:.6} price={:.4} pnl={pnl}\n",
                            trade.side,
                            trade.instrument.symbol,
                            trade.quantity,
                            trade.avg_exec_price.unwrap_or(0.0),
                        )));
                    }

                    sink.emit(StreamEvent::update_strategy_summary(&cycle.strategy_summary));
                    sink.emit(StreamEvent::update_portfolio(&cycle.portfolio_view));

                    handle
                        .value_history
                        .write()
                        .push((cycle.timestamp_ms, cycle.portfolio_view.total_value));
                    {
                        let mut recent = handle.recent_trades.write();
                        recent.extend(cycle.trades.iter().cloned());
                        let overflow = recent.len().saturating_sub(RECENT_TRADES_CAP);
                        if overflow > 0 {
                            recent.drain(..overflow);
                        }
                    }
                    *handle.last_summary.write() = Some(cycle.strategy_summary.clone());

                    // Stop requested by the composer: flatten after the
                    // cycle's summary has been emitted.
                    if cycle.strategy_summary.status == StrategyStatus::Stopped {
                        warn!(
                            instance_id = %handle.instance_id,
                            "strategy requested stop; closing all positions"
                        );
                        let trades = {
                            let mut coordinator = handle.coordinator.lock().await;
                            coordinator.close_all_positions().await
                        };
                        for trade in &trades {
                            sink.emit(StreamEvent::update_trade(trade));
                        }
                        sink.emit(StreamEvent::strategy_status(
                            &handle.strategy_id,
                            StrategyStatus::Stopped,
                        ));
                        handle.active.store(false, Ordering::SeqCst);
                        break;
                    }

                    if check % 5 == 0 {
                        let card = instance_status_card(
                            &handle.instance_id,
                            &cycle.strategy_summary,
                            &cycle.portfolio_view,
                            &handle.recent_trades.read(),
                            check,
                            handle.is_active(),
                        );
                        sink.emit(StreamEvent::component_generator(
                            ComponentType::FilteredCardPushNotification,
                            card,
                        ));
                    }
                    if check % 10 == 0 {
                        if let Some(chart) = self.session_chart(&session_id) {
                            sink.emit(StreamEvent::component_generator(
                                ComponentType::FilteredLineChart,
                                chart,
                            ));
                        }
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!(
                        instance_id = %handle.instance_id,
                        error = %e,
                        "fatal error in strategy loop"
                    );
                    sink.emit(StreamEvent::strategy_status(
                        &handle.strategy_id,
                        StrategyStatus::Error,
                    ));
                    let mut coordinator = handle.coordinator.lock().await;
                    coordinator.close_all_positions().await;
                    handle.active.store(false, Ordering::SeqCst);
                    break;
                }
                Err(e) => {
                    // Recoverable: warn, sleep one interval, retry.
                    error!(
                        instance_id = %handle.instance_id,
                        kind = e.kind(),
                        error = %e,
                        "error during trading cycle; retrying next interval"
                    );
                    sink.emit(StreamEvent::message_chunk(format!(
                        "**Error during trading cycle**: {e}\nContinuing with next check.\n"
                    )));
                }
            }

            tokio::time::sleep(std::time::Duration::from_secs(interval)).await;
        }

        let mut coordinator = handle.coordinator.lock().await;
        coordinator.close().await;
        sink.emit(StreamEvent::done(&handle.strategy_id));
        info!(instance_id = %handle.instance_id, "instance loop ended");
    }

    /// Stop every instance in every session (graceful shutdown).
    pub fn shutdown(&self) {
        let sessions = self.sessions.read();
        for instances in sessions.values() {
            for handle in instances.values() {
                handle.active.store(false, Ordering::SeqCst);
            }
        }
        info!("orchestrator shutdown requested");
    }

    /// Snapshot of instance ids per session (for the REST surface).
    pub fn list_instances(&self, session_id: &str) -> Vec<(String, bool, u64)> {
        let sessions = self.sessions.read();
        sessions
            .get(session_id)
            .map(|instances| {
                let mut out: Vec<_> = instances
                    .values()
                    .map(|h| (h.instance_id.clone(), h.is_active(), h.check_count()))
                    .collect();
                out.sort_by(|a, b| a.0.cmp(&b.0));
                out
            })
            .unwrap_or_default()
    }
}

impl Default for AgentOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AgentOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentOrchestrator")
            .field("sessions", &self.sessions.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::market::stubs::StubExchange;
    use crate::data::CandleConfig;
    use crate::events::EventType;
    use crate::types::MarketType;

    fn request() -> UserRequest {
        let mut req: UserRequest = serde_json::from_str(
            r#"{
                "llm_model_config": {"provider": "openrouter", "model_id": "deepseek/deepseek-v3"},
                "exchange_config": {"exchange_id": "binance"},
                "trading_config": {"symbols": ["BTC/USDT"], "decide_interval": 1}
            }"#,
        )
        .unwrap();
        req.validate().unwrap();
        req
    }

    fn stub_handle(orchestrator: &AgentOrchestrator, session_id: &str, instance_id: &str)
        -> Arc<InstanceHandle>
    {
        let req = request();
        let portfolio = Arc::new(PortfolioService::new(
            "strategy-1",
            100_000.0,
            MarketType::Spot,
            TradingMode::Virtual,
        ));
        let adapter = Arc::new(StubExchange::default().with_ticker("BTC/USDT", 100.0, 100.0));
        let pipeline = Arc::new(FeaturesPipeline::new(
            vec!["BTC/USDT".into()],
            "binance",
            Arc::new(AdapterMarketDataSource::new(adapter)),
            vec![CandleConfig::new("1m", 10)],
        ));
        let coordinator = DecisionCoordinator::new(
            req.clone(),
            "strategy-1",
            portfolio.clone(),
            pipeline,
            Composer::Grid(GridComposer::new(req.clone())),
            Arc::new(PaperExecutionGateway::new()),
            Arc::new(HistoryRecorder::new()),
            DigestBuilder::new(),
        );

        let handle = Arc::new(InstanceHandle {
            instance_id: instance_id.to_string(),
            strategy_id: "strategy-1".into(),
            model_id: req.llm_model_config.model_id.clone(),
            config: req,
            portfolio,
            coordinator: Mutex::new(coordinator),
            active: AtomicBool::new(true),
            check_count: AtomicU64::new(0),
            last_check_ts: RwLock::new(None),
            created_ts: timestamp_ms(),
            value_history: RwLock::new(vec![(1_730_000_000_000, 100_000.0)]),
            recent_trades: RwLock::new(Vec::new()),
            last_summary: RwLock::new(None),
        });
        orchestrator
            .sessions
            .write()
            .entry(session_id.to_string())
            .or_default()
            .insert(instance_id.to_string(), handle.clone());
        handle
    }

    #[tokio::test]
    async fn stop_command_halts_all_instances() {
        let orchestrator = AgentOrchestrator::new();
        let a = stub_handle(&orchestrator, "session-1", "trade_a");
        let b = stub_handle(&orchestrator, "session-1", "trade_b");

        assert!(orchestrator.handle_command("session-1", "please stop").await);
        assert!(!a.is_active());
        assert!(!b.is_active());
    }

    #[tokio::test]
    async fn stop_command_scopes_to_instance_id() {
        let orchestrator = AgentOrchestrator::new();
        let a = stub_handle(&orchestrator, "session-1", "trade_a");
        let b = stub_handle(&orchestrator, "session-1", "trade_b");

        assert!(
            orchestrator
                .handle_command("session-1", "stop instance_id: trade_a")
                .await
        );
        assert!(!a.is_active());
        assert!(b.is_active());
    }

    #[tokio::test]
    async fn chinese_commands_are_recognized() {
        let orchestrator = AgentOrchestrator::new();
        let a = stub_handle(&orchestrator, "session-1", "trade_a");

        assert!(orchestrator.handle_command("session-1", "暂停").await);
        assert!(!a.is_active());
        assert!(orchestrator.handle_command("session-1", "状态").await);
    }

    #[tokio::test]
    async fn status_command_emits_summary_and_chart() {
        let orchestrator = AgentOrchestrator::new();
        stub_handle(&orchestrator, "session-1", "trade_a");
        let sink = orchestrator.event_sink("session-1");
        let mut rx = sink.subscribe();

        assert!(orchestrator.handle_command("session-1", "status please").await);

        let message = rx.recv().await.unwrap();
        assert_eq!(message.event_type, EventType::MessageChunk);
        assert!(message.payload_json["text"]
            .as_str()
            .unwrap()
            .contains("trade_a"));

        let chart = rx.recv().await.unwrap();
        assert_eq!(chart.event_type, EventType::ComponentGenerator);
        assert_eq!(
            chart.payload_json["component_type"],
            serde_json::json!("filtered_line_chart")
        );
    }

    #[tokio::test]
    async fn unknown_text_is_not_a_command() {
        let orchestrator = AgentOrchestrator::new();
        assert!(
            !orchestrator
                .handle_command("session-1", "trade bitcoin with 100k")
                .await
        );
    }

    #[tokio::test]
    async fn shutdown_deactivates_every_session() {
        let orchestrator = AgentOrchestrator::new();
        let a = stub_handle(&orchestrator, "session-1", "trade_a");
        let b = stub_handle(&orchestrator, "session-2", "trade_b");

        orchestrator.shutdown();
        assert!(!a.is_active());
        assert!(!b.is_active());
    }

    #[tokio::test]
    async fn list_instances_reports_registry_state() {
        let orchestrator = AgentOrchestrator::new();
        stub_handle(&orchestrator, "session-1", "trade_a");
        stub_handle(&orchestrator, "session-1", "trade_b");

        let listed = orchestrator.list_instances("session-1");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0, "trade_a");
        assert!(listed[0].1);
        assert!(orchestrator.list_instances("session-x").is_empty());
    }
}
