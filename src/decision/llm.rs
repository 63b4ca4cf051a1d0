// =============================================================================
// LLM Composer — plan-proposed trading decisions
// =============================================================================
//
// Builds a JSON prompt from the compose context, expects a structured plan
// back, and pushes it through the shared normalization guardrails. Any model
// failure returns a neutral empty plan so the pipeline always terminates.
// =============================================================================

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::UserRequest;
use crate::features::{price_map, GROUP_MARKET_SNAPSHOT};
use crate::instrument::InstrumentRef;
use crate::llm::{extract_json, ChatModel};
use crate::types::TradeAction;

use super::normalize::{normalize_plan, NormalizeSettings};
use super::{ComposeContext, ComposeResult, TradeDecisionItem, VenueConstraints};

/// Rationale substituted when the model call or validation fails.
const LLM_FAILURE_RATIONALE: &str = "LLM call failed";

/// Wire format of one plan item as produced by the model.
#[derive(Debug, Deserialize)]
struct RawPlanItem {
    symbol: String,
    action: TradeAction,
    #[serde(default)]
    target_qty: f64,
    #[serde(default)]
    leverage: Option<f64>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    rationale: Option<String>,
}

/// Wire format of the full plan.
#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    items: Vec<RawPlanItem>,
    #[serde(default)]
    rationale: Option<String>,
}

/// LLM-driven composer.
pub struct LlmComposer {
    request: UserRequest,
    model: Arc<dyn ChatModel>,
    strategy_prompt: Option<String>,
    settings: NormalizeSettings,
}

impl LlmComposer {
    pub fn new(request: UserRequest, model: Arc<dyn ChatModel>) -> Self {
        let settings = NormalizeSettings {
            max_positions: Some(request.trading_config.max_positions),
            ..Default::default()
        };
        Self {
            request,
            model,
            strategy_prompt: None,
            settings,
        }
    }

    /// Free-text strategy instructions injected into every prompt.
    pub fn with_strategy_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.strategy_prompt = Some(prompt.into());
        self
    }

    pub async fn compose(&mut self, context: &ComposeContext) -> ComposeResult {
        let prompt = self.build_prompt(context);
        debug!(compose_id = %context.compose_id, "built LLM compose prompt");

        let response = match self.model.complete(&prompt).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "LLM invocation failed");
                return ComposeResult::empty(LLM_FAILURE_RATIONALE);
            }
        };

        let plan: RawPlan = match extract_json(&response)
            .ok_or_else(|| anyhow::anyhow!("no JSON in model response"))
            .and_then(|raw| serde_json::from_str(raw).map_err(Into::into))
        {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "LLM plan failed validation");
                return ComposeResult::empty(LLM_FAILURE_RATIONALE);
            }
        };

        if plan.items.is_empty() {
            debug!(compose_id = %context.compose_id, "LLM returned an empty plan");
            return ComposeResult::empty(plan.rationale.unwrap_or_else(|| "No action".into()));
        }

        let exchange_id = &self.request.exchange_config.exchange_id;
        let items: Vec<TradeDecisionItem> = plan
            .items
            .into_iter()
            .map(|raw| TradeDecisionItem {
                instrument: InstrumentRef::normalized(
                    &raw.symbol,
                    exchange_id.clone(),
                    self.request.exchange_config.market_type,
                ),
                action: raw.action,
                target_qty: raw.target_qty,
                leverage: raw.leverage,
                confidence: raw.confidence,
                rationale: raw.rationale,
            })
            .collect();

        let market_features: Vec<_> = context
            .features
            .iter()
            .filter(|fv| fv.group_by() == Some(GROUP_MARKET_SNAPSHOT))
            .cloned()
            .collect();
        let prices = price_map(&market_features);

        let default_constraints = VenueConstraints::default();
        let normalized = normalize_plan(
            &context.compose_id,
            &context.portfolio,
            &items,
            context.constraints.as_ref().unwrap_or(&default_constraints),
            &prices,
            &self.settings,
        );

        let mut rationale = plan.rationale.unwrap_or_else(|| "LLM plan".into());
        if !normalized.skipped.is_empty() {
            rationale.push_str(&format!(". Skipped: {}", normalized.skipped.join("; ")));
        }

        ComposeResult {
            instructions: normalized.instructions,
            rationale,
            should_stop: false,
        }
    }

    fn build_prompt(&self, context: &ComposeContext) -> String {
        let market_features: Vec<_> = context
            .features
            .iter()
            .filter(|fv| fv.group_by() == Some(GROUP_MARKET_SNAPSHOT))
            .cloned()
            .collect();

        let payload = json!({
            "strategy_prompt": self.strategy_prompt,
            "compose_id": context.compose_id,
            "timestamp": context.ts,
            "symbols": self.request.trading_config.symbols,
            "portfolio": context.portfolio,
            "market_snapshot": price_map(&market_features),
            "digest": context.digest,
            "features": context.features,
            "constraints": context.constraints,
        });

        format!(
            "You are a trading strategy planner. Analyze the JSON context and \
             produce a structured plan as a JSON object: {{\"items\": [{{\"symbol\", \
             \"action\" (OPEN_LONG|OPEN_SHORT|CLOSE_LONG|CLOSE_SHORT|FLAT|NOOP), \
             \"target_qty\", \"leverage\", \"confidence\", \"rationale\"}}], \
             \"rationale\"}}. OPEN actions give the absolute position size to \
             hold; CLOSE actions give the quantity to close. Focus on \
             risk-aware, executable decisions.\n\nContext:\n{}",
            serde_json::to_string_pretty(&payload).unwrap_or_default()
        )
    }
}

impl std::fmt::Debug for LlmComposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmComposer")
            .field("symbols", &self.request.trading_config.symbols)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureVector;
    use crate::history::TradeDigest;
    use crate::portfolio::PortfolioView;
    use crate::types::TradeSide;
    use anyhow::Result;
    use async_trait::async_trait;

    struct FixedModel(Result<String, String>);

    #[async_trait]
    impl ChatModel for FixedModel {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            match &self.0 {
                Ok(s) => Ok(s.clone()),
                Err(e) => anyhow::bail!("{e}"),
            }
        }
        async fn complete_with_images(
            &self,
            _prompt: &str,
            _images: &[crate::data::screenshot::CapturedImage],
        ) -> Result<String> {
            unimplemented!("text-only composer")
        }
    }

    fn request() -> UserRequest {
        let mut req: UserRequest = serde_json::from_str(
            r#"{
                "llm_model_config": {"provider": "openrouter", "model_id": "deepseek/deepseek-v3"},
                "exchange_config": {"exchange_id": "binance"},
                "trading_config": {"symbols": ["ETH/USDT"]}
            }"#,
        )
        .unwrap();
        req.validate().unwrap();
        req
    }

    fn snapshot_feature(symbol: &str, last: f64) -> FeatureVector {
        FeatureVector::new(
            1_730_000_000_000,
            Some(InstrumentRef::new(symbol, "binance")),
            GROUP_MARKET_SNAPSHOT,
        )
        .with_number("price.last", last)
    }

    fn context(constraints: Option<VenueConstraints>) -> ComposeContext {
        ComposeContext {
            ts: 1_730_000_000_000,
            compose_id: "compose-1".into(),
            strategy_id: "strategy-1".into(),
            features: vec![snapshot_feature("ETH/USDT", 2000.0)],
            portfolio: PortfolioView::new("strategy-1", 10_000.0),
            digest: TradeDigest {
                ts_ms: 0,
                by_instrument: Default::default(),
            },
            constraints,
        }
    }

    #[tokio::test]
    async fn valid_plan_yields_normalized_instructions() {
        let plan = r#"{"items": [{"symbol": "ETH/USDT", "action": "OPEN_LONG",
            "target_qty": 1.5, "confidence": 0.8, "rationale": "momentum"}],
            "rationale": "buy the dip"}"#;
        let mut composer = LlmComposer::new(request(), Arc::new(FixedModel(Ok(plan.into()))));

        let result = composer.compose(&context(None)).await;
        assert_eq!(result.instructions.len(), 1);
        let instruction = &result.instructions[0];
        assert_eq!(instruction.side, TradeSide::Buy);
        assert!((instruction.quantity - 1.5).abs() < 1e-9);
        assert!(result.rationale.contains("buy the dip"));
        assert!(!result.should_stop);
    }

    #[tokio::test]
    async fn model_failure_returns_empty_plan_with_fixed_rationale() {
        let mut composer =
            LlmComposer::new(request(), Arc::new(FixedModel(Err("timeout".into()))));
        let result = composer.compose(&context(None)).await;
        assert!(result.instructions.is_empty());
        assert_eq!(result.rationale, "LLM call failed");
    }

    #[tokio::test]
    async fn malformed_json_returns_empty_plan() {
        let mut composer = LlmComposer::new(
            request(),
            Arc::new(FixedModel(Ok("the market looks choppy".into()))),
        );
        let result = composer.compose(&context(None)).await;
        assert!(result.instructions.is_empty());
        assert_eq!(result.rationale, "LLM call failed");
    }

    #[tokio::test]
    async fn min_notional_undercut_is_skipped_and_reported() {
        let plan = r#"{"items": [{"symbol": "ETH/USDT", "action": "OPEN_LONG",
            "target_qty": 0.0001}], "rationale": "tiny nibble"}"#;
        let mut composer = LlmComposer::new(request(), Arc::new(FixedModel(Ok(plan.into()))));
        let constraints = VenueConstraints {
            min_notional: Some(5.0),
            ..Default::default()
        };

        let result = composer.compose(&context(Some(constraints))).await;
        assert!(result.instructions.is_empty());
        assert!(result.rationale.contains("min_notional"));
    }

    #[tokio::test]
    async fn symbols_are_normalized_before_use() {
        let plan = r#"{"items": [{"symbol": "ETH-USDT", "action": "OPEN_LONG",
            "target_qty": 1.0}]}"#;
        let mut composer = LlmComposer::new(request(), Arc::new(FixedModel(Ok(plan.into()))));
        let result = composer.compose(&context(None)).await;
        assert_eq!(result.instructions[0].instrument.symbol, "ETH/USDT");
    }
}
