// =============================================================================
// Stream Events — the linear event feed a strategy runtime produces
// =============================================================================
//
// Every runtime emits a sequence of `StreamEvent`s consumed by WebSocket
// subscribers and any other in-process listener. Events carry a type tag and
// a JSON payload; component events additionally wrap a component-specific
// payload as a JSON string so the frontend can route on `component_type`.
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::StrategyStatus;

/// Channel capacity for a session's event feed. Slow subscribers that lag
/// beyond this many events miss the oldest ones.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Event model
// =============================================================================

/// Type tag of a stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StrategyStatus,
    UpdateTrade,
    UpdateStrategySummary,
    UpdatePortfolio,
    MessageChunk,
    ComponentGenerator,
    Done,
}

/// Kind of UI component carried by a `component_generator` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    FilteredCardPushNotification,
    FilteredLineChart,
    Status,
    UpdateTrade,
    UpdateStrategySummary,
    UpdatePortfolio,
}

/// One event in a strategy runtime's linear feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub event_type: EventType,
    pub payload_json: serde_json::Value,
}

impl StreamEvent {
    pub fn strategy_status(strategy_id: &str, status: StrategyStatus) -> Self {
        Self {
            event_type: EventType::StrategyStatus,
            payload_json: json!({ "strategy_id": strategy_id, "status": status }),
        }
    }

    /// Full trade history entry payload.
    pub fn update_trade<T: Serialize>(trade: &T) -> Self {
        Self {
            event_type: EventType::UpdateTrade,
            payload_json: serde_json::to_value(trade).unwrap_or_default(),
        }
    }

    /// Full strategy summary payload.
    pub fn update_strategy_summary<T: Serialize>(summary: &T) -> Self {
        Self {
            event_type: EventType::UpdateStrategySummary,
            payload_json: serde_json::to_value(summary).unwrap_or_default(),
        }
    }

    /// Full portfolio view payload.
    pub fn update_portfolio<T: Serialize>(view: &T) -> Self {
        Self {
            event_type: EventType::UpdatePortfolio,
            payload_json: serde_json::to_value(view).unwrap_or_default(),
        }
    }

    /// Free-form text intended for the user.
    pub fn message_chunk(text: impl Into<String>) -> Self {
        Self {
            event_type: EventType::MessageChunk,
            payload_json: json!({ "text": text.into() }),
        }
    }

    /// A typed UI component whose `content` is a JSON string of the
    /// component-specific payload.
    pub fn component_generator(component_type: ComponentType, content: String) -> Self {
        Self {
            event_type: EventType::ComponentGenerator,
            payload_json: json!({ "component_type": component_type, "content": content }),
        }
    }

    /// Terminal marker for a runtime's feed.
    pub fn done(strategy_id: &str) -> Self {
        Self {
            event_type: EventType::Done,
            payload_json: json!({ "strategy_id": strategy_id }),
        }
    }
}

// =============================================================================
// Event sink
// =============================================================================

/// Fan-out handle for one session's event feed.
///
/// Cloneable; all clones feed the same broadcast channel. Emitting with no
/// live subscribers is not an error — the feed simply has no audience yet.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: broadcast::Sender<StreamEvent>,
}

impl EventSink {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Emit one event to every current subscriber.
    pub fn emit(&self, event: StreamEvent) {
        let receivers = self.sender.receiver_count();
        if self.sender.send(event).is_err() {
            debug!(receivers, "event emitted with no subscribers");
        }
    }

    /// Subscribe to the feed from this point forward.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&EventType::ComponentGenerator).unwrap(),
            "\"component_generator\""
        );
        assert_eq!(
            serde_json::to_string(&ComponentType::FilteredLineChart).unwrap(),
            "\"filtered_line_chart\""
        );
    }

    #[test]
    fn component_content_is_a_json_string() {
        let inner = serde_json::to_string(&json!([["Time", "m1"], ["2025-10-21 10:00:00", 1.0]]))
            .unwrap();
        let event = StreamEvent::component_generator(ComponentType::FilteredLineChart, inner);
        let content = event.payload_json["content"].as_str().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(content).unwrap();
        assert_eq!(parsed[0][0], "Time");
    }

    #[tokio::test]
    async fn sink_delivers_in_order() {
        let sink = EventSink::new();
        let mut rx = sink.subscribe();
        sink.emit(StreamEvent::message_chunk("first"));
        sink.emit(StreamEvent::done("strategy-1"));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type, EventType::MessageChunk);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.event_type, EventType::Done);
    }

    #[test]
    fn emitting_without_subscribers_is_fine() {
        let sink = EventSink::new();
        sink.emit(StreamEvent::message_chunk("nobody listening"));
    }
}
