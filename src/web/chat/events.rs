use axum::response::sse::Event;
use bigdecimal::BigDecimal;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

pub const SERVERS_BUSY: &str =
    "Our servers are busy right now. Please try again in a moment.";

/// Progress of one chat turn, streamed to the client as SSE.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TurnEvent {
    Start {
        chat_id: Uuid,
        message_id: Uuid,
        model: String,
    },
    TextDelta {
        delta: String,
    },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        result: Value,
        is_error: bool,
    },
    Finish {
        cost_cents: BigDecimal,
        balance_cents: BigDecimal,
        input_tokens: i64,
        output_tokens: i64,
    },
    Error {
        message: String,
    },
}

impl TurnEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TurnEvent::Start { .. } => "start",
            TurnEvent::TextDelta { .. } => "text-delta",
            TurnEvent::ToolCall { .. } => "tool-call",
            TurnEvent::ToolResult { .. } => "tool-result",
            TurnEvent::Finish { .. } => "finish",
            TurnEvent::Error { .. } => "error",
        }
    }

    pub fn busy() -> Self {
        TurnEvent::Error {
            message: SERVERS_BUSY.to_string(),
        }
    }

    pub fn to_sse(&self) -> Event {
        match serde_json::to_string(self) {
            Ok(data) => Event::default().event(self.name()).data(data),
            Err(e) => {
                tracing::error!("Failed to serialize {} event: {:?}", self.name(), e);
                Event::default().event("error").data("serialization_failed")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    #[test]
    fn test_finish_payload() {
        let event = TurnEvent::Finish {
            cost_cents: BigDecimal::from_str("0.525").unwrap(),
            balance_cents: BigDecimal::from_str("99.475").unwrap(),
            input_tokens: 100,
            output_tokens: 500,
        };
        assert_eq!(event.name(), "finish");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["cost_cents"], "0.525");
        assert_eq!(value["balance_cents"], "99.475");
        assert_eq!(value["input_tokens"], 100);
    }

    #[test]
    fn test_text_delta_payload() {
        let event = TurnEvent::TextDelta {
            delta: "Hello".to_string(),
        };
        assert_eq!(event.name(), "text-delta");
        assert_eq!(serde_json::to_value(&event).unwrap(), json!({"delta": "Hello"}));
    }
}
