//! Conversation turns and their storage codec.

pub mod codec;

pub use codec::{decode, encode, CodecError};

use serde_json::{Map, Value};

/// Outcome of executing a requested tool.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(Value),
    Failure(String),
}

impl ToolOutcome {
    /// The payload handed back to the model: `{"result": ...}` or `{"error": ...}`.
    pub fn to_model_payload(&self) -> Value {
        match self {
            Self::Success(v) => serde_json::json!({ "result": v }),
            Self::Failure(e) => serde_json::json!({ "error": e }),
        }
    }
}

/// One atomic unit of conversation history.
#[derive(Debug, Clone, PartialEq)]
pub enum Turn {
    UserMessage {
        text: String,
    },
    /// Emitted by the model. `id` pairs it with its result; `call_id` is the
    /// provider's own reference, echoed back with the result when present.
    ToolCallRequest {
        id: String,
        call_id: Option<String>,
        name: String,
        arguments: Map<String, Value>,
    },
    ToolCallResult {
        id: String,
        name: String,
        outcome: ToolOutcome,
    },
    AgentMessage {
        text: String,
    },
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self::UserMessage { text: text.into() }
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self::AgentMessage { text: text.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserMessage { .. } => "user",
            Self::ToolCallRequest { .. } => "tool_call",
            Self::ToolCallResult { .. } => "tool_result",
            Self::AgentMessage { .. } => "agent",
        }
    }
}
