use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::history::Turn;
use crate::tools::ToolSchema;

/// A tool call the model wants made.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub call_id: Option<String>,
    pub name: String,
    pub arguments: Map<String, Value>,
}

/// What the model produced for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    /// A final answer for the user.
    Text(String),
    /// One or more tool calls, optionally with text the model emitted alongside them.
    ToolCalls {
        calls: Vec<ToolInvocation>,
        commentary: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub reply: ModelReply,
    pub usage: TokenUsage,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            reply: ModelReply::Text(text.into()),
            usage: TokenUsage::default(),
        }
    }

    pub fn tool_calls(calls: Vec<ToolInvocation>) -> Self {
        Self {
            reply: ModelReply::ToolCalls {
                calls,
                commentary: None,
            },
            usage: TokenUsage::default(),
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("model rejected the request: {0}")]
    Rejected(String),
}

impl ModelError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ModelError::Transport(_) | ModelError::Timeout(_))
    }
}

/// A conversational model that can ask for tool calls.
///
/// Implementations are stateless with respect to conversations: the full
/// history is passed on every call.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(
        &self,
        history: &[Turn],
        tools: &[ToolSchema],
    ) -> Result<ModelResponse, ModelError>;
}
