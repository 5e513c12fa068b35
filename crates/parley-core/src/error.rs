//! Error types for the agent runtime.

use thiserror::Error;

use crate::history::CodecError;

/// Errors surfaced by the tool registry, session store and tool-calling loop.
///
/// `UnknownTool` and `ToolExecution` never reach a caller of
/// [`Agent::handle_prompt`](crate::agent::Agent::handle_prompt); the loop turns
/// them into tool results the model gets to see.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("tool '{0}' is already registered")]
    DuplicateTool(String),

    #[error("tool '{name}' failed: {reason}")]
    ToolExecution { name: String, reason: String },

    /// The model kept requesting tools after the per-prompt budget ran out.
    #[error("tool loop budget of {budget} round trips exhausted")]
    LoopBudgetExceeded {
        budget: u32,
        /// Text the model produced alongside its tool calls, if any.
        partial: Option<String>,
    },

    #[error("model unavailable after {attempts} attempt(s): {reason}")]
    ModelUnavailable { attempts: u32, reason: String },

    /// A turn could not be written in a form that reads back identically.
    #[error("cannot serialize turn {index} (tool '{tool}'): {reason}")]
    Serialization {
        index: usize,
        tool: String,
        reason: String,
    },

    #[error("stored history is unreadable: {0}")]
    CorruptHistory(String),

    #[error("session '{0}' has expired")]
    SessionExpired(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    /// The session token belongs to a different user.
    #[error("session '{session}' does not belong to user '{user}'")]
    SessionForbidden { session: String, user: String },

    /// The session has used up its token allowance; only a reset reopens it.
    #[error("token limit exceeded for session '{session}': {used} of {limit} used")]
    TokenLimitExceeded {
        session: String,
        used: u64,
        limit: u64,
    },

    #[error("session storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    pub(crate) fn storage(err: anyhow::Error) -> Self {
        Self::Storage(format!("{err:#}"))
    }

    /// Short machine-readable classification for callers that map errors to responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownTool(_) => "unknown_tool",
            Self::DuplicateTool(_) => "duplicate_tool",
            Self::ToolExecution { .. } => "tool_execution",
            Self::LoopBudgetExceeded { .. } => "loop_budget_exceeded",
            Self::ModelUnavailable { .. } => "model_unavailable",
            Self::Serialization { .. } => "serialization",
            Self::CorruptHistory(_) => "corrupt_history",
            Self::SessionExpired(_) => "session_expired",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionForbidden { .. } => "session_forbidden",
            Self::TokenLimitExceeded { .. } => "token_limit_exceeded",
            Self::Storage(_) => "storage",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<CodecError> for AgentError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Unencodable {
                index,
                tool,
                reason,
            } => Self::Serialization {
                index,
                tool,
                reason,
            },
            other => Self::CorruptHistory(other.to_string()),
        }
    }
}

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;
