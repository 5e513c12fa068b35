use std::sync::Arc;

use tracing::{debug, info};

use super::model::ChatModel;
use super::r#loop::{LoopSettings, ToolLoop};
use super::transcript::Scratchpad;
use crate::error::{AgentError, Result};
use crate::session::{SessionKey, SessionStore};
use crate::tools::ToolRegistry;

/// Entry point for callers: routes prompts to sessions and runs the tool loop.
///
/// Cheap to clone; clones share the model, tools and sessions.
#[derive(Clone)]
pub struct Agent {
    model: Arc<dyn ChatModel>,
    tools: Arc<ToolRegistry>,
    sessions: Arc<SessionStore>,
    settings: Arc<LoopSettings>,
    token_limit: Option<u64>,
}

impl Agent {
    pub fn new(
        model: Arc<dyn ChatModel>,
        tools: ToolRegistry,
        sessions: Arc<SessionStore>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            model,
            tools: Arc::new(tools),
            sessions,
            settings: Arc::new(settings),
            token_limit: None,
        }
    }

    /// Refuse prompts for sessions that have used `limit` tokens or more.
    /// A limit of 0 means unlimited.
    pub fn with_token_limit(mut self, limit: u64) -> Self {
        self.token_limit = (limit > 0).then_some(limit);
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Answer `text` within the session for `key`.
    ///
    /// Requests for the same key are handled one at a time in arrival order.
    /// The work runs on its own task, so dropping the returned future does not
    /// stop a prompt halfway: it still finishes and is persisted.
    pub async fn handle_prompt(&self, key: &SessionKey, text: &str) -> Result<String> {
        let agent = self.clone();
        let key = key.clone();
        let text = text.to_string();
        let task = tokio::spawn(async move { agent.run_prompt(&key, &text).await });
        task.await
            .map_err(|e| AgentError::Internal(format!("prompt task failed: {e}")))?
    }

    async fn run_prompt(&self, key: &SessionKey, text: &str) -> Result<String> {
        info!("Prompt from {key} ({} chars)", text.len());
        let tool_loop = ToolLoop::new(self.model.as_ref(), &self.tools, &self.settings);
        let token_limit = self.token_limit;
        let result = self
            .sessions
            .with_exclusive_session(key, |mut lease| async move {
                let used = lease.session().token_count;
                if let Some(limit) = token_limit.filter(|limit| used >= *limit) {
                    let err = AgentError::TokenLimitExceeded {
                        session: lease.session().id.clone(),
                        used,
                        limit,
                    };
                    return (lease, Err(err));
                }
                let outcome = tool_loop.run(&mut lease, text).await;
                (lease, outcome)
            })
            .await;
        match &result {
            Ok(reply) => debug!("Reply to {key}: {} chars", reply.len()),
            Err(e) => info!("Prompt from {key} failed ({}): {e}", e.kind()),
        }
        result
    }

    /// Start the session for `key` over with an empty history.
    pub async fn reset_session(&self, key: &SessionKey) -> Result<()> {
        self.sessions.reset(key).await
    }

    /// Answer a single prompt with no session and nothing stored.
    pub async fn ask(&self, text: &str) -> Result<String> {
        let mut scratch = Scratchpad::new();
        let reply = ToolLoop::new(self.model.as_ref(), &self.tools, &self.settings)
            .run(&mut scratch, text)
            .await;
        debug!("One-shot prompt used {} tokens", scratch.tokens());
        reply
    }
}
