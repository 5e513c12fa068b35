use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::model::{ChatModel, ModelError, ModelReply, ModelResponse, ToolInvocation};
use super::transcript::Transcript;
use crate::error::{AgentError, Result};
use crate::history::{ToolOutcome, Turn};
use crate::tools::{validate_params, ToolRegistry, ToolSchema};

/// Find the largest byte index <= `max` that is a UTF-8 char boundary.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut i = max;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn preview(s: &str) -> String {
    if s.len() > 200 {
        let end = floor_char_boundary(s, 200);
        format!("{}... ({} chars)", &s[..end], s.len())
    } else {
        s.to_string()
    }
}

/// How transient model failures are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub initial_backoff: Duration,
    /// Upper bound for a single model call.
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1u32 << exp)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(500),
            call_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Tool round trips allowed per prompt.
    pub budget: u32,
    pub retry: RetryPolicy,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            budget: 5,
            retry: RetryPolicy::default(),
        }
    }
}

impl LoopSettings {
    pub fn from_config(config: &parley_config::Config) -> Self {
        Self {
            budget: config.agent.max_tool_iterations,
            retry: RetryPolicy {
                max_retries: config.retry.max_retries,
                initial_backoff: Duration::from_millis(config.retry.initial_backoff_ms),
                call_timeout: Duration::from_secs(config.retry.call_timeout_secs),
            },
        }
    }
}

/// Drives one prompt to a final answer.
///
/// Every model request carries the full transcript and every tool schema.
/// Tool requests are answered by running the tool and appending its outcome;
/// a tool that fails or panics produces a failure outcome the model can read,
/// never an error for the caller. After `budget` rounds of tool execution a
/// further tool request ends the prompt with [`AgentError::LoopBudgetExceeded`].
#[derive(Clone, Copy)]
pub struct ToolLoop<'a> {
    model: &'a dyn ChatModel,
    tools: &'a ToolRegistry,
    settings: &'a LoopSettings,
}

impl<'a> ToolLoop<'a> {
    pub fn new(
        model: &'a dyn ChatModel,
        tools: &'a ToolRegistry,
        settings: &'a LoopSettings,
    ) -> Self {
        Self {
            model,
            tools,
            settings,
        }
    }

    pub async fn run<T>(&self, transcript: &mut T, prompt: &str) -> Result<String>
    where
        T: Transcript + ?Sized,
    {
        let budget = self.settings.budget;
        let schemas = self.tools.schemas();

        transcript.append(Turn::user(prompt));
        transcript.checkpoint().await?;

        let mut rounds = 0u32;
        let mut partial = String::new();
        loop {
            let response = self
                .invoke_model(transcript.turns(), &schemas, rounds + 1)
                .await?;
            transcript.record_usage(response.usage);

            let (calls, commentary) = match response.reply {
                ModelReply::Text(text) => {
                    transcript.append(Turn::agent(text.clone()));
                    transcript.checkpoint().await?;
                    return Ok(text);
                }
                ModelReply::ToolCalls { calls, commentary } => (calls, commentary),
            };

            if let Some(text) = commentary.filter(|c| !c.trim().is_empty()) {
                if !partial.is_empty() {
                    partial.push('\n');
                }
                partial.push_str(&text);
                transcript.append(Turn::agent(text));
            }

            if rounds >= budget {
                warn!(
                    "Tool loop budget ({budget}) exhausted; model still requested {} tool call(s)",
                    calls.len()
                );
                transcript.checkpoint().await?;
                return Err(AgentError::LoopBudgetExceeded {
                    budget,
                    partial: (!partial.is_empty()).then_some(partial),
                });
            }
            rounds += 1;

            for call in calls {
                info!(
                    "Tool call [{rounds}/{budget}]: {}({})",
                    call.name,
                    preview(&serde_json::Value::Object(call.arguments.clone()).to_string())
                );
                let outcome = self.execute(&call).await;
                match &outcome {
                    ToolOutcome::Success(value) => {
                        debug!("Tool result [{}]: {}", call.name, preview(&value.to_string()))
                    }
                    ToolOutcome::Failure(reason) => {
                        warn!("Tool '{}' failed: {reason}", call.name)
                    }
                }

                let ToolInvocation {
                    id,
                    call_id,
                    name,
                    arguments,
                } = call;
                transcript.append(Turn::ToolCallRequest {
                    id: id.clone(),
                    call_id,
                    name: name.clone(),
                    arguments,
                });
                transcript.append(Turn::ToolCallResult { id, name, outcome });
                transcript.checkpoint().await?;
            }
        }
    }

    async fn invoke_model(
        &self,
        history: &[Turn],
        schemas: &[ToolSchema],
        round: u32,
    ) -> Result<ModelResponse> {
        let policy = &self.settings.retry;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let started = Instant::now();
            let result =
                match tokio::time::timeout(policy.call_timeout, self.model.invoke(history, schemas))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ModelError::Timeout(policy.call_timeout)),
                };

            match result {
                Ok(response) => {
                    debug!(
                        "LLM response [round {round}] from {} in {:.1}s ({} tokens)",
                        self.model.name(),
                        started.elapsed().as_secs_f64(),
                        response.usage.total
                    );
                    return Ok(response);
                }
                Err(e) if e.is_retryable() && attempt <= policy.max_retries => {
                    let delay = policy.backoff_for(attempt);
                    warn!(
                        "Model call failed (attempt {attempt}/{}): {e}; retrying in {delay:?}",
                        policy.max_retries + 1
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!("Model call failed after {attempt} attempt(s): {e}");
                    return Err(AgentError::ModelUnavailable {
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    async fn execute(&self, call: &ToolInvocation) -> ToolOutcome {
        match self.try_execute(call).await {
            Ok(value) => ToolOutcome::Success(value),
            Err(AgentError::UnknownTool(_)) => ToolOutcome::Failure("unknown tool".into()),
            Err(AgentError::ToolExecution { reason, .. }) => ToolOutcome::Failure(reason),
            Err(other) => ToolOutcome::Failure(other.to_string()),
        }
    }

    async fn try_execute(&self, call: &ToolInvocation) -> Result<Value> {
        let tool = self.tools.resolve(&call.name)?;
        let failed = |reason: String| AgentError::ToolExecution {
            name: call.name.clone(),
            reason,
        };

        let params = Value::Object(call.arguments.clone());
        let errors = validate_params(&params, &tool.parameters_schema());
        if !errors.is_empty() {
            return Err(failed(format!("invalid arguments: {}", errors.join("; "))));
        }

        match AssertUnwindSafe(tool.execute(params)).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(failed(format!("{e:#}"))),
            Err(_) => Err(failed("tool panicked".into())),
        }
    }
}
