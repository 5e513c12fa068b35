use async_trait::async_trait;
#[allow(deprecated)]
use rig::client::completion::CompletionModelHandle;
use rig::completion::{CompletionError, CompletionModel, CompletionRequest, Message, ToolDefinition};
use rig::message::{AssistantContent, Text, ToolResult, ToolResultContent, UserContent};
use rig::OneOrMany;
use serde_json::{Map, Value};
use tracing::debug;

use super::model::{ChatModel, ModelError, ModelReply, ModelResponse, TokenUsage, ToolInvocation};
use crate::history::Turn;
use crate::tools::ToolSchema;

/// Stands in for a reply with neither text nor tool calls.
const EMPTY_REPLY: &str = "I've completed processing but have no response to give.";

/// [`ChatModel`] backed by any rig completion provider.
pub struct RigModel {
    #[allow(deprecated)]
    model: CompletionModelHandle<'static>,
    name: String,
    system_instruction: Option<String>,
    temperature: f64,
    max_tokens: u64,
}

impl RigModel {
    #[allow(deprecated)]
    pub fn new(model: CompletionModelHandle<'static>, name: impl Into<String>) -> Self {
        Self {
            model,
            name: name.into(),
            system_instruction: None,
            temperature: 1.0,
            max_tokens: 1024,
        }
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        let instruction = instruction.into();
        self.system_instruction = (!instruction.trim().is_empty()).then_some(instruction);
        self
    }

    pub fn with_sampling(mut self, temperature: f64, max_tokens: u64) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }
}

fn text_message_user(text: &str) -> Message {
    Message::User {
        content: OneOrMany::one(UserContent::Text(Text {
            text: text.to_string(),
        })),
    }
}

fn text_message_assistant(text: &str) -> Message {
    Message::Assistant {
        id: None,
        content: OneOrMany::one(AssistantContent::Text(Text {
            text: text.to_string(),
        })),
    }
}

/// Map stored turns onto provider messages, one message per turn.
fn to_messages(history: &[Turn]) -> Vec<Message> {
    // A result always directly follows its request, so the request's
    // provider call id is still at hand when the result is mapped.
    let mut pending_call_id = None;
    let mut messages = Vec::with_capacity(history.len());
    for turn in history {
        let message = match turn {
            Turn::UserMessage { text } => text_message_user(text),
            Turn::AgentMessage { text } => text_message_assistant(text),
            Turn::ToolCallRequest {
                id,
                call_id,
                name,
                arguments,
            } => {
                let mut content = AssistantContent::tool_call(
                    id.clone(),
                    name.clone(),
                    Value::Object(arguments.clone()),
                );
                if let AssistantContent::ToolCall(tc) = &mut content {
                    tc.call_id = call_id.clone();
                }
                pending_call_id = call_id.clone();
                Message::Assistant {
                    id: None,
                    content: OneOrMany::one(content),
                }
            }
            Turn::ToolCallResult { id, outcome, .. } => Message::User {
                content: OneOrMany::one(UserContent::ToolResult(ToolResult {
                    id: id.clone(),
                    call_id: pending_call_id.take(),
                    content: OneOrMany::one(ToolResultContent::Text(Text {
                        text: outcome.to_model_payload().to_string(),
                    })),
                })),
            },
        };
        messages.push(message);
    }
    messages
}

fn to_definitions(tools: &[ToolSchema]) -> Vec<ToolDefinition> {
    tools
        .iter()
        .map(|t| ToolDefinition {
            name: t.name.clone(),
            description: t.description.clone(),
            parameters: t.parameters.clone(),
        })
        .collect()
}

fn to_arguments(tool: &str, arguments: &Value) -> Result<Map<String, Value>, ModelError> {
    match arguments {
        Value::Object(map) => Ok(map.clone()),
        Value::Null => Ok(Map::new()),
        // Some providers send arguments as a JSON-encoded string.
        Value::String(raw) if raw.trim().is_empty() => Ok(Map::new()),
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Ok(map),
            _ => Err(ModelError::Rejected(format!(
                "arguments for '{tool}' are not a JSON object"
            ))),
        },
        _ => Err(ModelError::Rejected(format!(
            "arguments for '{tool}' are not a JSON object"
        ))),
    }
}

/// Collect a provider choice into text and tool calls.
fn to_reply(choice: &OneOrMany<AssistantContent>) -> Result<ModelReply, ModelError> {
    let mut text = String::new();
    let mut calls = Vec::new();
    for content in choice.iter() {
        match content {
            AssistantContent::Text(t) => text.push_str(&t.text),
            AssistantContent::ToolCall(tc) => {
                let id = if tc.id.is_empty() {
                    uuid::Uuid::new_v4().to_string()
                } else {
                    tc.id.clone()
                };
                calls.push(ToolInvocation {
                    id,
                    call_id: tc.call_id.clone(),
                    arguments: to_arguments(&tc.function.name, &tc.function.arguments)?,
                    name: tc.function.name.clone(),
                });
            }
            _ => {}
        }
    }

    if calls.is_empty() {
        if text.trim().is_empty() {
            debug!("LLM returned an empty reply");
            text = EMPTY_REPLY.to_string();
        }
        return Ok(ModelReply::Text(text));
    }
    Ok(ModelReply::ToolCalls {
        calls,
        commentary: (!text.trim().is_empty()).then_some(text),
    })
}

#[async_trait]
impl ChatModel for RigModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        history: &[Turn],
        tools: &[ToolSchema],
    ) -> Result<ModelResponse, ModelError> {
        let messages = to_messages(history);
        let message_count = messages.len();
        let chat_history = OneOrMany::many(messages)
            .map_err(|_| ModelError::Rejected("conversation history is empty".into()))?;

        debug!(
            "LLM request: {message_count} messages, {} tools, temp={}, max_tokens={}",
            tools.len(),
            self.temperature,
            self.max_tokens
        );

        let request = CompletionRequest {
            preamble: self.system_instruction.clone(),
            chat_history,
            documents: Vec::new(),
            tools: to_definitions(tools),
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            tool_choice: None,
            additional_params: None,
        };

        let response = self.model.completion(request).await.map_err(|e| match e {
            CompletionError::ProviderError(msg) => ModelError::Rejected(msg),
            other => ModelError::Transport(other.to_string()),
        })?;

        let usage = TokenUsage {
            input: response.usage.input_tokens,
            output: response.usage.output_tokens,
            total: response.usage.total_tokens,
        };
        Ok(ModelResponse {
            reply: to_reply(&response.choice)?,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::ToolOutcome;
    use serde_json::json;

    #[test]
    fn history_maps_one_message_per_turn() {
        let mut args = Map::new();
        args.insert("city".into(), json!("Berlin"));
        let history = vec![
            Turn::user("weather?"),
            Turn::ToolCallRequest {
                id: "c1".into(),
                call_id: None,
                name: "request_weather".into(),
                arguments: args,
            },
            Turn::ToolCallResult {
                id: "c1".into(),
                name: "request_weather".into(),
                outcome: ToolOutcome::Success(json!("Sunny")),
            },
            Turn::agent("It is sunny."),
        ];
        let messages = to_messages(&history);
        assert_eq!(messages.len(), 4);
        assert!(matches!(messages[0], Message::User { .. }));
        assert!(matches!(messages[1], Message::Assistant { .. }));
        assert!(matches!(messages[2], Message::User { .. }));
        assert!(matches!(messages[3], Message::Assistant { .. }));
    }

    #[test]
    fn provider_call_id_is_echoed_with_result() {
        let history = vec![
            Turn::user("time?"),
            Turn::ToolCallRequest {
                id: "fc_1".into(),
                call_id: Some("call_abc".into()),
                name: "get_time".into(),
                arguments: Map::new(),
            },
            Turn::ToolCallResult {
                id: "fc_1".into(),
                name: "get_time".into(),
                outcome: ToolOutcome::Success(json!("09:15")),
            },
        ];
        let messages = to_messages(&history);

        let Message::Assistant { content, .. } = &messages[1] else {
            panic!("expected assistant message");
        };
        match content.first() {
            AssistantContent::ToolCall(tc) => {
                assert_eq!(tc.id, "fc_1");
                assert_eq!(tc.call_id.as_deref(), Some("call_abc"));
            }
            other => panic!("expected tool call, got {other:?}"),
        }

        let Message::User { content } = &messages[2] else {
            panic!("expected user message");
        };
        match content.first() {
            UserContent::ToolResult(result) => {
                assert_eq!(result.id, "fc_1");
                assert_eq!(result.call_id.as_deref(), Some("call_abc"));
            }
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[test]
    fn empty_reply_gets_fallback_text() {
        let choice = OneOrMany::one(AssistantContent::Text(Text {
            text: "  ".into(),
        }));
        assert_eq!(
            to_reply(&choice).unwrap(),
            ModelReply::Text(EMPTY_REPLY.into())
        );
    }

    #[test]
    fn tool_calls_keep_provider_ids_and_commentary() {
        let mut call = AssistantContent::tool_call("", "get_time", json!("{}"));
        if let AssistantContent::ToolCall(tc) = &mut call {
            tc.call_id = Some("call_abc".into());
        }
        let choice = OneOrMany::many(vec![
            AssistantContent::Text(Text {
                text: "Let me check.".into(),
            }),
            call,
        ])
        .unwrap();

        match to_reply(&choice).unwrap() {
            ModelReply::ToolCalls { calls, commentary } => {
                assert_eq!(commentary.as_deref(), Some("Let me check."));
                assert!(!calls[0].id.is_empty());
                assert_eq!(calls[0].call_id.as_deref(), Some("call_abc"));
                assert!(calls[0].arguments.is_empty());
            }
            other => panic!("expected tool calls, got {other:?}"),
        }
    }

    #[test]
    fn argument_shapes() {
        assert!(to_arguments("t", &Value::Null).unwrap().is_empty());
        assert_eq!(
            to_arguments("t", &json!({"a": 1})).unwrap().get("a"),
            Some(&json!(1))
        );
        assert_eq!(
            to_arguments("t", &json!("{\"a\": 2}")).unwrap().get("a"),
            Some(&json!(2))
        );
        assert!(matches!(
            to_arguments("t", &json!([1, 2])),
            Err(ModelError::Rejected(_))
        ));
    }

    #[test]
    fn tool_definitions_carry_schema() {
        let defs = to_definitions(&[ToolSchema {
            name: "get_time".into(),
            description: "Get the current local time.".into(),
            parameters: json!({"type": "object", "properties": {}}),
        }]);
        assert_eq!(defs[0].name, "get_time");
        assert_eq!(defs[0].parameters["type"], "object");
    }
}
