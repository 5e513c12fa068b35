//! Storage form of a conversation history.
//!
//! The stored form is a versioned JSON envelope:
//!
//! ```json
//! {"version":1,"turns":[
//!   {"kind":"user","text":"what time is it?"},
//!   {"kind":"tool_call","id":"c1","name":"get_time","arguments":{}},
//!   {"kind":"tool_result","id":"c1","name":"get_time","result":"12:00"},
//!   {"kind":"agent","text":"It is 12:00."}
//! ]}
//! ```
//!
//! Decoding is strict: unknown kinds, unknown fields, an unsupported version, a
//! tool result with both or neither of `result`/`error`, and requests not
//! immediately followed by their result are all rejected.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::{ToolOutcome, Turn};

pub const FORMAT_VERSION: u32 = 1;

/// Deepest value nesting accepted inside a turn.
///
/// serde_json refuses to parse documents nested deeper than 128 levels and the
/// envelope itself uses three, so anything deeper than this would be written
/// fine and then fail to load.
pub const MAX_VALUE_DEPTH: usize = 100;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("turn {index} (tool '{tool}') cannot be stored: {reason}")]
    Unencodable {
        index: usize,
        tool: String,
        reason: String,
    },

    #[error("malformed history: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported history version {0}")]
    UnsupportedVersion(u64),

    #[error("turn {index}: {reason}")]
    InvalidTurn { index: usize, reason: String },
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Envelope {
    version: u32,
    turns: Vec<StoredTurn>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
enum StoredTurn {
    User {
        text: String,
    },
    ToolCall {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        name: String,
        arguments: Map<String, Value>,
    },
    ToolResult {
        id: String,
        name: String,
        #[serde(
            default,
            deserialize_with = "present",
            skip_serializing_if = "Option::is_none"
        )]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Agent {
        text: String,
    },
}

/// Distinguishes `"result": null` (a tool that returned null) from an absent field.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Encode a history into its storage form.
pub fn encode(turns: &[Turn]) -> Result<String, CodecError> {
    check_pairing(turns)?;

    let mut stored = Vec::with_capacity(turns.len());
    for (index, turn) in turns.iter().enumerate() {
        stored.push(to_stored(index, turn)?);
    }

    let envelope = Envelope {
        version: FORMAT_VERSION,
        turns: stored,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Decode a storage form back into turns.
pub fn decode(raw: &str) -> Result<Vec<Turn>, CodecError> {
    // Peek at the version first so a future format fails with a clear error
    // instead of an unknown-field complaint.
    let probe: Value = serde_json::from_str(raw)?;
    if let Some(version) = probe.get("version").and_then(Value::as_u64) {
        if version != u64::from(FORMAT_VERSION) {
            return Err(CodecError::UnsupportedVersion(version));
        }
    }

    let envelope: Envelope = serde_json::from_value(probe)?;
    let mut turns = Vec::with_capacity(envelope.turns.len());
    for (index, stored) in envelope.turns.into_iter().enumerate() {
        turns.push(from_stored(index, stored)?);
    }

    check_pairing(&turns)?;
    Ok(turns)
}

fn to_stored(index: usize, turn: &Turn) -> Result<StoredTurn, CodecError> {
    let stored = match turn {
        Turn::UserMessage { text } => StoredTurn::User { text: text.clone() },
        Turn::AgentMessage { text } => StoredTurn::Agent { text: text.clone() },
        Turn::ToolCallRequest {
            id,
            call_id,
            name,
            arguments,
        } => {
            for value in arguments.values() {
                check_depth(index, name, value, 1)?;
            }
            StoredTurn::ToolCall {
                id: id.clone(),
                call_id: call_id.clone(),
                name: name.clone(),
                arguments: arguments.clone(),
            }
        }
        Turn::ToolCallResult { id, name, outcome } => match outcome {
            ToolOutcome::Success(value) => {
                check_depth(index, name, value, 0)?;
                StoredTurn::ToolResult {
                    id: id.clone(),
                    name: name.clone(),
                    result: Some(value.clone()),
                    error: None,
                }
            }
            ToolOutcome::Failure(error) => StoredTurn::ToolResult {
                id: id.clone(),
                name: name.clone(),
                result: None,
                error: Some(error.clone()),
            },
        },
    };
    Ok(stored)
}

fn from_stored(index: usize, stored: StoredTurn) -> Result<Turn, CodecError> {
    let turn = match stored {
        StoredTurn::User { text } => Turn::UserMessage { text },
        StoredTurn::Agent { text } => Turn::AgentMessage { text },
        StoredTurn::ToolCall {
            id,
            call_id,
            name,
            arguments,
        } => Turn::ToolCallRequest {
            id,
            call_id,
            name,
            arguments,
        },
        StoredTurn::ToolResult {
            id,
            name,
            result,
            error,
        } => {
            let outcome = match (result, error) {
                (Some(value), None) => ToolOutcome::Success(value),
                (None, Some(error)) => ToolOutcome::Failure(error),
                (Some(_), Some(_)) => {
                    return Err(CodecError::InvalidTurn {
                        index,
                        reason: "tool result carries both a result and an error".into(),
                    })
                }
                (None, None) => {
                    return Err(CodecError::InvalidTurn {
                        index,
                        reason: "tool result carries neither a result nor an error".into(),
                    })
                }
            };
            Turn::ToolCallResult { id, name, outcome }
        }
    };
    Ok(turn)
}

fn check_depth(index: usize, tool: &str, value: &Value, base: usize) -> Result<(), CodecError> {
    let depth = base + nesting_depth(value);
    if depth > MAX_VALUE_DEPTH {
        return Err(CodecError::Unencodable {
            index,
            tool: tool.to_string(),
            reason: format!("value nests {depth} levels deep (limit {MAX_VALUE_DEPTH})"),
        });
    }
    Ok(())
}

fn nesting_depth(value: &Value) -> usize {
    // Iterative so a hostile value cannot overflow the stack here either.
    let mut deepest = 0;
    let mut stack = vec![(value, 0usize)];
    while let Some((v, depth)) = stack.pop() {
        match v {
            Value::Array(items) => {
                deepest = deepest.max(depth + 1);
                stack.extend(items.iter().map(|i| (i, depth + 1)));
            }
            Value::Object(map) => {
                deepest = deepest.max(depth + 1);
                stack.extend(map.values().map(|i| (i, depth + 1)));
            }
            _ => {}
        }
    }
    deepest
}

/// Every request must be immediately followed by the result with the same id and name.
fn check_pairing(turns: &[Turn]) -> Result<(), CodecError> {
    let mut open: Option<(&str, &str)> = None;
    for (index, turn) in turns.iter().enumerate() {
        match (open.take(), turn) {
            (None, Turn::ToolCallRequest { id, name, .. }) => {
                open = Some((id.as_str(), name.as_str()))
            }
            (None, Turn::ToolCallResult { .. }) => {
                return Err(CodecError::InvalidTurn {
                    index,
                    reason: "tool result without a preceding request".into(),
                })
            }
            (None, _) => {}
            (Some((id, name)), Turn::ToolCallResult { id: rid, name: rname, .. })
                if id == rid && name == rname => {}
            (Some((id, _)), _) => {
                return Err(CodecError::InvalidTurn {
                    index,
                    reason: format!("tool call '{id}' is not immediately followed by its result"),
                })
            }
        }
    }
    if let Some((id, _)) = open {
        return Err(CodecError::InvalidTurn {
            index: turns.len().saturating_sub(1),
            reason: format!("tool call '{id}' has no result"),
        });
    }
    Ok(())
}
