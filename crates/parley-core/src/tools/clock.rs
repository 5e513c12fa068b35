use anyhow::Result;
use async_trait::async_trait;
use chrono::Local;
use serde_json::Value;

use super::{empty_object_schema, Tool};

/// Reports the current local wall-clock time.
pub struct GetTimeTool {
    format: String,
}

impl GetTimeTool {
    pub fn new() -> Self {
        Self {
            format: "%H:%M".into(),
        }
    }

    /// Use a custom chrono format string instead of `HH:MM`.
    pub fn with_format(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
        }
    }
}

impl Default for GetTimeTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for GetTimeTool {
    fn name(&self) -> &str {
        "get_time"
    }

    fn description(&self) -> &str {
        "Get the current local time."
    }

    fn parameters_schema(&self) -> Value {
        empty_object_schema()
    }

    async fn execute(&self, _params: Value) -> Result<Value> {
        Ok(Value::String(Local::now().format(&self.format).to_string()))
    }
}
