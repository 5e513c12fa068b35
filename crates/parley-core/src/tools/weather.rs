use anyhow::{Context, Result};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use super::{parameters_schema_for, Tool};

#[derive(Debug, Deserialize, JsonSchema)]
struct WeatherArgs {
    /// The name of the city you want to get the weather from.
    city: String,
}

/// Example tool showing how typed arguments and generated schemas fit together.
///
/// Always reports fair weather; swap `execute` for a real API call.
pub struct RequestWeatherTool;

#[async_trait]
impl Tool for RequestWeatherTool {
    fn name(&self) -> &str {
        "request_weather"
    }

    fn description(&self) -> &str {
        "Get the current weather for a city."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema_for::<WeatherArgs>()
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let args: WeatherArgs =
            serde_json::from_value(params).context("invalid request_weather arguments")?;
        if args.city.trim().is_empty() {
            anyhow::bail!("city must not be empty");
        }
        Ok(Value::String(format!("Sunny, 20°C in {}", args.city.trim())))
    }
}
