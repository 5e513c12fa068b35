use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub agent: AgentConfig,
    pub sessions: SessionsConfig,
    pub retry: RetryConfig,
    pub providers: ProvidersConfig,
}

impl Config {
    /// Check value ranges that serde alone cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=2.0).contains(&self.agent.temperature) {
            anyhow::bail!(
                "agent.temperature must be between 0.0 and 2.0 (got {})",
                self.agent.temperature
            );
        }
        if self.agent.max_tool_iterations == 0 {
            anyhow::bail!("agent.maxToolIterations must be at least 1");
        }
        if self.agent.max_output_tokens == 0 {
            anyhow::bail!("agent.maxOutputTokens must be at least 1");
        }
        if self.sessions.idle_timeout_secs == 0 {
            anyhow::bail!("sessions.idleTimeoutSecs must be at least 1");
        }
        if self.sessions.sweep_interval_secs == 0 {
            anyhow::bail!("sessions.sweepIntervalSecs must be at least 1");
        }
        if self.retry.call_timeout_secs == 0 {
            anyhow::bail!("retry.callTimeoutSecs must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    /// One of: gemini, openai, anthropic, ollama.
    pub provider: String,
    pub model: String,
    pub system_instruction: String,
    pub temperature: f64,
    pub max_output_tokens: u64,
    /// Maximum model <> tool round trips per prompt.
    pub max_tool_iterations: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".into(),
            model: "gemini-flash-latest".into(),
            system_instruction: "Someone forgot to add a system instruction... \
                                 Tell the user to open config.json and add one."
                .into(),
            temperature: 1.0,
            max_output_tokens: 1024,
            max_tool_iterations: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionsConfig {
    /// Sessions untouched for longer than this are discarded.
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Tokens a session may use before prompts are refused. 0 means unlimited.
    pub max_tokens_per_session: u64,
    /// SQLite database holding session history. `~` is expanded.
    pub database: String,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300,
            sweep_interval_secs: 60,
            max_tokens_per_session: 0,
            database: "~/.parley/sessions.sqlite".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Extra attempts after the first failed model call.
    pub max_retries: u32,
    /// Delay before the first retry; doubled for each further attempt.
    pub initial_backoff_ms: u64,
    pub call_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 500,
            call_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvidersConfig {
    pub gemini: Option<ProviderConfig>,
    pub openai: Option<ProviderConfig>,
    pub anthropic: Option<ProviderConfig>,
    pub ollama: Option<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub api_base: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let cfg: Config = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(cfg.agent.provider, "gemini");
        assert_eq!(cfg.agent.max_tool_iterations, 5);
        assert_eq!(cfg.sessions.idle_timeout_secs, 300);
        assert_eq!(cfg.sessions.max_tokens_per_session, 0);
        assert_eq!(cfg.retry.max_retries, 2);
        assert!(cfg.providers.gemini.is_none());
        cfg.validate().unwrap();
    }

    #[test]
    fn camel_case_fields_parsed() {
        let cfg: Config = serde_json::from_value(serde_json::json!({
            "agent": {
                "model": "gemini-2.5-pro",
                "systemInstruction": "You are a helpful assistant.",
                "maxToolIterations": 8
            },
            "sessions": { "idleTimeoutSecs": 30, "maxTokensPerSession": 50000 },
            "providers": { "gemini": { "apiKey": "secret" } }
        }))
        .unwrap();
        assert_eq!(cfg.agent.model, "gemini-2.5-pro");
        assert_eq!(cfg.agent.system_instruction, "You are a helpful assistant.");
        assert_eq!(cfg.agent.max_tool_iterations, 8);
        // untouched fields in a partially specified section keep their defaults
        assert_eq!(cfg.agent.temperature, 1.0);
        assert_eq!(cfg.sessions.idle_timeout_secs, 30);
        assert_eq!(cfg.sessions.sweep_interval_secs, 60);
        assert_eq!(cfg.sessions.max_tokens_per_session, 50_000);
        assert_eq!(
            cfg.providers.gemini.unwrap().api_key.as_deref(),
            Some("secret")
        );
    }

    #[test]
    fn temperature_out_of_range_rejected() {
        let mut cfg = Config::default();
        cfg.agent.temperature = 2.5;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("temperature"));
    }

    #[test]
    fn zero_loop_budget_rejected() {
        let mut cfg = Config::default();
        cfg.agent.max_tool_iterations = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_idle_timeout_rejected() {
        let mut cfg = Config::default();
        cfg.sessions.idle_timeout_secs = 0;
        assert!(cfg.validate().is_err());
    }
}
