pub mod loader;
pub mod schema;

pub use loader::{find_config_path, load_config, resolve_api_key, resolve_path, save_config};
pub use schema::{
    AgentConfig, Config, ProviderConfig, ProvidersConfig, RetryConfig, SessionsConfig,
};
