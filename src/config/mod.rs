pub mod manager;

pub use manager::{
    resolve_env_var, AiConfig, AssistantConfig, Config, ConfigError, ConfigManager, Credentials,
    EventBusConfig, OverflowPolicy, ProviderConfig, ToolsConfig,
};
