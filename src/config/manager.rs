use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default model to use
pub const DEFAULT_MODEL: &str = "gpt-4";

/// Default provider
pub const DEFAULT_PROVIDER: &str = "openai";

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful personal assistant. Answer concisely and use the available tools when they help.";

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Request timeout used when a provider does not set one, in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Provider configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    /// Request timeout in seconds
    pub timeout: Option<u64>,
}

/// Assistant identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AssistantConfig {
    pub name: String,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            name: "Aide".to_string(),
        }
    }
}

/// Model and conversation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AiConfig {
    pub provider: String,
    pub model: String,
    pub system_prompt: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    /// Number of user/assistant exchanges kept in the outgoing context
    pub context_window_size: usize,
    pub stream_response: bool,
    /// Answer published when a turn fails
    pub apology: String,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: DEFAULT_PROVIDER.to_string(),
            model: DEFAULT_MODEL.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            temperature: 0.7,
            top_p: 1.0,
            max_tokens: 2048,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            context_window_size: 10,
            stream_response: true,
            apology: crate::domain::orchestrator::DEFAULT_APOLOGY.to_string(),
        }
    }
}

/// What `publish` does when the async queue is full
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued event so publishers never block
    #[default]
    DropOldest,
    /// Wait for room in the queue
    Block,
}

/// Event bus settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventBusConfig {
    pub async_dispatch: bool,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub shutdown_timeout_ms: u64,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            async_dispatch: true,
            queue_capacity: 1024,
            overflow: OverflowPolicy::DropOldest,
            shutdown_timeout_ms: 2000,
        }
    }
}

/// Built-in tool settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolsConfig {
    /// Refuse a second tool with an existing name instead of replacing it
    pub reject_duplicates: bool,
    /// Register the reminder tool
    pub reminders: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            reject_duplicates: false,
            reminders: true,
        }
    }
}

/// Resolve environment variable placeholders like {env:VAR_NAME}
pub fn resolve_env_var(value: &str) -> String {
    match value.strip_prefix("{env:").and_then(|rest| rest.strip_suffix('}')) {
        Some(var_name) => std::env::var(var_name).unwrap_or_else(|_| value.to_string()),
        None => value.to_string(),
    }
}

/// Resolved connection settings for one provider
#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub assistant: Option<AssistantConfig>,

    pub ai: Option<AiConfig>,

    /// Provider configurations
    #[serde(default)]
    pub provider: HashMap<String, ProviderConfig>,

    pub event_bus: Option<EventBusConfig>,

    pub tools: Option<ToolsConfig>,
}

impl Config {
    pub fn assistant(&self) -> AssistantConfig {
        self.assistant.clone().unwrap_or_default()
    }

    pub fn ai(&self) -> AiConfig {
        self.ai.clone().unwrap_or_default()
    }

    pub fn event_bus(&self) -> EventBusConfig {
        self.event_bus.clone().unwrap_or_default()
    }

    pub fn tools(&self) -> ToolsConfig {
        self.tools.clone().unwrap_or_default()
    }

    /// Logs settings that are accepted but out of their usual range.
    pub fn validate(&self) {
        let ai = self.ai();
        if !(0.0..=2.0).contains(&ai.temperature) {
            warn!(temperature = ai.temperature, "Temperature outside 0..=2");
        }
        if !(0.0..=1.0).contains(&ai.top_p) {
            warn!(top_p = ai.top_p, "top_p outside 0..=1");
        }
        if ai.max_tokens == 0 {
            warn!("max_tokens is 0");
        }
        if self.event_bus().queue_capacity == 0 {
            warn!("event_bus.queue_capacity is 0, using 1");
        }
    }

    /// Credentials for `provider`, from the process environment first and
    /// then from the `provider` section.
    pub fn credentials(&self, provider: &str) -> Result<Credentials, ConfigError> {
        self.credentials_with(provider, |name| std::env::var(name).ok())
    }

    pub fn credentials_with<F>(&self, provider: &str, env: F) -> Result<Credentials, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let section = self.provider.get(provider).cloned().unwrap_or_default();
        let prefix = provider.to_uppercase().replace('-', "_");

        let api_key = env(&format!("{}_API_KEY", prefix))
            .filter(|k| !k.is_empty())
            .or_else(|| section.api_key.as_deref().map(resolve_env_var))
            .filter(|k| !k.is_empty() && !k.starts_with("{env:"))
            .ok_or_else(|| ConfigError::MissingCredentials(provider.to_string()))?;

        let endpoint_var = match provider {
            "openai" => "OPENAI_BASE_URL".to_string(),
            "azure_openai" => "AZURE_OPENAI_ENDPOINT".to_string(),
            _ => format!("{}_API_ENDPOINT", prefix),
        };
        let base_url = env(&endpoint_var)
            .filter(|u| !u.is_empty())
            .or_else(|| section.base_url.as_deref().map(resolve_env_var))
            .or_else(|| (provider == "openai").then(|| DEFAULT_OPENAI_BASE_URL.to_string()))
            .ok_or_else(|| ConfigError::MissingEndpoint(provider.to_string()))?;

        Ok(Credentials {
            api_key,
            base_url,
            timeout: Duration::from_secs(section.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS)),
        })
    }
}

/// Configuration manager that handles loading and merging configs
pub struct ConfigManager {
    global_config: Option<Config>,
    local_config: Option<Config>,
    merged_config: Config,
}

impl ConfigManager {
    /// Create a new ConfigManager
    pub fn new() -> Self {
        Self {
            global_config: None,
            local_config: None,
            merged_config: Config::default(),
        }
    }

    /// Load configuration from both global and local sources
    pub fn load(&mut self, workspace_path: Option<&Path>) -> Result<(), ConfigError> {
        self.global_config = match Self::global_config_path() {
            Some(path) => Self::read_if_exists(&path)?,
            None => None,
        };

        self.local_config = match workspace_path {
            Some(path) => Self::read_if_exists(&Self::local_config_path(path))?,
            None => None,
        };

        self.merged_config = self.merge_configs();
        Ok(())
    }

    /// Load a single explicit file; global and local files are ignored
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let config = Self::read_if_exists(path)?.ok_or(ConfigError::NotFound)?;
        self.global_config = None;
        self.local_config = Some(config);
        self.merged_config = self.merge_configs();
        Ok(())
    }

    /// Get the merged configuration
    pub fn config(&self) -> &Config {
        &self.merged_config
    }

    /// Get global config path (~/.config/aide/aide.json)
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("aide").join("aide.json"))
    }

    /// Get local config path (.aide/aide.json)
    pub fn local_config_path(workspace: &Path) -> PathBuf {
        workspace.join(".aide").join("aide.json")
    }

    fn read_if_exists(path: &Path) -> Result<Option<Config>, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file");
            return Ok(None);
        }
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.kind()))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        info!(path = %path.display(), "Loaded config");
        Ok(Some(config))
    }

    /// Merge global and local configs (local takes precedence)
    fn merge_configs(&self) -> Config {
        let mut merged = self.global_config.clone().unwrap_or_default();

        if let Some(ref local) = self.local_config {
            if local.assistant.is_some() {
                merged.assistant = local.assistant.clone();
            }
            if local.ai.is_some() {
                merged.ai = local.ai.clone();
            }

            // Providers merge per key
            for (key, value) in &local.provider {
                merged.provider.insert(key.clone(), value.clone());
            }

            if local.event_bus.is_some() {
                merged.event_bus = local.event_bus.clone();
            }
            if local.tools.is_some() {
                merged.tools = local.tools.clone();
            }
        }

        merged
    }

    /// Save config to a file
    pub fn save_config(config: &Config, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.kind()))?;
        }

        let json = serde_json::to_string_pretty(config)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        fs::write(path, json).map_err(|e| ConfigError::IoError(e.kind()))?;

        Ok(())
    }

    /// A config with every section filled in with defaults
    pub fn create_default_config() -> Config {
        let mut provider = HashMap::new();
        provider.insert(
            DEFAULT_PROVIDER.to_string(),
            ProviderConfig {
                api_key: Some("{env:OPENAI_API_KEY}".to_string()),
                base_url: None,
                timeout: None,
            },
        );

        Config {
            assistant: Some(AssistantConfig::default()),
            ai: Some(AiConfig::default()),
            provider,
            event_bus: Some(EventBusConfig::default()),
            tools: Some(ToolsConfig::default()),
        }
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    IoError(std::io::ErrorKind),
    ParseError(String),
    NotFound,
    MissingCredentials(String),
    MissingEndpoint(String),
    UnsupportedProvider(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(kind) => write!(f, "IO error: {:?}", kind),
            ConfigError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            ConfigError::NotFound => write!(f, "Config file not found"),
            ConfigError::MissingCredentials(p) => write!(f, "No API key for provider '{}'", p),
            ConfigError::MissingEndpoint(p) => write!(f, "No endpoint for provider '{}'", p),
            ConfigError::UnsupportedProvider(p) => write!(f, "Unsupported provider '{}'", p),
        }
    }
}

impl std::error::Error for ConfigError {}
