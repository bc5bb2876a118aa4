pub mod openai;
pub mod tools;

use crate::config::{Config, ConfigError};
use crate::domain::ports::Backend;
use crate::error::Result;
use openai::OpenAIAdapter;
use std::sync::Arc;
use tracing::info;

/// Picks the backend once from `ai.provider` and `ai.stream_response`.
pub fn build_backend(config: &Config) -> Result<Backend> {
    let ai = config.ai();
    match ai.provider.as_str() {
        "openai" | "azure_openai" => {
            let creds = config.credentials(&ai.provider)?;
            let adapter = Arc::new(OpenAIAdapter::new(creds.api_key, creds.base_url.clone(), creds.timeout)?);
            info!(provider = %ai.provider, base_url = %creds.base_url, streaming = ai.stream_response, "Backend selected");
            Ok(if ai.stream_response {
                Backend::Streaming(adapter)
            } else {
                Backend::Complete(adapter)
            })
        }
        other => Err(ConfigError::UnsupportedProvider(other.to_string()).into()),
    }
}
