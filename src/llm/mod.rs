//! LLM integration.
//!
//! The classifier talks to an OpenAI-compatible chat completions endpoint
//! through rig-core. `RigAdapter` bridges rig's client to our `LlmProvider`
//! trait so the pipeline can be driven by a stub in tests.

pub mod provider;
mod rig_adapter;

pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::sync::Arc;

use rig::providers::openai;
use secrecy::ExposeSecret;

use crate::config::LlmSettings;
use crate::error::LlmError;

/// Create an LLM provider from configuration.
pub fn create_provider(settings: &LlmSettings) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let client = openai::CompletionsClient::builder()
        .api_key(settings.api_key.expose_secret())
        .base_url(&settings.base_url)
        .build()
        .map_err(|e| LlmError::RequestFailed {
            provider: "openai".to_string(),
            reason: format!("Failed to create OpenAI client: {e}"),
        })?;

    tracing::info!(model = %settings.model, base_url = %settings.base_url, "Using OpenAI-compatible classifier");
    Ok(Arc::new(RigAdapter::new(client, &settings.model)))
}
