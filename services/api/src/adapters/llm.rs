//! services/api/src/adapters/llm.rs
//!
//! This module contains the adapter for the study language model.
//! It implements the `LanguageModelService` port from the `core` crate using
//! the OpenAI Responses API.

use async_openai::{
    config::OpenAIConfig, error::OpenAIError, types::responses::CreateResponseArgs, Client,
};
use async_trait::async_trait;
use studius_core::ports::{LanguageModelService, PortError, PortResult};
use tracing::debug;

/// Upper bound on the reply length; large enough for a 3000-word summary.
const MAX_OUTPUT_TOKENS: u32 = 8000;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements `LanguageModelService` using an OpenAI-compatible LLM.
#[derive(Clone)]
pub struct OpenAiLanguageModelAdapter {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiLanguageModelAdapter {
    /// Creates a new `OpenAiLanguageModelAdapter`.
    pub fn new(client: Client<OpenAIConfig>, model: String) -> Self {
        Self { client, model }
    }
}

/// Network failures and rate limits are worth retrying; everything else is not.
pub(crate) fn map_openai_error(e: OpenAIError) -> PortError {
    match e {
        OpenAIError::Reqwest(err) => PortError::Unavailable(err.to_string()),
        OpenAIError::ApiError(api) => {
            let message = api.message.to_lowercase();
            if message.contains("rate limit") || message.contains("overloaded") {
                PortError::Unavailable(api.message)
            } else {
                PortError::Unexpected(api.message)
            }
        }
        other => PortError::Unexpected(other.to_string()),
    }
}

//=========================================================================================
// `LanguageModelService` Trait Implementation
//=========================================================================================

#[async_trait]
impl LanguageModelService for OpenAiLanguageModelAdapter {
    async fn complete(&self, instructions: &str, input: &str) -> PortResult<String> {
        let request = CreateResponseArgs::default()
            .model(&self.model)
            .instructions(instructions)
            .input(input)
            .max_output_tokens(MAX_OUTPUT_TOKENS)
            .build()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        let response = self
            .client
            .responses()
            .create(request)
            .await
            .map_err(map_openai_error)?;

        let text = response.output_text().unwrap_or_default();
        debug!("Model {} replied with {} chars", self.model, text.len());
        Ok(text)
    }
}
