//! The completion-service boundary.
//!
//! The orchestrator only sees [`CompletionService`]: system instructions and
//! a user payload in, text out, with failures already classified into
//! [`ServiceError`]. [`ProviderService`] adapts any `edgequake_llm`
//! provider; tests plug in scripted services instead.

use crate::config::{ProviderProfile, TokenParam};
use crate::error::ServiceError;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// One request: system instructions plus the user payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
}

/// The service's answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionResponse {
    pub text: String,
    /// Provider-reported usage, when available.
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

impl CompletionResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// A text-in/text-out completion backend.
///
/// Implementations are shared by every worker, so they must be `Send + Sync`.
/// They should not retry internally; the orchestrator owns retry, backoff
/// and timeouts.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ServiceError>;
}

/// [`CompletionService`] over an `edgequake_llm` provider.
///
/// Request parameters follow the declared [`ProviderProfile`]: the
/// completion cap and temperature are sent only when the profile says the
/// model accepts them.
pub struct ProviderService {
    provider: Arc<dyn LLMProvider>,
    profile: ProviderProfile,
    max_tokens: usize,
    temperature: f32,
}

impl fmt::Debug for ProviderService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderService")
            .field("provider", &"<dyn LLMProvider>")
            .field("profile", &self.profile)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl ProviderService {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        profile: ProviderProfile,
        max_tokens: usize,
        temperature: f32,
    ) -> Self {
        Self {
            provider,
            profile,
            max_tokens,
            temperature,
        }
    }

    pub fn profile(&self) -> ProviderProfile {
        self.profile
    }

    /// Build `CompletionOptions` from the profile.
    fn options(&self) -> CompletionOptions {
        build_options(self.profile, self.max_tokens, self.temperature)
    }
}

fn build_options(profile: ProviderProfile, max_tokens: usize, temperature: f32) -> CompletionOptions {
    CompletionOptions {
        temperature: profile.supports_temperature.then_some(temperature),
        max_tokens: match profile.token_param {
            TokenParam::MaxTokens | TokenParam::MaxCompletionTokens => Some(max_tokens),
            TokenParam::Omit => None,
        },
        ..Default::default()
    }
}

#[async_trait]
impl CompletionService for ProviderService {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ServiceError> {
        let messages = vec![
            ChatMessage::system(&request.system),
            ChatMessage::user(&request.user),
        ];
        let options = self.options();
        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| ServiceError::classify(&e.to_string()))?;
        debug!(
            "Completion ({}): {} input tokens, {} output tokens",
            self.profile.profile_id, response.prompt_tokens, response.completion_tokens
        );
        Ok(CompletionResponse {
            text: response.content,
            prompt_tokens: response.prompt_tokens as usize,
            completion_tokens: response.completion_tokens as usize,
        })
    }
}
