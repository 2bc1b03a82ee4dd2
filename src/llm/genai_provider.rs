//! [`LlmProvider`] backed by the `genai` multi-provider client.
//!
//! The provider is chosen by `genai` from the model name (e.g. `gpt-4o-mini`
//! goes to OpenAI, unprefixed unknown names go to Ollama). Credentials come
//! from the provider's usual environment variables.

use tokio::time::Instant;

use async_trait::async_trait;
use genai::Client;
use genai::chat::{ChatMessage, ChatOptions};

use super::pricing::PricingTable;
use super::{ChatRequest, ChatRole, LlmError, LlmProvider, LlmReply};
use crate::agent::metrics::TokenUsage;

pub struct GenaiProvider {
    client: Client,
    pricing: PricingTable,
}

impl GenaiProvider {
    pub fn new(pricing: PricingTable) -> Self {
        Self {
            client: Client::default(),
            pricing,
        }
    }
}

impl Default for GenaiProvider {
    fn default() -> Self {
        Self::new(PricingTable::default())
    }
}

#[async_trait]
impl LlmProvider for GenaiProvider {
    async fn complete(&self, request: &ChatRequest) -> Result<LlmReply, LlmError> {
        let messages: Vec<ChatMessage> = request
            .messages
            .iter()
            .map(|turn| match turn.role {
                ChatRole::System => ChatMessage::system(&turn.content),
                ChatRole::User => ChatMessage::user(&turn.content),
                ChatRole::Assistant => ChatMessage::assistant(&turn.content),
            })
            .collect();
        let chat_req = genai::chat::ChatRequest::new(messages);

        let mut options = ChatOptions::default();
        if let Some(temperature) = request.temperature {
            options = options.with_temperature(temperature);
        }

        let start = Instant::now();
        let response = self
            .client
            .exec_chat(&request.model, chat_req, Some(&options))
            .await
            .map_err(|e| classify_error(&e.to_string()))?;
        let latency = start.elapsed();

        let usage = TokenUsage::new(
            response.usage.prompt_tokens.unwrap_or(0).max(0) as u64,
            response.usage.completion_tokens.unwrap_or(0).max(0) as u64,
        );
        let text = response.first_text().unwrap_or_default().to_string();
        let cost = self.pricing.cost(&request.model, &usage);

        tracing::debug!(
            model = %request.model,
            prompt_tokens = usage.prompt,
            completion_tokens = usage.completion,
            cost,
            latency_ms = latency.as_millis() as u64,
            "LLM call completed"
        );

        Ok(LlmReply {
            text,
            usage,
            cost,
            latency,
        })
    }
}

/// Map a provider error message onto the contract's error kinds.
fn classify_error(message: &str) -> LlmError {
    let lower = message.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("rate_limit") {
        LlmError::RateLimited(message.to_string())
    } else if lower.contains("timed out") || lower.contains("timeout") {
        LlmError::Timeout(message.to_string())
    } else {
        LlmError::ProviderError(message.to_string())
    }
}
