//! Deterministic [`LlmProvider`] for tests and offline runs.
//!
//! Replies are chosen by model name, so giving each agent role its own model
//! in the config lets a test script every role independently. Token usage is
//! the whitespace word count of the prompt and the reply.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::pricing::ModelPrice;
use super::{ChatRequest, LlmError, LlmProvider, LlmReply};
use crate::agent::metrics::TokenUsage;

type Responder = Arc<dyn Fn(&ChatRequest) -> Result<String, LlmError> + Send + Sync>;

#[derive(Clone)]
struct Script {
    responder: Responder,
    delay: Option<Duration>,
}

impl Script {
    fn echo() -> Self {
        Self {
            responder: Arc::new(|req: &ChatRequest| Ok(req.last_user_content().to_string())),
            delay: None,
        }
    }
}

pub struct ScriptedProvider {
    scripts: HashMap<String, Script>,
    fallback: Script,
    price: ModelPrice,
    calls: Mutex<Vec<ChatRequest>>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::echo()
    }
}

impl ScriptedProvider {
    /// A provider that answers every model by echoing the last user turn.
    pub fn echo() -> Self {
        Self {
            scripts: HashMap::new(),
            fallback: Script::echo(),
            price: ModelPrice::new(1.0, 2.0),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answer `model` with `responder`.
    pub fn on_model<F>(mut self, model: impl Into<String>, responder: F) -> Self
    where
        F: Fn(&ChatRequest) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        let entry = self.scripts.entry(model.into()).or_insert_with(Script::echo);
        entry.responder = Arc::new(responder);
        self
    }

    /// Answer `model` with a fixed text.
    pub fn reply(self, model: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        self.on_model(model, move |_| Ok(text.clone()))
    }

    /// Fail every call to `model` with `error`.
    pub fn fail(self, model: impl Into<String>, error: LlmError) -> Self {
        self.on_model(model, move |_| Err(error.clone()))
    }

    /// Sleep for `delay` before answering `model`.
    pub fn delay(mut self, model: impl Into<String>, delay: Duration) -> Self {
        self.scripts
            .entry(model.into())
            .or_insert_with(Script::echo)
            .delay = Some(delay);
        self
    }

    pub fn with_price(mut self, price: ModelPrice) -> Self {
        self.price = price;
        self
    }

    /// Every request received so far, in arrival order.
    pub fn calls(&self) -> Vec<ChatRequest> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, model: &str) -> usize {
        self.calls.lock().iter().filter(|r| r.model == model).count()
    }
}

fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(&self, request: &ChatRequest) -> Result<LlmReply, LlmError> {
        self.calls.lock().push(request.clone());
        let script = self
            .scripts
            .get(&request.model)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone());

        let start = Instant::now();
        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }
        let text = (script.responder)(request)?;

        let prompt_words: u64 = request.messages.iter().map(|t| word_count(&t.content)).sum();
        let usage = TokenUsage::new(prompt_words, word_count(&text));
        Ok(LlmReply {
            cost: self.price.cost(&usage),
            text,
            usage,
            latency: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatTurn;

    fn request(model: &str, prompt: &str) -> ChatRequest {
        ChatRequest {
            model: model.to_string(),
            messages: vec![ChatTurn::system("be brief"), ChatTurn::user(prompt)],
            temperature: None,
        }
    }

    #[tokio::test]
    async fn echoes_by_default_and_counts_words() {
        let provider = ScriptedProvider::echo();
        let reply = provider.complete(&request("any", "three little words")).await.unwrap();
        assert_eq!(reply.text, "three little words");
        assert_eq!(reply.usage, TokenUsage::new(5, 3));
        assert!(reply.cost > 0.0);
    }

    #[tokio::test]
    async fn scripts_are_keyed_by_model() {
        let provider = ScriptedProvider::echo()
            .reply("math", "42")
            .fail("broken", LlmError::RateLimited("slow down".into()));

        assert_eq!(provider.complete(&request("math", "q")).await.unwrap().text, "42");
        assert_eq!(
            provider.complete(&request("broken", "q")).await.unwrap_err(),
            LlmError::RateLimited("slow down".into())
        );
        assert_eq!(provider.calls_for("math"), 1);
        assert_eq!(provider.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_keeps_existing_responder() {
        let provider = ScriptedProvider::echo()
            .reply("slow", "eventually")
            .delay("slow", Duration::from_secs(5));
        let started = tokio::time::Instant::now();
        let reply = provider.complete(&request("slow", "q")).await.unwrap();
        assert_eq!(reply.text, "eventually");
        assert!(started.elapsed() >= Duration::from_secs(5));
    }
}
