//! Agent runtime: one mailbox, one receive loop, one strategy.
//!
//! Every agent is a tokio task that owns its [`AgentStrategy`] and its
//! metrics. The bus hands envelopes to the agent through a bounded mailbox
//! (a full mailbox rejects instead of blocking the publisher). The loop
//! processes one envelope at a time, so a strategy's state is never touched
//! concurrently.
//!
//! Failures stay local. An error or a panic inside `process` is turned into
//! a REJECT addressed to the envelope's sender, and the loop keeps going.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::metrics::{AgentMetrics, AgentStatus};
use crate::error::{AgentError, BusError, DeliveryError};
use crate::llm::{ChatRequest, ChatTurn, LlmProvider};
use crate::message::bus::MessageBus;
use crate::message::envelope::{AgentId, MessageEnvelope, Performative, truncate_chars};
use crate::orchestration::cancel::CancelRegistry;
use crate::streaming::tap::{EventTap, FabricEvent};

/// Model settings for one agent.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub model: String,
    pub system_prompt: String,
    pub temperature: Option<f64>,
    /// Ceiling for a single LLM call.
    pub llm_timeout: Duration,
    pub mailbox_capacity: usize,
}

impl AgentSettings {
    pub fn new(model: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: system_prompt.into(),
            temperature: Some(0.7),
            llm_timeout: Duration::from_secs(30),
            mailbox_capacity: 64,
        }
    }
}

/// What an agent does with the envelopes it receives.
#[async_trait]
pub trait AgentStrategy: Send {
    /// Handle one envelope. A returned envelope is published by the runtime.
    async fn process(
        &mut self,
        envelope: MessageEnvelope,
        ctx: &mut AgentContext,
    ) -> Result<Option<MessageEnvelope>, AgentError>;

    /// The fabric gave up on `task_id`; drop any state kept for it.
    async fn task_aborted(&mut self, _task_id: &str, _ctx: &mut AgentContext) {}
}

/// Everything a strategy may touch while processing: the bus, the LLM, and
/// its own metrics.
pub struct AgentContext {
    id: AgentId,
    bus: MessageBus,
    tap: EventTap,
    provider: Arc<dyn LlmProvider>,
    settings: AgentSettings,
    metrics: watch::Sender<AgentMetrics>,
}

impl AgentContext {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn metrics(&self) -> AgentMetrics {
        self.metrics.borrow().clone()
    }

    /// Publish an envelope on behalf of this agent.
    pub fn send(&mut self, envelope: MessageEnvelope) -> Result<(), BusError> {
        self.update_metrics(|m| m.messages_sent += 1);
        self.bus.publish(envelope)
    }

    /// Call the LLM with this agent's own system prompt.
    pub async fn call_llm(&mut self, prompt: &str) -> String {
        let system = self.settings.system_prompt.clone();
        self.call_llm_with(&system, prompt).await
    }

    /// Call the LLM with an explicit system prompt.
    ///
    /// Never fails: provider errors and the per-call ceiling come back as
    /// text starting with `ERROR:` so downstream agents can still reason
    /// about them.
    pub async fn call_llm_with(&mut self, system: &str, prompt: &str) -> String {
        let request = ChatRequest {
            model: self.settings.model.clone(),
            messages: vec![ChatTurn::system(system), ChatTurn::user(prompt)],
            temperature: self.settings.temperature,
        };
        let ceiling = self.settings.llm_timeout;

        self.update_metrics(|m| m.status = AgentStatus::Thinking);
        let start = Instant::now();
        let result = tokio::time::timeout(ceiling, self.provider.complete(&request)).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(reply)) => {
                tracing::debug!(
                    agent = %self.id,
                    tokens = reply.usage.total,
                    cost = reply.cost,
                    "LLM reply"
                );
                self.update_metrics(|m| {
                    m.llm_calls += 1;
                    m.tokens.add(&reply.usage);
                    m.cost += reply.cost;
                    m.processing_time_ms += elapsed_ms;
                    m.status = AgentStatus::Done;
                });
                reply.text
            }
            Ok(Err(e)) => {
                tracing::warn!(agent = %self.id, error = %e, "LLM call failed");
                self.update_metrics(|m| {
                    m.processing_time_ms += elapsed_ms;
                    m.status = AgentStatus::Error;
                });
                format!("ERROR: {e}")
            }
            Err(_) => {
                let secs = ceiling.as_secs();
                tracing::warn!(agent = %self.id, secs, "LLM call timed out");
                self.update_metrics(|m| {
                    m.processing_time_ms += elapsed_ms;
                    m.status = AgentStatus::Error;
                });
                format!("ERROR: LLM call timed out after {secs} seconds")
            }
        }
    }

    fn update_metrics(&self, f: impl FnOnce(&mut AgentMetrics)) {
        self.metrics.send_modify(f);
        self.tap.emit(FabricEvent::Metric(self.metrics()));
    }

    fn reset_metrics(&self) {
        let fresh = AgentMetrics::new(self.id.clone());
        self.update_metrics(|m| *m = fresh);
    }
}

/// Shared services every runtime is wired to.
#[derive(Clone)]
pub struct RuntimeDeps {
    pub bus: MessageBus,
    pub tap: EventTap,
    pub provider: Arc<dyn LlmProvider>,
    pub cancellations: CancelRegistry,
    pub shutdown: CancellationToken,
}

enum Mail {
    Deliver(MessageEnvelope),
    ResetMetrics,
    TaskAborted(String),
}

/// The fabric's side of a running agent.
pub struct AgentHandle {
    id: AgentId,
    mail: mpsc::Sender<Mail>,
    metrics: watch::Receiver<AgentMetrics>,
    join: JoinHandle<()>,
}

impl AgentHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Latest metrics snapshot.
    pub fn metrics(&self) -> AgentMetrics {
        self.metrics.borrow().clone()
    }

    /// Zero the counters. Queued behind any envelopes already in the mailbox.
    pub async fn reset_metrics(&self) {
        if self.mail.send(Mail::ResetMetrics).await.is_err() {
            tracing::debug!(agent = %self.id, "reset on stopped agent");
        }
    }

    /// Tell the strategy the task was abandoned.
    pub async fn abort_task(&self, task_id: &str) {
        if self
            .mail
            .send(Mail::TaskAborted(task_id.to_string()))
            .await
            .is_err()
        {
            tracing::debug!(agent = %self.id, task_id, "abort on stopped agent");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the receive loop to exit.
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            tracing::error!(agent = %self.id, error = %e, "agent task failed");
        }
    }
}

pub struct AgentRuntime<S> {
    strategy: S,
    ctx: AgentContext,
    mailbox: mpsc::Receiver<Mail>,
    cancellations: CancelRegistry,
    shutdown: CancellationToken,
}

impl<S: AgentStrategy + 'static> AgentRuntime<S> {
    /// Subscribe `id` on the bus and start its receive loop.
    pub fn spawn(
        id: impl Into<AgentId>,
        strategy: S,
        settings: AgentSettings,
        deps: RuntimeDeps,
    ) -> AgentHandle {
        let id = id.into();
        let (mail_tx, mailbox) = mpsc::channel(settings.mailbox_capacity.max(1));
        let (metrics_tx, metrics_rx) = watch::channel(AgentMetrics::new(id.clone()));

        let deliver = mail_tx.clone();
        deps.bus.subscribe(id.clone(), move |envelope| {
            deliver
                .try_send(Mail::Deliver(envelope))
                .map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => DeliveryError::MailboxFull,
                    mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
                })
        });

        let runtime = AgentRuntime {
            strategy,
            ctx: AgentContext {
                id: id.clone(),
                bus: deps.bus,
                tap: deps.tap,
                provider: deps.provider,
                settings,
                metrics: metrics_tx,
            },
            mailbox,
            cancellations: deps.cancellations,
            shutdown: deps.shutdown,
        };
        let join = tokio::spawn(runtime.run());

        AgentHandle {
            id,
            mail: mail_tx,
            metrics: metrics_rx,
            join,
        }
    }

    async fn run(mut self) {
        tracing::info!(agent = %self.ctx.id, "agent started");
        loop {
            let mail = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                mail = self.mailbox.recv() => match mail {
                    Some(mail) => mail,
                    None => break,
                },
            };
            match mail {
                Mail::Deliver(envelope) => self.handle(envelope).await,
                Mail::ResetMetrics => self.ctx.reset_metrics(),
                Mail::TaskAborted(task_id) => {
                    self.strategy.task_aborted(&task_id, &mut self.ctx).await;
                }
            }
        }
        self.ctx.bus.unsubscribe(&self.ctx.id);
        tracing::info!(agent = %self.ctx.id, "agent stopped");
    }

    async fn handle(&mut self, envelope: MessageEnvelope) {
        self.ctx.update_metrics(|m| m.messages_received += 1);

        let task_token = self.cancellations.token_for(envelope.thread_root());
        if task_token.as_ref().is_some_and(|t| t.is_cancelled()) {
            tracing::debug!(agent = %self.ctx.id, id = %envelope.id, "task cancelled, skipping");
            return;
        }

        let origin = Origin::of(&envelope);
        let work = AssertUnwindSafe(self.strategy.process(envelope, &mut self.ctx)).catch_unwind();
        let outcome = match task_token {
            Some(token) => tokio::select! {
                result = work => Some(result),
                _ = token.cancelled() => None,
            },
            None => Some(work.await),
        };

        match outcome {
            None => {
                tracing::info!(agent = %self.ctx.id, task_id = %origin.thread_root, "work cancelled");
                self.ctx.update_metrics(|m| m.status = AgentStatus::Idle);
            }
            Some(Ok(Ok(Some(reply)))) => {
                if let Err(e) = self.ctx.send(reply) {
                    tracing::warn!(agent = %self.ctx.id, error = %e, "reply not delivered");
                }
            }
            Some(Ok(Ok(None))) => {}
            Some(Ok(Err(e))) => self.reject(&origin, e),
            Some(Err(panic)) => self.reject(&origin, AgentError::Panicked(panic_message(&*panic))),
        }
    }

    fn reject(&mut self, origin: &Origin, error: AgentError) {
        tracing::error!(agent = %self.ctx.id, id = %origin.id, error = %error, "processing failed");
        self.ctx.update_metrics(|m| m.status = AgentStatus::Error);

        let detail = error.to_string();
        let reject = MessageEnvelope::new(
            Performative::Reject,
            self.ctx.id.clone(),
            origin.sender.clone(),
            format!("ERROR: {detail}"),
        )
        .with_correlation(origin.thread_root.clone())
        .with_summary(format!("Processing failed: {}", truncate_chars(&detail, 50)));

        if let Err(e) = self.ctx.send(reject) {
            tracing::warn!(agent = %self.ctx.id, error = %e, "reject not delivered");
        }
    }
}

/// What the runtime needs to remember about an envelope after handing it
/// to the strategy.
struct Origin {
    id: String,
    sender: AgentId,
    thread_root: String,
}

impl Origin {
    fn of(envelope: &MessageEnvelope) -> Self {
        Self {
            id: envelope.id.clone(),
            sender: envelope.sender.clone(),
            thread_root: envelope.thread_root().to_string(),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::llm::scripted::ScriptedProvider;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Replies INFORM with the LLM's answer; fails on "boom", panics on "panic".
    struct Echo;

    #[async_trait]
    impl AgentStrategy for Echo {
        async fn process(
            &mut self,
            envelope: MessageEnvelope,
            ctx: &mut AgentContext,
        ) -> Result<Option<MessageEnvelope>, AgentError> {
            match envelope.content.as_str() {
                "boom" => Err(AgentError::Processing("bad input".into())),
                "panic" => panic!("strategy exploded"),
                _ => {
                    let answer = ctx.call_llm(&envelope.content).await;
                    Ok(Some(envelope.reply(ctx.id().to_string(), Performative::Inform, answer)))
                }
            }
        }
    }

    struct Harness {
        bus: MessageBus,
        tap: EventTap,
        cancellations: CancelRegistry,
        shutdown: CancellationToken,
        inbox: UnboundedReceiver<MessageEnvelope>,
    }

    fn harness() -> Harness {
        let tap = EventTap::new();
        let bus = MessageBus::new(tap.clone());
        let (tx, inbox) = mpsc::unbounded_channel();
        bus.subscribe("caller", move |env| {
            let _ = tx.send(env);
            Ok(())
        });
        let shutdown = CancellationToken::new();
        Harness {
            bus,
            tap,
            cancellations: CancelRegistry::new(shutdown.clone()),
            shutdown,
            inbox,
        }
    }

    fn spawn_echo(h: &Harness, provider: ScriptedProvider, settings: AgentSettings) -> AgentHandle {
        AgentRuntime::spawn(
            "worker",
            Echo,
            settings,
            RuntimeDeps {
                bus: h.bus.clone(),
                tap: h.tap.clone(),
                provider: Arc::new(provider),
                cancellations: h.cancellations.clone(),
                shutdown: h.shutdown.clone(),
            },
        )
    }

    fn ask(content: &str) -> MessageEnvelope {
        MessageEnvelope::new(Performative::Request, "caller", "worker", content)
    }

    #[tokio::test]
    async fn error_becomes_reject_and_loop_continues() {
        let mut h = harness();
        let _agent = spawn_echo(&h, ScriptedProvider::echo(), AgentSettings::new("m", "sys"));

        let bad = ask("boom");
        h.bus.publish(bad.clone()).unwrap();
        h.bus.publish(ask("hello")).unwrap();

        let reject = h.inbox.recv().await.unwrap();
        assert_eq!(reject.performative, Performative::Reject);
        assert!(reject.content.starts_with("ERROR:"));
        assert!(reject.summary.starts_with("Processing failed:"));
        assert_eq!(reject.correlation_id.as_deref(), Some(bad.id.as_str()));

        let inform = h.inbox.recv().await.unwrap();
        assert_eq!(inform.performative, Performative::Inform);
        assert_eq!(inform.content, "hello");
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let mut h = harness();
        let agent = spawn_echo(&h, ScriptedProvider::echo(), AgentSettings::new("m", "sys"));

        h.bus.publish(ask("panic")).unwrap();
        h.bus.publish(ask("still alive")).unwrap();

        let reject = h.inbox.recv().await.unwrap();
        assert_eq!(reject.performative, Performative::Reject);
        assert!(reject.content.contains("strategy exploded"));
        assert_eq!(h.inbox.recv().await.unwrap().content, "still alive");
        assert!(!agent.is_finished());
    }

    #[tokio::test]
    async fn successful_call_updates_metrics() {
        let mut h = harness();
        let mut events = h.tap.attach();
        let agent = spawn_echo(
            &h,
            ScriptedProvider::echo().reply("m", "two words"),
            AgentSettings::new("m", "sys"),
        );

        h.bus.publish(ask("what now")).unwrap();
        h.inbox.recv().await.unwrap();

        let metrics = agent.metrics();
        assert_eq!(metrics.llm_calls, 1);
        assert_eq!(metrics.messages_received, 1);
        assert_eq!(metrics.messages_sent, 1);
        assert_eq!(metrics.tokens.completion, 2);
        assert_eq!(metrics.status, AgentStatus::Done);

        let mut statuses = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let FabricEvent::Metric(m) = event {
                statuses.push(m.status);
            }
        }
        let thinking = statuses.iter().position(|s| *s == AgentStatus::Thinking).unwrap();
        let done = statuses.iter().position(|s| *s == AgentStatus::Done).unwrap();
        assert!(thinking < done);
    }

    #[tokio::test]
    async fn provider_error_becomes_text() {
        let mut h = harness();
        let agent = spawn_echo(
            &h,
            ScriptedProvider::echo().fail("m", LlmError::ProviderError("bad key".into())),
            AgentSettings::new("m", "sys"),
        );

        h.bus.publish(ask("q")).unwrap();
        let reply = h.inbox.recv().await.unwrap();
        assert_eq!(reply.performative, Performative::Inform);
        assert!(reply.content.starts_with("ERROR:"));
        assert_eq!(agent.metrics().status, AgentStatus::Error);
        assert_eq!(agent.metrics().llm_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_hits_ceiling() {
        let mut h = harness();
        let mut settings = AgentSettings::new("slow", "sys");
        settings.llm_timeout = Duration::from_secs(30);
        let _agent = spawn_echo(
            &h,
            ScriptedProvider::echo().delay("slow", Duration::from_secs(60)),
            settings,
        );

        h.bus.publish(ask("q")).unwrap();
        let reply = h.inbox.recv().await.unwrap();
        assert_eq!(reply.content, "ERROR: LLM call timed out after 30 seconds");
    }

    #[tokio::test(start_paused = true)]
    async fn processing_time_follows_the_runtime_clock() {
        let mut h = harness();
        let agent = spawn_echo(
            &h,
            ScriptedProvider::echo().delay("m", Duration::from_secs(5)),
            AgentSettings::new("m", "sys"),
        );

        h.bus.publish(ask("q")).unwrap();
        h.inbox.recv().await.unwrap();

        let spent = agent.metrics().processing_time_ms;
        assert!((5_000..5_100).contains(&spent), "processing_time_ms = {spent}");
    }

    #[tokio::test(start_paused = true)]
    async fn full_mailbox_rejects_delivery() {
        let h = harness();
        let mut settings = AgentSettings::new("slow", "sys");
        settings.mailbox_capacity = 1;
        settings.llm_timeout = Duration::from_secs(120);
        let _agent = spawn_echo(
            &h,
            ScriptedProvider::echo().delay("slow", Duration::from_secs(60)),
            settings,
        );

        h.bus.publish(ask("first")).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        h.bus.publish(ask("second")).unwrap();
        let err = h.bus.publish(ask("third")).unwrap_err();
        assert_eq!(
            err,
            BusError::Delivery {
                receiver: "worker".into(),
                source: DeliveryError::MailboxFull
            }
        );
        assert_eq!(h.bus.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_task_stops_work() {
        let mut h = harness();
        let mut settings = AgentSettings::new("slow", "sys");
        settings.llm_timeout = Duration::from_secs(120);
        let agent = spawn_echo(
            &h,
            ScriptedProvider::echo().delay("slow", Duration::from_secs(60)),
            settings,
        );

        let root = MessageEnvelope::new(Performative::Request, "user", "fabric", "task");
        h.bus.publish(root.clone()).unwrap();
        h.cancellations.open(&root.id);
        h.bus.publish(ask("long").with_correlation(root.id.clone())).unwrap();

        tokio::time::sleep(Duration::from_millis(1)).await;
        h.cancellations.cancel(&root.id);
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert!(h.inbox.try_recv().is_err());
        assert_eq!(agent.metrics().status, AgentStatus::Idle);

        // Later work on other threads is unaffected.
        h.bus.publish(ask("next")).unwrap();
        assert_eq!(h.inbox.recv().await.unwrap().content, "next");
    }

    #[tokio::test]
    async fn reset_and_shutdown() {
        let mut h = harness();
        let agent = spawn_echo(&h, ScriptedProvider::echo(), AgentSettings::new("m", "sys"));
        h.bus.publish(ask("q")).unwrap();
        h.inbox.recv().await.unwrap();

        let mut events = h.tap.attach();
        agent.reset_metrics().await;
        // A round-trip through the mailbox guarantees the reset was applied.
        h.bus.publish(ask("q2")).unwrap();
        h.inbox.recv().await.unwrap();
        assert_eq!(agent.metrics().llm_calls, 1);

        // The reset itself is announced before the next envelope is counted.
        let first_metric = std::iter::from_fn(|| events.try_recv().ok())
            .find_map(|event| match event {
                FabricEvent::Metric(m) => Some(m),
                FabricEvent::Message(_) => None,
            })
            .unwrap();
        assert_eq!(first_metric, AgentMetrics::new("worker"));

        h.shutdown.cancel();
        agent.join().await;
        assert!(!h.bus.is_subscribed("worker"));
    }
}
