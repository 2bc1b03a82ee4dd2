//! The fabric: one context object owning the bus, the agents and the task
//! lifecycle.
//!
//! A [`Fabric`] is built once per process (or per test) and passed by
//! reference. It spawns one runtime per [`AgentRole`], subscribes itself as
//! the `user` sink, and runs tasks one at a time. Each task is bounded by a
//! task-level ceiling; when it trips, the task's cancellation token is
//! cancelled so no agent keeps working on it, and the caller still receives
//! the partial transcript and metrics.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::cancel::CancelRegistry;
use super::coordinator::{CONTEXT_KEY, Coordinator, CoordinatorOptions, SPECIALISTS_KEY};
use super::routing::{KeywordRouter, RoutingPolicy};
use crate::agent::metrics::{AgentMetrics, AgentStatus};
use crate::agent::roles::{AgentRole, AnalystAgent, CriticAgent, SpecialistAgent};
use crate::agent::runtime::{AgentHandle, AgentRuntime, RuntimeDeps};
use crate::config::AppConfig;
use crate::error::{FabricError, TaskError};
use crate::llm::{ChatRequest, ChatTurn, LlmProvider};
use crate::llm::genai_provider::GenaiProvider;
use crate::llm::pricing::PricingTable;
use crate::memory::keyword::KeywordMemory;
use crate::memory::{MemoryEntry, TaskMemory, render_context};
use crate::message::bus::MessageBus;
use crate::message::envelope::{AgentId, MessageEnvelope, Performative, ids};
use crate::streaming::aggregator::{MetricsAggregator, PerformanceSummary};
use crate::streaming::bridge::{StreamEvent, StreamingBridge};
use crate::streaming::tap::EventTap;

/// What the caller gets back from a task, successful or not.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: String,
    pub task: String,
    pub final_answer: Option<String>,
    pub error: Option<TaskError>,
    /// Every envelope of the task's thread, in log order.
    pub messages: Vec<MessageEnvelope>,
    pub summary: PerformanceSummary,
}

impl TaskOutcome {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

pub struct FabricBuilder {
    config: AppConfig,
    provider: Option<Arc<dyn LlmProvider>>,
    router: Option<Arc<dyn RoutingPolicy>>,
    memory: Option<Arc<dyn TaskMemory>>,
}

impl FabricBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            provider: None,
            router: None,
            memory: None,
        }
    }

    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn router(mut self, router: Arc<dyn RoutingPolicy>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn memory(mut self, memory: Arc<dyn TaskMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Spawn every agent. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Fabric, FabricError> {
        let config = self.config;
        let router: Arc<dyn RoutingPolicy> = match self.router {
            Some(router) => router,
            None => Arc::new(KeywordRouter::new(
                &config.routing_rules,
                config.routing_fallback.clone(),
            )?),
        };
        for target in router.targets() {
            if !AgentRole::from_id(&target).is_some_and(|r| r.is_specialist()) {
                return Err(FabricError::UnknownSpecialist(target));
            }
        }
        let provider = self.provider.unwrap_or_else(|| {
            let pricing = PricingTable::default().with_overrides(&config.pricing);
            Arc::new(GenaiProvider::new(pricing))
        });
        let memory: Arc<dyn TaskMemory> = match (self.memory, &config.memory_file) {
            (Some(memory), _) => memory,
            (None, Some(path)) => Arc::new(KeywordMemory::open(path.clone(), config.memory_capacity)?),
            (None, None) => Arc::new(KeywordMemory::new(config.memory_capacity)),
        };

        let tap = EventTap::new();
        let bus = MessageBus::new(tap.clone());
        let shutdown = CancellationToken::new();
        let cancellations = CancelRegistry::new(shutdown.clone());
        let deps = RuntimeDeps {
            bus: bus.clone(),
            tap: tap.clone(),
            provider: provider.clone(),
            cancellations: cancellations.clone(),
            shutdown: shutdown.clone(),
        };

        let options = CoordinatorOptions {
            critique: config.critique,
            decompose: config.decompose,
        };
        let agents: Vec<AgentHandle> = AgentRole::ALL
            .into_iter()
            .map(|role| {
                let settings = config.agent_settings(role);
                let deps = deps.clone();
                match role {
                    AgentRole::Coordinator => AgentRuntime::spawn(
                        role.id(),
                        Coordinator::new(router.clone(), options),
                        settings,
                        deps,
                    ),
                    AgentRole::Specialist(domain) => {
                        AgentRuntime::spawn(role.id(), SpecialistAgent::new(domain), settings, deps)
                    }
                    AgentRole::Analyst => AgentRuntime::spawn(role.id(), AnalystAgent, settings, deps),
                    AgentRole::Critic => AgentRuntime::spawn(role.id(), CriticAgent, settings, deps),
                }
            })
            .collect();

        let waiting: Arc<Mutex<HashMap<String, oneshot::Sender<MessageEnvelope>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let results = waiting.clone();
        bus.subscribe(ids::USER, move |envelope| {
            if matches!(envelope.performative, Performative::Inform | Performative::Reject) {
                let waiter = envelope
                    .correlation_id
                    .as_deref()
                    .and_then(|task_id| results.lock().remove(task_id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(envelope);
                    }
                    None => tracing::debug!(id = %envelope.id, "reply for a finished task ignored"),
                }
            }
            Ok(())
        });

        tracing::info!(agents = agents.len(), "fabric ready");
        Ok(Fabric {
            config,
            bus,
            tap,
            agents,
            provider,
            cancellations,
            shutdown,
            memory,
            waiting,
            run_lock: tokio::sync::Mutex::new(()),
        })
    }
}

pub struct Fabric {
    config: AppConfig,
    bus: MessageBus,
    tap: EventTap,
    agents: Vec<AgentHandle>,
    provider: Arc<dyn LlmProvider>,
    cancellations: CancelRegistry,
    shutdown: CancellationToken,
    memory: Arc<dyn TaskMemory>,
    waiting: Arc<Mutex<HashMap<String, oneshot::Sender<MessageEnvelope>>>>,
    /// The event tap carries one task at a time.
    run_lock: tokio::sync::Mutex<()>,
}

impl Fabric {
    pub fn builder(config: AppConfig) -> FabricBuilder {
        FabricBuilder::new(config)
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<dyn TaskMemory> {
        &self.memory
    }

    pub fn agent(&self, id: &str) -> Option<&AgentHandle> {
        self.agents.iter().find(|a| a.id() == id)
    }

    pub fn metrics(&self) -> Vec<AgentMetrics> {
        self.agents.iter().map(AgentHandle::metrics).collect()
    }

    /// Run `task` without observing the stream.
    pub async fn run_task(&self, task: &str) -> TaskOutcome {
        let (observer, _) = mpsc::unbounded_channel();
        self.run_task_streaming(task, observer).await
    }

    /// Run `task`, forwarding stream events to `observer` as they happen.
    ///
    /// The observer receives exactly one terminal event: `answer` then
    /// `done`, or a single `error`.
    pub async fn run_task_streaming(
        &self,
        task: &str,
        observer: mpsc::UnboundedSender<StreamEvent>,
    ) -> TaskOutcome {
        let _running = self.run_lock.lock().await;
        for agent in &self.agents {
            agent.reset_metrics().await;
        }

        let aggregator = MetricsAggregator::start();
        let mut bridge = StreamingBridge::new(observer);
        let feed = self.tap.attach();

        let mut request = MessageEnvelope::new(Performative::Request, ids::USER, ids::COORDINATOR, task)
            .with_summary("Task submitted");
        if let Some(context) = self.recall(task).await {
            request = request.with_metadata(CONTEXT_KEY, json!(context));
        }
        let task_id = request.id.clone();
        tracing::info!(task_id = %task_id, "task started");

        let work = async {
            let result = self.drive(request).await;
            self.tap.detach();
            result
        };
        let (result, ()) = tokio::join!(work, bridge.pump(feed));

        let summary = aggregator.summarize(&self.metrics());
        let messages = self.bus.correlated(&task_id);

        let (final_answer, error, agents_used) = match result {
            Ok(answer) => {
                bridge.finish_success(&answer.content);
                let agents_used: Vec<AgentId> = answer
                    .metadata
                    .get(SPECIALISTS_KEY)
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                tracing::info!(task_id = %task_id, tokens = summary.tokens.total, "task completed");
                (Some(answer.content), None, agents_used)
            }
            Err(e) => {
                bridge.finish_error(&e.to_string());
                tracing::warn!(task_id = %task_id, error = %e, "task failed");
                (None, Some(e), Vec::new())
            }
        };

        let entry = MemoryEntry::new(
            task,
            final_answer.as_deref().unwrap_or(""),
            agents_used,
            error.is_none(),
        )
        .with_totals(summary.tokens.total, summary.total_cost, summary.elapsed_ms);
        if let Err(e) = self.memory.store(entry).await {
            tracing::warn!(task_id = %task_id, error = %e, "could not store task memory");
        }

        TaskOutcome {
            task_id,
            task: task.to_string(),
            final_answer,
            error,
            messages,
            summary,
        }
    }

    /// Answer `task` with one call to one model, for comparison with the
    /// multi-agent pipeline.
    ///
    /// Nothing goes over the bus and nothing is stored in task memory. The
    /// outcome carries the request and the reply as envelopes and a summary
    /// over a single `traditional` metrics entry.
    pub async fn run_traditional(&self, task: &str) -> TaskOutcome {
        let settings = self.config.traditional_settings();
        let aggregator = MetricsAggregator::start();
        let request = MessageEnvelope::new(Performative::Request, ids::USER, ids::TRADITIONAL, task)
            .with_summary("Task submitted");
        let task_id = request.id.clone();
        tracing::info!(task_id = %task_id, model = %settings.model, "baseline task started");

        let chat = ChatRequest {
            model: settings.model.clone(),
            messages: vec![ChatTurn::system(&settings.system_prompt), ChatTurn::user(task)],
            temperature: settings.temperature,
        };
        let start = Instant::now();
        let result = tokio::time::timeout(settings.llm_timeout, self.provider.complete(&chat)).await;

        let mut metrics = AgentMetrics::new(ids::TRADITIONAL);
        metrics.messages_received = 1;
        metrics.processing_time_ms = start.elapsed().as_millis() as u64;
        let reply = match result {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(TaskError::Llm(e)),
            Err(_) => Err(TaskError::Timeout {
                secs: settings.llm_timeout.as_secs(),
            }),
        };

        let mut messages = vec![request];
        let (final_answer, error) = match reply {
            Ok(reply) => {
                metrics.llm_calls = 1;
                metrics.tokens = reply.usage;
                metrics.cost = reply.cost;
                metrics.messages_sent = 1;
                metrics.status = AgentStatus::Done;
                let answer = messages[0]
                    .reply(ids::TRADITIONAL, Performative::Inform, reply.text.clone())
                    .with_summary("Baseline answer");
                messages.push(answer);
                tracing::info!(task_id = %task_id, tokens = metrics.tokens.total, "baseline task completed");
                (Some(reply.text), None)
            }
            Err(e) => {
                metrics.status = AgentStatus::Error;
                tracing::warn!(task_id = %task_id, error = %e, "baseline task failed");
                (None, Some(e))
            }
        };

        TaskOutcome {
            task_id,
            task: task.to_string(),
            final_answer,
            error,
            messages,
            summary: aggregator.summarize(std::slice::from_ref(&metrics)),
        }
    }

    /// Publish the request and wait for the final answer under the task ceiling.
    async fn drive(&self, request: MessageEnvelope) -> Result<MessageEnvelope, TaskError> {
        let task_id = request.id.clone();
        let token = self.cancellations.open(&task_id);
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert(task_id.clone(), tx);

        let ceiling = self.config.task_timeout();
        let result = match self.bus.publish(request) {
            Err(e) => Err(TaskError::Publish(e)),
            Ok(()) => tokio::select! {
                reply = tokio::time::timeout(ceiling, rx) => match reply {
                    Ok(Ok(envelope)) if envelope.performative == Performative::Inform => Ok(envelope),
                    Ok(Ok(envelope)) => Err(TaskError::Rejected(envelope.content)),
                    Ok(Err(_)) => Err(TaskError::Abandoned("result channel closed".into())),
                    Err(_) => Err(TaskError::Timeout { secs: ceiling.as_secs() }),
                },
                _ = token.cancelled() => Err(TaskError::Abandoned("fabric shut down".into())),
            },
        };

        match &result {
            Ok(_) => self.cancellations.close(&task_id),
            Err(_) => {
                self.waiting.lock().remove(&task_id);
                self.cancellations.cancel(&task_id);
                if let Some(coordinator) = self.agent(ids::COORDINATOR) {
                    coordinator.abort_task(&task_id).await;
                }
            }
        }
        result
    }

    async fn recall(&self, task: &str) -> Option<String> {
        if self.config.similar_tasks == 0 {
            return None;
        }
        match self
            .memory
            .query_by_similarity(task, self.config.similar_tasks)
            .await
        {
            Ok(entries) => {
                if !entries.is_empty() {
                    tracing::info!(found = entries.len(), "similar past tasks");
                }
                render_context(&entries)
            }
            Err(e) => {
                tracing::warn!(error = %e, "task memory unavailable");
                None
            }
        }
    }

    /// Stop every agent and wait for their loops to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for agent in self.agents {
            agent.join().await;
        }
        tracing::info!("fabric stopped");
    }
}
