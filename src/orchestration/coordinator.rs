//! The coordinator: delegate, collect, synthesize, critique, answer.
//!
//! The coordinator is an ordinary [`AgentStrategy`], so its [`PendingTable`]
//! is only ever touched from its own runtime's receive loop. Concurrent
//! specialist replies are serialized by the mailbox; no lock is needed.
//!
//! Per task the state moves through
//! `planning -> delegating -> collecting -> synthesizing -> done`, or to
//! `failed` when the fabric abandons the task. Synthesis is delegated to the
//! analyst and the single critique pass to the super-critic, both over the
//! bus. A `REVISE` verdict never loops back into another synthesis.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::pending::{CollectOutcome, Phase, PendingTable, PendingTask};
use super::routing::RoutingPolicy;
use crate::agent::prompts;
use crate::agent::roles::PLAN_KEY;
use crate::agent::runtime::{AgentContext, AgentStrategy};
use crate::error::AgentError;
use crate::message::envelope::{MessageEnvelope, Performative, ids};

/// Metadata key the fabric uses to pass remembered context with a task.
pub const CONTEXT_KEY: &str = "context";
/// Metadata key on the final answer listing the specialists that worked on it.
pub const SPECIALISTS_KEY: &str = "specialists";
/// Metadata key on the final answer recording the critique outcome.
pub const CRITIQUE_KEY: &str = "critique";

const REVISION_NOTE: &str = "[Note: the critic flagged this answer for revision]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Planning,
    Delegating,
    Collecting,
    Synthesizing,
    Done,
    Failed,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CoordinatorState::Planning => "planning",
            CoordinatorState::Delegating => "delegating",
            CoordinatorState::Collecting => "collecting",
            CoordinatorState::Synthesizing => "synthesizing",
            CoordinatorState::Done => "done",
            CoordinatorState::Failed => "failed",
        };
        f.write_str(s)
    }
}

fn enter(task_id: &str, state: CoordinatorState) {
    tracing::info!(task_id, state = %state, "coordinator state");
}

/// The critic's judgement of a synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CritiqueVerdict {
    Approved(String),
    Revise(String),
    /// The critic failed; the synthesis goes out unreviewed.
    Unavailable,
}

impl CritiqueVerdict {
    /// `APPROVED:<text>` approves `<text>`. `REVISE:` near the start asks for
    /// a revision. Anything else is an implicit approval of the whole text.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if text.starts_with("ERROR:") || text.is_empty() {
            return CritiqueVerdict::Unavailable;
        }
        // ASCII upper-casing keeps byte offsets valid for slicing `text`.
        let upper = text.to_ascii_uppercase();
        if upper.starts_with("APPROVED:") {
            return CritiqueVerdict::Approved(text["APPROVED:".len()..].trim().to_string());
        }
        let head_end = text.char_indices().nth(50).map_or(text.len(), |(i, _)| i);
        if let Some(pos) = upper[..head_end].find("REVISE:") {
            return CritiqueVerdict::Revise(text[pos + "REVISE:".len()..].trim().to_string());
        }
        CritiqueVerdict::Approved(text.to_string())
    }

    fn label(&self) -> &'static str {
        match self {
            CritiqueVerdict::Approved(_) => "approved",
            CritiqueVerdict::Revise(_) => "revise",
            CritiqueVerdict::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorOptions {
    /// Run one critique pass over the synthesis.
    pub critique: bool,
    /// Ask the LLM for a plan before delegating.
    pub decompose: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            critique: true,
            decompose: false,
        }
    }
}

pub struct Coordinator {
    router: Arc<dyn RoutingPolicy>,
    options: CoordinatorOptions,
    pending: PendingTable,
}

impl Coordinator {
    pub fn new(router: Arc<dyn RoutingPolicy>, options: CoordinatorOptions) -> Self {
        Self {
            router,
            options,
            pending: PendingTable::new(),
        }
    }

    async fn on_request(
        &mut self,
        envelope: MessageEnvelope,
        ctx: &mut AgentContext,
    ) -> Result<(), AgentError> {
        let task_id = envelope.id.clone();
        enter(&task_id, CoordinatorState::Planning);

        let mut specialists = self.router.route(&envelope.content);
        let mut seen = HashSet::new();
        specialists.retain(|id| seen.insert(id.clone()));
        if specialists.is_empty() {
            return Err(AgentError::Routing(envelope.label()));
        }
        tracing::info!(task_id = %task_id, specialists = ?specialists, "routed");

        let plan = if self.options.decompose {
            let system = ctx.settings().system_prompt.clone();
            let outline = ctx
                .call_llm_with(&system, &prompts::decomposition(&envelope.content, &specialists))
                .await;
            (!outline.starts_with("ERROR:")).then_some(outline)
        } else {
            None
        };

        enter(&task_id, CoordinatorState::Delegating);
        self.pending.insert(PendingTask::new(
            task_id.clone(),
            envelope.content.clone(),
            envelope.sender.clone(),
            specialists.clone(),
        ));

        let work = match envelope.metadata.get(CONTEXT_KEY).and_then(|v| v.as_str()) {
            Some(context) => format!("{}\n\n{context}", envelope.content),
            None => envelope.content.clone(),
        };

        let mut failed = Vec::new();
        for specialist in &specialists {
            let mut delegation =
                MessageEnvelope::new(Performative::Request, ctx.id().to_string(), specialist.clone(), work.clone())
                    .with_correlation(task_id.clone())
                    .with_summary(format!("Delegating to {specialist}"));
            if let Some(plan) = &plan {
                delegation = delegation.with_metadata(PLAN_KEY, json!(plan));
            }
            if let Err(e) = ctx.send(delegation) {
                tracing::warn!(task_id = %task_id, specialist = %specialist, error = %e, "delegation failed");
                failed.push((specialist.clone(), format!("ERROR: delegation failed: {e}")));
            }
        }

        enter(&task_id, CoordinatorState::Collecting);
        // A failed delegation counts as a degraded answer so the barrier can still release.
        for (specialist, text) in failed {
            self.collect(&task_id, &specialist, text, ctx);
        }
        Ok(())
    }

    fn on_reply(&mut self, envelope: MessageEnvelope, ctx: &mut AgentContext) {
        let Some(task_id) = envelope.correlation_id.clone() else {
            tracing::warn!(id = %envelope.id, sender = %envelope.sender, "reply without correlation id, dropped");
            return;
        };
        let Some(task) = self.pending.get(&task_id) else {
            tracing::warn!(task_id = %task_id, sender = %envelope.sender, "no pending task for reply, dropped");
            return;
        };

        let text = match envelope.performative {
            Performative::Reject if !envelope.content.starts_with("ERROR:") => {
                format!("ERROR: {}", envelope.content)
            }
            _ => envelope.content,
        };

        let phase = task.phase.clone();
        match (phase, envelope.sender.as_str()) {
            (Phase::Collecting, sender) => self.collect(&task_id, sender, text, ctx),
            (Phase::Synthesizing, ids::ANALYST) => self.on_synthesis(&task_id, text, ctx),
            (Phase::Critiquing { synthesis }, ids::SUPER_CRITIC) => {
                self.finalize(&task_id, synthesis, CritiqueVerdict::parse(&text), ctx);
            }
            (phase, sender) => {
                tracing::debug!(task_id = %task_id, sender, phase = ?phase, "stale reply, dropped");
            }
        }
    }

    fn collect(&mut self, task_id: &str, sender: &str, text: String, ctx: &mut AgentContext) {
        match self.pending.record(task_id, sender, text) {
            CollectOutcome::Complete => self.start_synthesis(task_id, ctx),
            CollectOutcome::Waiting { received, expected } => {
                tracing::debug!(task_id, sender, received, expected, "collected");
            }
            outcome => {
                tracing::warn!(task_id, sender, outcome = ?outcome, "response not collected");
            }
        }
    }

    fn start_synthesis(&mut self, task_id: &str, ctx: &mut AgentContext) {
        enter(task_id, CoordinatorState::Synthesizing);
        let Some(task) = self.pending.get(task_id) else {
            return;
        };
        let prompt = prompts::synthesis(&task.original_request, task.ordered_responses());
        let request = MessageEnvelope::new(Performative::Request, ctx.id().to_string(), ids::ANALYST, prompt)
            .with_correlation(task_id.to_string())
            .with_summary("Requesting synthesis");

        if let Err(e) = ctx.send(request) {
            tracing::warn!(task_id, error = %e, "synthesis request failed, using raw responses");
            let fallback = fallback_synthesis(task);
            self.on_synthesis(task_id, fallback, ctx);
        }
    }

    fn on_synthesis(&mut self, task_id: &str, synthesis: String, ctx: &mut AgentContext) {
        let Some(task) = self.pending.get_mut(task_id) else {
            return;
        };
        let synthesis = if synthesis.starts_with("ERROR:") {
            tracing::warn!(task_id, "synthesis failed, using raw responses");
            fallback_synthesis(task)
        } else {
            synthesis
        };

        if !self.options.critique {
            self.finalize(task_id, synthesis, CritiqueVerdict::Unavailable, ctx);
            return;
        }

        task.phase = Phase::Critiquing {
            synthesis: synthesis.clone(),
        };
        let evaluate = MessageEnvelope::new(
            Performative::Evaluate,
            ctx.id().to_string(),
            ids::SUPER_CRITIC,
            prompts::critique(&synthesis),
        )
        .with_correlation(task_id.to_string())
        .with_summary("Requesting critique");

        if let Err(e) = ctx.send(evaluate) {
            tracing::warn!(task_id, error = %e, "critique request failed, answering unreviewed");
            self.finalize(task_id, synthesis, CritiqueVerdict::Unavailable, ctx);
        }
    }

    /// Publish the one final INFORM and drop the pending entry.
    fn finalize(
        &mut self,
        task_id: &str,
        synthesis: String,
        verdict: CritiqueVerdict,
        ctx: &mut AgentContext,
    ) {
        let Some(task) = self.pending.remove(task_id) else {
            return;
        };
        let critique = if self.options.critique { verdict.label() } else { "skipped" };
        let answer = match verdict {
            CritiqueVerdict::Approved(text) if !text.is_empty() => text,
            CritiqueVerdict::Approved(_) | CritiqueVerdict::Unavailable => synthesis,
            CritiqueVerdict::Revise(reason) => {
                format!("{REVISION_NOTE}\n{reason}\n\n{synthesis}")
            }
        };

        let final_inform = MessageEnvelope::new(
            Performative::Inform,
            ctx.id().to_string(),
            task.requester.clone(),
            answer,
        )
        .with_correlation(task_id.to_string())
        .with_summary("Final answer")
        .with_metadata(SPECIALISTS_KEY, json!(task.expected()))
        .with_metadata(CRITIQUE_KEY, json!(critique));

        enter(task_id, CoordinatorState::Done);
        if let Err(e) = ctx.send(final_inform) {
            tracing::warn!(task_id, requester = %task.requester, error = %e, "final answer not delivered");
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Labeled specialist sections, used when the analyst cannot synthesize.
fn fallback_synthesis(task: &PendingTask) -> String {
    task.ordered_responses()
        .map(|(agent, text)| format!("[{agent}]:\n{text}"))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[async_trait]
impl AgentStrategy for Coordinator {
    async fn process(
        &mut self,
        envelope: MessageEnvelope,
        ctx: &mut AgentContext,
    ) -> Result<Option<MessageEnvelope>, AgentError> {
        match envelope.performative {
            Performative::Request => self.on_request(envelope, ctx).await?,
            Performative::Inform | Performative::Reject => self.on_reply(envelope, ctx),
            other => {
                tracing::debug!(performative = %other, sender = %envelope.sender, "coordinator ignored");
            }
        }
        Ok(None)
    }

    async fn task_aborted(&mut self, task_id: &str, _ctx: &mut AgentContext) {
        if let Some(task) = self.pending.remove(task_id) {
            let received = task.ordered_responses().count();
            tracing::warn!(
                task_id,
                received,
                expected = task.expected().len(),
                "task abandoned"
            );
            enter(task_id, CoordinatorState::Failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::runtime::{AgentRuntime, AgentSettings, RuntimeDeps};
    use crate::llm::scripted::ScriptedProvider;
    use crate::message::bus::MessageBus;
    use crate::message::envelope::AgentId;
    use crate::orchestration::cancel::CancelRegistry;
    use crate::orchestration::routing::KeywordRouter;
    use crate::streaming::tap::EventTap;
    use tokio::sync::mpsc::{self, UnboundedReceiver};
    use tokio_util::sync::CancellationToken;

    #[test]
    fn parses_verdicts() {
        assert_eq!(
            CritiqueVerdict::parse("APPROVED: all good"),
            CritiqueVerdict::Approved("all good".into())
        );
        assert_eq!(
            CritiqueVerdict::parse("Verdict - REVISE: the mean is wrong"),
            CritiqueVerdict::Revise("the mean is wrong".into())
        );
        assert_eq!(
            CritiqueVerdict::parse("Reads well."),
            CritiqueVerdict::Approved("Reads well.".into())
        );
        assert_eq!(
            CritiqueVerdict::parse("ERROR: provider error: 500"),
            CritiqueVerdict::Unavailable
        );
    }

    #[test]
    fn revise_far_from_the_start_is_not_a_verdict() {
        let text = format!("{}REVISE: nope", "x".repeat(60));
        assert_eq!(CritiqueVerdict::parse(&text), CritiqueVerdict::Approved(text.clone()));
    }

    /// Coordinator runtime with the other roles replaced by recording inboxes.
    struct Harness {
        bus: MessageBus,
        inboxes: std::collections::HashMap<&'static str, UnboundedReceiver<MessageEnvelope>>,
    }

    fn harness(options: CoordinatorOptions) -> Harness {
        harness_with(options, Arc::new(KeywordRouter::default()))
    }

    fn harness_with(options: CoordinatorOptions, router: Arc<dyn RoutingPolicy>) -> Harness {
        let tap = EventTap::new();
        let bus = MessageBus::new(tap.clone());
        let mut inboxes = std::collections::HashMap::new();
        for id in [
            ids::USER,
            ids::SPECIALIST_MATH,
            ids::SPECIALIST_TEXT,
            ids::ANALYST,
            ids::SUPER_CRITIC,
        ] {
            let (tx, rx) = mpsc::unbounded_channel();
            bus.subscribe(id, move |env| {
                let _ = tx.send(env);
                Ok(())
            });
            inboxes.insert(id, rx);
        }
        let shutdown = CancellationToken::new();
        AgentRuntime::spawn(
            ids::COORDINATOR,
            Coordinator::new(router, options),
            AgentSettings::new("coordinator-model", prompts::COORDINATOR),
            RuntimeDeps {
                bus: bus.clone(),
                tap,
                provider: Arc::new(ScriptedProvider::echo().reply("coordinator-model", "1. math\n2. text")),
                cancellations: CancelRegistry::new(shutdown.clone()),
                shutdown,
            },
        );
        Harness { bus, inboxes }
    }

    impl Harness {
        async fn next(&mut self, id: &str) -> MessageEnvelope {
            self.inboxes.get_mut(id).unwrap().recv().await.unwrap()
        }

        fn nothing_for(&mut self, id: &str) -> bool {
            self.inboxes.get_mut(id).unwrap().try_recv().is_err()
        }

        fn submit(&self, task: &str) -> MessageEnvelope {
            let request = MessageEnvelope::new(Performative::Request, ids::USER, ids::COORDINATOR, task);
            self.bus.publish(request.clone()).unwrap();
            request
        }

        fn answer(&self, from: &str, to: &MessageEnvelope, perf: Performative, text: &str) {
            self.bus.publish(to.reply(from, perf, text)).unwrap();
        }
    }

    const MIXED: &str = "Calculate the average rating of 5 reviews and summarize sentiment";

    #[tokio::test]
    async fn barrier_then_synthesis_then_critique() {
        let mut h = harness(CoordinatorOptions::default());
        let task = h.submit(MIXED);

        let to_math = h.next(ids::SPECIALIST_MATH).await;
        let to_text = h.next(ids::SPECIALIST_TEXT).await;
        assert_eq!(to_math.correlation_id.as_deref(), Some(task.id.as_str()));
        assert_eq!(to_text.correlation_id.as_deref(), Some(task.id.as_str()));

        // Text answers first; one of two responses must not release the barrier.
        h.answer(ids::SPECIALIST_TEXT, &to_text, Performative::Inform, "mostly positive");
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(h.nothing_for(ids::ANALYST));

        h.answer(ids::SPECIALIST_MATH, &to_math, Performative::Inform, "average 4.2");
        let synthesis_request = h.next(ids::ANALYST).await;
        let math = synthesis_request.content.find("[specialist_math]:\naverage 4.2").unwrap();
        let text = synthesis_request.content.find("[specialist_text]:\nmostly positive").unwrap();
        assert!(math < text);

        h.answer(ids::ANALYST, &synthesis_request, Performative::Inform, "4.2 and positive");
        let evaluate = h.next(ids::SUPER_CRITIC).await;
        assert_eq!(evaluate.performative, Performative::Evaluate);
        assert!(evaluate.content.contains("4.2 and positive"));

        h.answer(ids::SUPER_CRITIC, &evaluate, Performative::Inform, "APPROVED: 4.2 stars, positive");
        let final_answer = h.next(ids::USER).await;
        assert_eq!(final_answer.performative, Performative::Inform);
        assert_eq!(final_answer.content, "4.2 stars, positive");
        assert_eq!(final_answer.correlation_id.as_deref(), Some(task.id.as_str()));
        assert_eq!(final_answer.metadata[CRITIQUE_KEY], json!("approved"));

        // A late duplicate neither re-triggers synthesis nor a second answer.
        h.answer(ids::SPECIALIST_MATH, &to_math, Performative::Inform, "average 4.2");
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(h.nothing_for(ids::ANALYST));
        assert!(h.nothing_for(ids::USER));
    }

    #[tokio::test]
    async fn revise_is_forwarded_once_with_note() {
        let mut h = harness(CoordinatorOptions::default());
        h.submit("Hello there");
        let to_text = h.next(ids::SPECIALIST_TEXT).await;
        h.answer(ids::SPECIALIST_TEXT, &to_text, Performative::Inform, "hi");
        let synth = h.next(ids::ANALYST).await;
        h.answer(ids::ANALYST, &synth, Performative::Inform, "greeting");
        let evaluate = h.next(ids::SUPER_CRITIC).await;
        h.answer(ids::SUPER_CRITIC, &evaluate, Performative::Inform, "REVISE: too short");

        let final_answer = h.next(ids::USER).await;
        assert!(final_answer.content.starts_with(REVISION_NOTE));
        assert!(final_answer.content.contains("too short"));
        assert!(final_answer.content.ends_with("greeting"));
        assert!(h.nothing_for(ids::ANALYST));
    }

    #[tokio::test]
    async fn reject_counts_as_degraded_response() {
        let mut h = harness(CoordinatorOptions {
            critique: false,
            decompose: false,
        });
        h.submit(MIXED);
        let to_math = h.next(ids::SPECIALIST_MATH).await;
        let to_text = h.next(ids::SPECIALIST_TEXT).await;
        h.answer(ids::SPECIALIST_MATH, &to_math, Performative::Reject, "ERROR: processing failed: x");
        h.answer(ids::SPECIALIST_TEXT, &to_text, Performative::Inform, "fine");

        let synth = h.next(ids::ANALYST).await;
        assert!(synth.content.contains("[specialist_math]:\nERROR: processing failed: x"));
        h.answer(ids::ANALYST, &synth, Performative::Inform, "partial answer");

        let final_answer = h.next(ids::USER).await;
        assert_eq!(final_answer.content, "partial answer");
        assert_eq!(final_answer.metadata[CRITIQUE_KEY], json!("skipped"));
        assert!(h.nothing_for(ids::SUPER_CRITIC));
    }

    #[tokio::test]
    async fn unknown_correlation_is_dropped() {
        let mut h = harness(CoordinatorOptions::default());
        let stray = MessageEnvelope::new(Performative::Request, ids::USER, "nobody", "old");
        h.bus.publish(stray.clone()).ok();
        let late = MessageEnvelope::new(Performative::Inform, ids::SPECIALIST_MATH, ids::COORDINATOR, "late")
            .with_correlation(stray.id.clone());
        h.bus.publish(late).unwrap();
        // The coordinator keeps working afterwards.
        h.submit("Hello there");
        let to_text = h.next(ids::SPECIALIST_TEXT).await;
        assert_eq!(to_text.content, "Hello there");
    }

    #[tokio::test]
    async fn decomposition_plan_rides_along() {
        let mut h = harness(CoordinatorOptions {
            critique: true,
            decompose: true,
        });
        h.submit(MIXED);
        let to_math = h.next(ids::SPECIALIST_MATH).await;
        assert_eq!(to_math.metadata[PLAN_KEY], json!("1. math\n2. text"));
    }

    #[tokio::test]
    async fn analyst_failure_falls_back_to_sections() {
        let mut h = harness(CoordinatorOptions {
            critique: false,
            decompose: false,
        });
        h.submit("Hello there");
        let to_text = h.next(ids::SPECIALIST_TEXT).await;
        h.answer(ids::SPECIALIST_TEXT, &to_text, Performative::Inform, "hi");
        let synth = h.next(ids::ANALYST).await;
        h.answer(ids::ANALYST, &synth, Performative::Inform, "ERROR: LLM call timed out after 30 seconds");

        let final_answer = h.next(ids::USER).await;
        assert_eq!(final_answer.content, "[specialist_text]:\nhi");
    }

    /// Routes every task to the text specialist twice.
    struct Repeating;

    impl RoutingPolicy for Repeating {
        fn route(&self, _task: &str) -> Vec<AgentId> {
            vec![ids::SPECIALIST_TEXT.into(), ids::SPECIALIST_TEXT.into()]
        }

        fn targets(&self) -> Vec<AgentId> {
            vec![ids::SPECIALIST_TEXT.into()]
        }
    }

    #[tokio::test]
    async fn repeated_specialist_is_delegated_once_and_barrier_releases() {
        let mut h = harness_with(
            CoordinatorOptions {
                critique: false,
                decompose: false,
            },
            Arc::new(Repeating),
        );
        h.submit("Hello there");
        let to_text = h.next(ids::SPECIALIST_TEXT).await;
        tokio::task::yield_now().await;
        assert!(h.nothing_for(ids::SPECIALIST_TEXT));

        h.answer(ids::SPECIALIST_TEXT, &to_text, Performative::Inform, "hi");
        let synth = h.next(ids::ANALYST).await;
        assert_eq!(synth.content.matches("[specialist_text]:").count(), 1);
        h.answer(ids::ANALYST, &synth, Performative::Inform, "greeting");

        let final_answer = h.next(ids::USER).await;
        assert_eq!(final_answer.content, "greeting");
        assert_eq!(final_answer.metadata[SPECIALISTS_KEY], json!([ids::SPECIALIST_TEXT]));
    }
}
