//! The fixed set of agent roles and the strategies behind the worker roles.
//!
//! The coordinator's strategy lives in [`crate::orchestration::coordinator`];
//! everything here answers one envelope with one LLM call.

use async_trait::async_trait;

use super::prompts;
use super::runtime::{AgentContext, AgentStrategy};
use crate::error::AgentError;
use crate::message::envelope::{MessageEnvelope, Performative, ids};

/// Metadata key under which the coordinator attaches its plan to delegations.
pub const PLAN_KEY: &str = "plan";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Math,
    Text,
}

impl Domain {
    fn label(&self) -> &'static str {
        match self {
            Domain::Math => "Math",
            Domain::Text => "Text",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentRole {
    Coordinator,
    Specialist(Domain),
    Analyst,
    Critic,
}

impl AgentRole {
    pub const ALL: [AgentRole; 5] = [
        AgentRole::Coordinator,
        AgentRole::Specialist(Domain::Math),
        AgentRole::Specialist(Domain::Text),
        AgentRole::Analyst,
        AgentRole::Critic,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            AgentRole::Coordinator => ids::COORDINATOR,
            AgentRole::Specialist(Domain::Math) => ids::SPECIALIST_MATH,
            AgentRole::Specialist(Domain::Text) => ids::SPECIALIST_TEXT,
            AgentRole::Analyst => ids::ANALYST,
            AgentRole::Critic => ids::SUPER_CRITIC,
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.id() == id)
    }

    pub fn default_system_prompt(&self) -> &'static str {
        match self {
            AgentRole::Coordinator => prompts::COORDINATOR,
            AgentRole::Specialist(Domain::Math) => prompts::SPECIALIST_MATH,
            AgentRole::Specialist(Domain::Text) => prompts::SPECIALIST_TEXT,
            AgentRole::Analyst => prompts::ANALYST,
            AgentRole::Critic => prompts::SUPER_CRITIC,
        }
    }

    pub fn is_specialist(&self) -> bool {
        matches!(self, AgentRole::Specialist(_))
    }
}

fn is_work_request(envelope: &MessageEnvelope) -> bool {
    matches!(
        envelope.performative,
        Performative::Request | Performative::Query
    )
}

/// Answers REQUEST/QUERY envelopes within one domain.
pub struct SpecialistAgent {
    domain: Domain,
}

impl SpecialistAgent {
    pub fn new(domain: Domain) -> Self {
        Self { domain }
    }
}

#[async_trait]
impl AgentStrategy for SpecialistAgent {
    async fn process(
        &mut self,
        envelope: MessageEnvelope,
        ctx: &mut AgentContext,
    ) -> Result<Option<MessageEnvelope>, AgentError> {
        if !is_work_request(&envelope) {
            tracing::debug!(agent = %ctx.id(), performative = %envelope.performative, "ignored");
            return Ok(None);
        }
        let plan = envelope.metadata.get(PLAN_KEY).and_then(|v| v.as_str());
        let prompt = prompts::with_plan(plan, &envelope.content);
        let answer = ctx.call_llm(&prompt).await;

        Ok(Some(
            envelope
                .reply(ctx.id().to_string(), Performative::Inform, answer)
                .with_summary(format!("{} analysis complete", self.domain.label())),
        ))
    }
}

/// Turns the collected specialist answers into one answer.
pub struct AnalystAgent;

#[async_trait]
impl AgentStrategy for AnalystAgent {
    async fn process(
        &mut self,
        envelope: MessageEnvelope,
        ctx: &mut AgentContext,
    ) -> Result<Option<MessageEnvelope>, AgentError> {
        if !is_work_request(&envelope) {
            return Ok(None);
        }
        let synthesis = ctx.call_llm(&envelope.content).await;
        Ok(Some(
            envelope
                .reply(ctx.id().to_string(), Performative::Inform, synthesis)
                .with_summary("Synthesis complete"),
        ))
    }
}

/// Reviews a synthesis and answers with an `APPROVED:` or `REVISE:` verdict.
pub struct CriticAgent;

/// Make sure a verdict carries one of the two prefixes. Text that names
/// neither near its start is taken as approval of itself. LLM error text
/// is passed through untouched so the coordinator can recognize it.
pub fn normalize_verdict(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with("ERROR:") {
        return trimmed.to_string();
    }
    let head: String = trimmed.chars().take(20).collect::<String>().to_uppercase();
    if head.contains("APPROVED") || head.contains("REVISE") {
        trimmed.to_string()
    } else {
        format!("APPROVED: {trimmed}")
    }
}

#[async_trait]
impl AgentStrategy for CriticAgent {
    async fn process(
        &mut self,
        envelope: MessageEnvelope,
        ctx: &mut AgentContext,
    ) -> Result<Option<MessageEnvelope>, AgentError> {
        if !matches!(
            envelope.performative,
            Performative::Evaluate | Performative::Request
        ) {
            return Ok(None);
        }
        let verdict = normalize_verdict(&ctx.call_llm(&envelope.content).await);
        let summary = if verdict.to_uppercase().starts_with("REVISE") {
            "Critique: revision requested"
        } else {
            "Critique: approved"
        };
        Ok(Some(
            envelope
                .reply(ctx.id().to_string(), Performative::Inform, verdict)
                .with_summary(summary),
        ))
    }
}
