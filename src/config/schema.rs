use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::agent::roles::AgentRole;
use crate::llm::pricing::ModelPrice;
use crate::message::envelope::ids;
use crate::orchestration::routing::RoutingRule;

/// The TOML file structure for weave.toml.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    pub general: Option<GeneralConfig>,
    pub timeouts: Option<TimeoutsConfig>,
    pub fabric: Option<FabricConfig>,
    #[serde(default)]
    pub agents: HashMap<String, AgentOverride>,
    pub routing: Option<RoutingConfig>,
    #[serde(default)]
    pub pricing: HashMap<String, ModelPrice>,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    pub default_model: Option<String>,
    pub transcript_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TimeoutsConfig {
    pub llm_call_secs: Option<u64>,
    pub task_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct FabricConfig {
    pub mailbox_capacity: Option<usize>,
    pub critique: Option<bool>,
    pub decompose: Option<bool>,
    pub memory_capacity: Option<usize>,
    pub similar_tasks: Option<usize>,
    /// JSON file the task memory is loaded from and saved to.
    pub memory_file: Option<String>,
}

/// Per-agent settings under `[agents.<id>]`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AgentOverride {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
}

impl AgentOverride {
    /// Field-wise merge; self's values take precedence.
    pub fn with_fallback(self, fallback: AgentOverride) -> AgentOverride {
        AgentOverride {
            model: self.model.or(fallback.model),
            system_prompt: self.system_prompt.or(fallback.system_prompt),
            temperature: self.temperature.or(fallback.temperature),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RoutingConfig {
    pub fallback: Option<String>,
    /// If specified, fully replaces the default rule set.
    pub rules: Option<Vec<RoutingRule>>,
}

impl ConfigFile {
    pub fn to_partial(self) -> PartialConfig {
        for id in self.agents.keys() {
            if AgentRole::from_id(id).is_none() && id != ids::TRADITIONAL {
                tracing::warn!(agent = %id, "config names an unknown agent, ignored");
            }
        }
        let general = self.general;
        let timeouts = self.timeouts;
        let fabric = self.fabric;
        let routing = self.routing;

        PartialConfig {
            default_model: general.as_ref().and_then(|g| g.default_model.clone()),
            transcript_dir: general
                .as_ref()
                .and_then(|g| g.transcript_dir.as_ref().map(PathBuf::from)),
            llm_call_secs: timeouts.as_ref().and_then(|t| t.llm_call_secs),
            task_secs: timeouts.as_ref().and_then(|t| t.task_secs),
            mailbox_capacity: fabric.as_ref().and_then(|f| f.mailbox_capacity),
            critique: fabric.as_ref().and_then(|f| f.critique),
            decompose: fabric.as_ref().and_then(|f| f.decompose),
            memory_capacity: fabric.as_ref().and_then(|f| f.memory_capacity),
            similar_tasks: fabric.as_ref().and_then(|f| f.similar_tasks),
            memory_file: fabric
                .as_ref()
                .and_then(|f| f.memory_file.as_ref().map(PathBuf::from)),
            agents: self.agents,
            routing_fallback: routing.as_ref().and_then(|r| r.fallback.clone()),
            routing_rules: routing.and_then(|r| r.rules),
            pricing: self.pricing,
        }
    }
}

/// Fully-resolved runtime configuration. All fields have values.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub default_model: String,
    pub transcript_dir: PathBuf,
    pub llm_call_secs: u64,
    pub task_secs: u64,
    pub mailbox_capacity: usize,
    pub critique: bool,
    pub decompose: bool,
    pub memory_capacity: usize,
    pub similar_tasks: usize,
    /// In-memory only when unset.
    pub memory_file: Option<PathBuf>,
    pub agents: HashMap<String, AgentOverride>,
    pub routing_fallback: String,
    pub routing_rules: Vec<RoutingRule>,
    pub pricing: HashMap<String, ModelPrice>,
}

/// Partial config used during merge. All fields are Option so that
/// missing fields don't override lower-priority values.
#[derive(Debug, Clone, Default)]
pub struct PartialConfig {
    pub default_model: Option<String>,
    pub transcript_dir: Option<PathBuf>,
    pub llm_call_secs: Option<u64>,
    pub task_secs: Option<u64>,
    pub mailbox_capacity: Option<usize>,
    pub critique: Option<bool>,
    pub decompose: Option<bool>,
    pub memory_capacity: Option<usize>,
    pub similar_tasks: Option<usize>,
    pub memory_file: Option<PathBuf>,
    pub agents: HashMap<String, AgentOverride>,
    pub routing_fallback: Option<String>,
    pub routing_rules: Option<Vec<RoutingRule>>,
    pub pricing: HashMap<String, ModelPrice>,
}
