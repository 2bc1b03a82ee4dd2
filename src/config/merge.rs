use super::schema::{AppConfig, PartialConfig};
use crate::agent::prompts;
use crate::agent::roles::AgentRole;
use crate::agent::runtime::AgentSettings;
use crate::message::envelope::ids;
use crate::orchestration::routing::default_rules;
use std::path::PathBuf;
use std::time::Duration;

impl PartialConfig {
    /// Merge self with a lower-priority fallback.
    /// Self's non-None values take precedence.
    /// For routing_rules: REPLACE semantics (if self has Some, use it entirely).
    /// For agents and pricing: per-key merge.
    pub fn with_fallback(self, fallback: PartialConfig) -> PartialConfig {
        let mut agents = fallback.agents;
        for (id, over) in self.agents {
            let merged = match agents.remove(&id) {
                Some(lower) => over.with_fallback(lower),
                None => over,
            };
            agents.insert(id, merged);
        }
        let mut pricing = fallback.pricing;
        pricing.extend(self.pricing);

        PartialConfig {
            default_model: self.default_model.or(fallback.default_model),
            transcript_dir: self.transcript_dir.or(fallback.transcript_dir),
            llm_call_secs: self.llm_call_secs.or(fallback.llm_call_secs),
            task_secs: self.task_secs.or(fallback.task_secs),
            mailbox_capacity: self.mailbox_capacity.or(fallback.mailbox_capacity),
            critique: self.critique.or(fallback.critique),
            decompose: self.decompose.or(fallback.decompose),
            memory_capacity: self.memory_capacity.or(fallback.memory_capacity),
            similar_tasks: self.similar_tasks.or(fallback.similar_tasks),
            memory_file: self.memory_file.or(fallback.memory_file),
            agents,
            routing_fallback: self.routing_fallback.or(fallback.routing_fallback),
            routing_rules: self.routing_rules.or(fallback.routing_rules),
            pricing,
        }
    }

    /// Convert to AppConfig, filling any remaining gaps with defaults.
    pub fn finalize(self) -> AppConfig {
        AppConfig {
            default_model: self
                .default_model
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            transcript_dir: self
                .transcript_dir
                .unwrap_or_else(|| PathBuf::from(".weave-logs")),
            llm_call_secs: self.llm_call_secs.unwrap_or(30),
            task_secs: self.task_secs.unwrap_or(90),
            mailbox_capacity: self.mailbox_capacity.unwrap_or(64).max(1),
            critique: self.critique.unwrap_or(true),
            decompose: self.decompose.unwrap_or(false),
            memory_capacity: self.memory_capacity.unwrap_or(100),
            similar_tasks: self.similar_tasks.unwrap_or(2),
            memory_file: self.memory_file,
            agents: self.agents,
            routing_fallback: self
                .routing_fallback
                .unwrap_or_else(|| ids::SPECIALIST_TEXT.to_string()),
            routing_rules: self.routing_rules.unwrap_or_else(default_rules),
            pricing: self.pricing,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        PartialConfig::default().finalize()
    }
}

impl AppConfig {
    /// Resolved model settings for one role.
    pub fn agent_settings(&self, role: AgentRole) -> AgentSettings {
        self.settings_for(role.id(), role.default_system_prompt())
    }

    /// Settings for the single-model baseline, overridable as `[agents.traditional]`.
    pub fn traditional_settings(&self) -> AgentSettings {
        self.settings_for(ids::TRADITIONAL, prompts::TRADITIONAL)
    }

    fn settings_for(&self, id: &str, default_prompt: &str) -> AgentSettings {
        let over = self.agents.get(id).cloned().unwrap_or_default();
        AgentSettings {
            model: over.model.unwrap_or_else(|| self.default_model.clone()),
            system_prompt: over
                .system_prompt
                .unwrap_or_else(|| default_prompt.to_string()),
            temperature: over.temperature.or(Some(0.7)),
            llm_timeout: Duration::from_secs(self.llm_call_secs),
            mailbox_capacity: self.mailbox_capacity,
        }
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::roles::Domain;
    use crate::config::schema::{AgentOverride, ConfigFile};
    use crate::orchestration::routing::RoutingRule;

    fn parse(toml_text: &str) -> PartialConfig {
        toml::from_str::<ConfigFile>(toml_text).unwrap().to_partial()
    }

    #[test]
    fn defaults_fill_every_field() {
        let config = AppConfig::default();
        assert_eq!(config.default_model, "gpt-4o-mini");
        assert_eq!(config.llm_call_secs, 30);
        assert_eq!(config.task_secs, 90);
        assert!(config.critique);
        assert!(!config.decompose);
        assert_eq!(config.routing_fallback, ids::SPECIALIST_TEXT);
        assert_eq!(config.routing_rules, default_rules());
    }

    #[test]
    fn higher_layer_wins_field_by_field() {
        let local = parse(
            r#"
            [timeouts]
            task_secs = 120

            [agents.analyst]
            model = "gpt-4o"
            "#,
        );
        let global = parse(
            r#"
            [general]
            default_model = "llama3.2"

            [timeouts]
            task_secs = 60
            llm_call_secs = 10

            [agents.analyst]
            temperature = 0.1
            system_prompt = "global prompt"
            "#,
        );
        let config = local.with_fallback(global).finalize();

        assert_eq!(config.default_model, "llama3.2");
        assert_eq!(config.task_secs, 120);
        assert_eq!(config.llm_call_secs, 10);
        assert_eq!(
            config.agents["analyst"],
            AgentOverride {
                model: Some("gpt-4o".into()),
                system_prompt: Some("global prompt".into()),
                temperature: Some(0.1),
            }
        );
    }

    #[test]
    fn routing_rules_replace_defaults() {
        let config = parse(
            r#"
            [routing]
            fallback = "specialist_math"

            [[routing.rules]]
            pattern = "\\bessay\\b"
            specialist = "specialist_text"
            "#,
        )
        .finalize();
        assert_eq!(config.routing_fallback, ids::SPECIALIST_MATH);
        assert_eq!(
            config.routing_rules,
            vec![RoutingRule::new(r"\bessay\b", ids::SPECIALIST_TEXT)]
        );
    }

    #[test]
    fn agent_settings_use_overrides_then_defaults() {
        let config = parse(
            r#"
            [general]
            default_model = "base"

            [agents.specialist_math]
            model = "math-model"
            "#,
        )
        .finalize();

        let math = config.agent_settings(AgentRole::Specialist(Domain::Math));
        assert_eq!(math.model, "math-model");
        assert_eq!(math.llm_timeout, Duration::from_secs(30));

        let critic = config.agent_settings(AgentRole::Critic);
        assert_eq!(critic.model, "base");
        assert_eq!(critic.system_prompt, AgentRole::Critic.default_system_prompt());
    }

    #[test]
    fn pricing_entries_merge() {
        let config = parse(
            r#"
            [pricing.llama3]
            prompt_per_million = 0.0
            completion_per_million = 0.0
            "#,
        )
        .finalize();
        assert!(config.pricing.contains_key("llama3"));
    }

    #[test]
    fn memory_file_and_baseline_settings() {
        let config = parse(
            r#"
            [general]
            default_model = "base"

            [fabric]
            memory_file = "state/memory.json"

            [agents.traditional]
            model = "gpt-4o"
            "#,
        )
        .finalize();
        assert_eq!(config.memory_file, Some(PathBuf::from("state/memory.json")));
        assert_eq!(AppConfig::default().memory_file, None);

        let baseline = config.traditional_settings();
        assert_eq!(baseline.model, "gpt-4o");
        assert_eq!(baseline.system_prompt, prompts::TRADITIONAL);
        assert_eq!(baseline.llm_timeout, Duration::from_secs(30));
    }
}
