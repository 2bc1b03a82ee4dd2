//! Choosing which specialists receive a task.
//!
//! [`RoutingPolicy`] is the seam; [`KeywordRouter`] is the default policy.
//! Whatever the policy, `route` must never return an empty set: the keyword
//! router falls back to a default specialist when no rule matches.

use regex::{RegexBuilder, RegexSet, RegexSetBuilder};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::message::envelope::{AgentId, ids};

pub trait RoutingPolicy: Send + Sync {
    /// Specialists that should work on `task`, without duplicates.
    fn route(&self, task: &str) -> Vec<AgentId>;

    /// Every specialist this policy can return.
    fn targets(&self) -> Vec<AgentId>;
}

/// One routing rule: tasks matching `pattern` go to `specialist`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoutingRule {
    pub pattern: String,
    pub specialist: AgentId,
}

impl RoutingRule {
    pub fn new(pattern: impl Into<String>, specialist: impl Into<AgentId>) -> Self {
        Self {
            pattern: pattern.into(),
            specialist: specialist.into(),
        }
    }
}

pub fn default_rules() -> Vec<RoutingRule> {
    vec![
        RoutingRule::new(
            r"\b(calculat\w*|comput\w*|average|mean|median|sum|total|statistic\w*|numbers?|percent\w*|ratings?|count|math\w*)\b",
            ids::SPECIALIST_MATH,
        ),
        RoutingRule::new(
            r"\b(summar\w*|sentiment|text|write|writing|reviews?|tone|themes?|documents?|essay|translat\w*)\b",
            ids::SPECIALIST_TEXT,
        ),
    ]
}

/// Case-insensitive regex rules with a mandatory fallback.
pub struct KeywordRouter {
    patterns: RegexSet,
    specialists: Vec<AgentId>,
    fallback: AgentId,
}

impl KeywordRouter {
    /// Compile `rules` once. A bad pattern is reported by name.
    pub fn new(rules: &[RoutingRule], fallback: impl Into<AgentId>) -> Result<Self, ConfigError> {
        for rule in rules {
            RegexBuilder::new(&rule.pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| ConfigError::InvalidPattern {
                    pattern: rule.pattern.clone(),
                    message: e.to_string(),
                })?;
        }
        let patterns = RegexSetBuilder::new(rules.iter().map(|r| r.pattern.as_str()))
            .case_insensitive(true)
            .build()
            .map_err(|e| ConfigError::InvalidPattern {
                pattern: "<rule set>".to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            patterns,
            specialists: rules.iter().map(|r| r.specialist.clone()).collect(),
            fallback: fallback.into(),
        })
    }

    pub fn fallback(&self) -> &str {
        &self.fallback
    }
}

impl Default for KeywordRouter {
    fn default() -> Self {
        // The built-in patterns are known to compile.
        let rules = default_rules();
        let patterns = RegexSetBuilder::new(rules.iter().map(|r| r.pattern.as_str()))
            .case_insensitive(true)
            .build()
            .unwrap_or_else(|_| RegexSet::empty());
        Self {
            patterns,
            specialists: rules.into_iter().map(|r| r.specialist).collect(),
            fallback: ids::SPECIALIST_TEXT.to_string(),
        }
    }
}

impl RoutingPolicy for KeywordRouter {
    fn route(&self, task: &str) -> Vec<AgentId> {
        let mut chosen: Vec<AgentId> = Vec::new();
        for index in self.patterns.matches(task).into_iter() {
            let specialist = &self.specialists[index];
            if !chosen.contains(specialist) {
                chosen.push(specialist.clone());
            }
        }
        if chosen.is_empty() {
            tracing::debug!(fallback = %self.fallback, "no routing rule matched");
            chosen.push(self.fallback.clone());
        }
        chosen
    }

    fn targets(&self) -> Vec<AgentId> {
        let mut all: Vec<AgentId> = Vec::new();
        for specialist in self.specialists.iter().chain(std::iter::once(&self.fallback)) {
            if !all.contains(specialist) {
                all.push(specialist.clone());
            }
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_task_reaches_both_specialists() {
        let router = KeywordRouter::default();
        assert_eq!(
            router.route("Calculate the average rating of 5 reviews and summarize sentiment"),
            vec![ids::SPECIALIST_MATH.to_string(), ids::SPECIALIST_TEXT.to_string()]
        );
    }

    #[test]
    fn unmatched_task_falls_back() {
        let router = KeywordRouter::default();
        assert_eq!(router.route("Hello there"), vec![ids::SPECIALIST_TEXT.to_string()]);
        assert_eq!(router.route(""), vec![ids::SPECIALIST_TEXT.to_string()]);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let router = KeywordRouter::default();
        assert_eq!(router.route("MEDIAN please"), vec![ids::SPECIALIST_MATH.to_string()]);
    }

    #[test]
    fn duplicate_targets_are_collapsed() {
        let rules = vec![
            RoutingRule::new("alpha", "a"),
            RoutingRule::new("beta", "a"),
            RoutingRule::new("gamma", "b"),
        ];
        let router = KeywordRouter::new(&rules, "b").unwrap();
        assert_eq!(router.route("alpha beta"), vec!["a".to_string()]);
        assert_eq!(router.targets(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn empty_rule_set_still_routes() {
        let router = KeywordRouter::new(&[], "solo").unwrap();
        assert_eq!(router.route("anything"), vec!["solo".to_string()]);
    }

    #[test]
    fn bad_pattern_is_named() {
        let rules = vec![RoutingRule::new("(unclosed", "a")];
        match KeywordRouter::new(&rules, "a") {
            Err(ConfigError::InvalidPattern { pattern, .. }) => assert_eq!(pattern, "(unclosed"),
            other => panic!("expected InvalidPattern, got {:?}", other.err()),
        }
    }
}
