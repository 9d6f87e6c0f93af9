//! Rule definition
//!
//! A rule ties together triggers, conditions, and actions. `RuleConfig` is
//! the serde-facing form; `Rule` is the validated definition the engine
//! stores, with a concrete id.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::module::{Action, Condition, Module, Trigger};

/// Rule definition as supplied by callers (API layer, config files)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Unique id (auto-generated if not provided)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Human-readable name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Tags for grouping and lookup
    #[serde(default)]
    pub tags: HashSet<String>,

    /// Whether the rule starts out enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Triggers that fire the rule
    #[serde(default)]
    pub triggers: Vec<Trigger>,

    /// Conditions gating execution
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Actions executed in declaration order
    #[serde(default)]
    pub actions: Vec<Action>,
}

fn default_enabled() -> bool {
    true
}

/// A rule as stored by the engine
///
/// A rule with zero triggers can never fire, but that is not an error;
/// it simply stays idle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Unique identifier
    pub id: String,

    /// Human-readable name
    pub name: Option<String>,

    /// Description
    pub description: Option<String>,

    /// Tags for grouping and lookup
    pub tags: HashSet<String>,

    /// Enabled flag the rule starts out with; an operator's later choice
    /// is tracked on the status, not here
    pub initial_enabled: bool,

    /// Triggers that fire the rule
    pub triggers: Vec<Trigger>,

    /// Conditions gating execution
    pub conditions: Vec<Condition>,

    /// Actions executed in declaration order
    pub actions: Vec<Action>,
}

impl Rule {
    /// Create from config, generating a ULID id when none is provided
    pub fn from_config(config: RuleConfig) -> Self {
        let id = config.id.unwrap_or_else(|| ulid::Ulid::new().to_string());

        Self {
            id,
            name: config.name,
            description: config.description,
            tags: config.tags,
            initial_enabled: config.enabled,
            triggers: config.triggers,
            conditions: config.conditions,
            actions: config.actions,
        }
    }

    /// Display name (name or id)
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Whether the rule carries the given tag
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Look up any module of the rule by its id
    pub fn module(&self, module_id: &str) -> Option<Module<'_>> {
        self.modules().find(|m| m.id() == module_id)
    }

    /// Iterate over all modules: triggers, then conditions, then actions
    pub fn modules(&self) -> impl Iterator<Item = Module<'_>> {
        self.triggers
            .iter()
            .map(Module::Trigger)
            .chain(self.conditions.iter().map(Module::Condition))
            .chain(self.actions.iter().map(Module::Action))
    }
}
