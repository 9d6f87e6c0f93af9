//! Module types
//!
//! A module is a named, typed unit within a rule. Triggers produce outputs,
//! conditions consume inputs and answer yes/no, actions consume inputs and
//! may produce outputs of their own.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::Connection;
use crate::MODULE_TYPE_SEPARATOR;

/// Module type identifier errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModuleTypeError {
    #[error("module type id must not be empty")]
    Empty,
}

/// Extract the base system type from a module type identifier
///
/// Custom sub-types use the `Base:Suffix` form and fall back to the handler
/// of their base system type.
pub fn system_type(type_id: &str) -> Result<&str, ModuleTypeError> {
    if type_id.is_empty() {
        return Err(ModuleTypeError::Empty);
    }
    match type_id.find(MODULE_TYPE_SEPARATOR) {
        Some(idx) => Ok(&type_id[..idx]),
        None => Ok(type_id),
    }
}

/// A trigger module: fires the rule and produces named outputs
///
/// Triggers have no inputs; when the bound handler decides to fire it hands
/// the engine a fresh set of output values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    /// Module id, unique within the owning rule
    pub id: String,

    /// Module type identifier, resolved against handler factories
    #[serde(rename = "type")]
    pub type_id: String,

    /// Human-readable label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Handler configuration
    #[serde(default)]
    pub configuration: HashMap<String, serde_json::Value>,
}

impl Trigger {
    /// Create a trigger with empty configuration
    pub fn new(id: impl Into<String>, type_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            type_id: type_id.into(),
            label: None,
            description: None,
            configuration: HashMap::new(),
        }
    }

    /// Set a configuration entry
    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.configuration.insert(key.into(), value);
        self
    }

    /// Set the label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// A condition module: consumes inputs and gates rule execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Module id, unique within the owning rule
    pub id: String,

    /// Module type identifier, resolved against handler factories
    #[serde(rename = "type")]
    pub type_id: String,

    /// Human-readable label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Handler configuration
    #[serde(default)]
    pub configuration: HashMap<String, serde_json::Value>,

    /// Static wiring of this module's inputs to other modules' outputs
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl Condition {
    /// Create a condition with empty configuration and no connections
    pub fn new(id: impl Into<String>, type_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            type_id: type_id.into(),
            label: None,
            description: None,
            configuration: HashMap::new(),
            connections: Vec::new(),
        }
    }

    /// Set a configuration entry
    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.configuration.insert(key.into(), value);
        self
    }

    /// Add an input connection
    pub fn with_connection(mut self, connection: Connection) -> Self {
        self.connections.push(connection);
        self
    }
}

/// An action module: consumes inputs and may produce outputs for later actions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Module id, unique within the owning rule
    pub id: String,

    /// Module type identifier, resolved against handler factories
    #[serde(rename = "type")]
    pub type_id: String,

    /// Human-readable label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Handler configuration
    #[serde(default)]
    pub configuration: HashMap<String, serde_json::Value>,

    /// Static wiring of this module's inputs to other modules' outputs
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl Action {
    /// Create an action with empty configuration and no connections
    pub fn new(id: impl Into<String>, type_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            type_id: type_id.into(),
            label: None,
            description: None,
            configuration: HashMap::new(),
            connections: Vec::new(),
        }
    }

    /// Set a configuration entry
    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.configuration.insert(key.into(), value);
        self
    }

    /// Add an input connection
    pub fn with_connection(mut self, connection: Connection) -> Self {
        self.connections.push(connection);
        self
    }
}

/// The kind of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    Trigger,
    Condition,
    Action,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleKind::Trigger => write!(f, "trigger"),
            ModuleKind::Condition => write!(f, "condition"),
            ModuleKind::Action => write!(f, "action"),
        }
    }
}

/// Borrowed, tagged view over any module of a rule
///
/// Code that treats modules generically (the binder, handler factories)
/// dispatches on this tag; there is no downcasting anywhere.
#[derive(Debug, Clone, Copy)]
pub enum Module<'a> {
    Trigger(&'a Trigger),
    Condition(&'a Condition),
    Action(&'a Action),
}

impl<'a> Module<'a> {
    /// Module id, unique within the owning rule
    pub fn id(&self) -> &'a str {
        match self {
            Module::Trigger(m) => &m.id,
            Module::Condition(m) => &m.id,
            Module::Action(m) => &m.id,
        }
    }

    /// Full module type identifier (possibly a `Base:Suffix` sub-type)
    pub fn type_id(&self) -> &'a str {
        match self {
            Module::Trigger(m) => &m.type_id,
            Module::Condition(m) => &m.type_id,
            Module::Action(m) => &m.type_id,
        }
    }

    /// Handler configuration
    pub fn configuration(&self) -> &'a HashMap<String, serde_json::Value> {
        match self {
            Module::Trigger(m) => &m.configuration,
            Module::Condition(m) => &m.configuration,
            Module::Action(m) => &m.configuration,
        }
    }

    /// Declared input connections (always empty for triggers)
    pub fn connections(&self) -> &'a [Connection] {
        match self {
            Module::Trigger(_) => &[],
            Module::Condition(m) => &m.connections,
            Module::Action(m) => &m.connections,
        }
    }

    /// The kind tag
    pub fn kind(&self) -> ModuleKind {
        match self {
            Module::Trigger(_) => ModuleKind::Trigger,
            Module::Condition(_) => ModuleKind::Condition,
            Module::Action(_) => ModuleKind::Action,
        }
    }

    /// Whether this module produces outputs other modules can connect to
    pub fn is_output_source(&self) -> bool {
        matches!(self, Module::Trigger(_) | Module::Action(_))
    }
}
