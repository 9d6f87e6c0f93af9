//! Handler capability contracts
//!
//! Handlers are the runtime behavior bound to modules. They are supplied by
//! handler factories, which external providers register with the engine for
//! the module types they support. The engine treats handlers as opaque: they
//! may block, and no timeout is imposed on a handler call.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use automation_core::{Module, ModuleKind};

use crate::callback::RuleCallback;

/// Named values flowing into a condition or action
pub type InputValues = HashMap<String, serde_json::Value>;

/// Named values produced by a trigger or action
pub type OutputValues = HashMap<String, serde_json::Value>;

/// Result type for handler calls
pub type HandlerResult<T> = Result<T, HandlerError>;

/// Errors a handler may report during a firing
///
/// These are per-firing failures: the engine logs them and aborts the
/// current firing without touching the rule's status.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),

    #[error("missing input: {0}")]
    MissingInput(String),

    #[error("invalid input {name}: {reason}")]
    InvalidInput { name: String, reason: String },
}

/// Runtime behavior of a trigger module
///
/// The handler decides on its own when to fire; the engine only reacts.
pub trait TriggerHandler: Send + Sync {
    /// Wire or unwire the per-rule callback.
    ///
    /// With a callback present the handler may start invoking
    /// [`RuleCallback::triggered`] from its own thread of control whenever
    /// it decides to fire; `None` must stop further invocations. A handler
    /// must not invoke the callback synchronously from inside this call.
    fn set_callback(&self, callback: Option<Arc<RuleCallback>>);
}

/// Runtime behavior of a condition module
pub trait ConditionHandler: Send + Sync {
    /// Decide whether the condition holds for the given input values
    fn is_satisfied(&self, inputs: &InputValues) -> HandlerResult<bool>;
}

/// Runtime behavior of an action module
pub trait ActionHandler: Send + Sync {
    /// Execute the action, returning its (possibly empty) named outputs
    fn execute(&self, inputs: &InputValues) -> HandlerResult<OutputValues>;
}

/// A handler tagged with the module kind it serves
///
/// Factories return this; the binder checks the tag against the module kind
/// and records a handler-mismatch error when they disagree.
#[derive(Clone)]
pub enum ModuleHandler {
    Trigger(Arc<dyn TriggerHandler>),
    Condition(Arc<dyn ConditionHandler>),
    Action(Arc<dyn ActionHandler>),
}

impl ModuleHandler {
    /// The module kind this handler serves
    pub fn kind(&self) -> ModuleKind {
        match self {
            ModuleHandler::Trigger(_) => ModuleKind::Trigger,
            ModuleHandler::Condition(_) => ModuleKind::Condition,
            ModuleHandler::Action(_) => ModuleKind::Action,
        }
    }
}

impl fmt::Debug for ModuleHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleHandler::{}", self.kind())
    }
}

/// Produces handlers for the module types it supports
///
/// One factory may back many module types. The engine resolves a module's
/// handler by the base system type of its type id (anything after the first
/// `:` is stripped). Handler disposal is drop-based: when a rule is unbound
/// the engine releases its handler references after detaching any trigger
/// callbacks.
pub trait HandlerFactory: Send + Sync {
    /// The system module types this factory can produce handlers for
    fn supported_types(&self) -> HashSet<String>;

    /// Create a handler for the given module
    ///
    /// Returning `None` is treated like a missing factory: the rule records
    /// a missing-handler error and waits for another registration.
    fn create(&self, module: Module<'_>) -> Option<ModuleHandler>;
}
