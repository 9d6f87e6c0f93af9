//! Rule execution engine
//!
//! This crate drives user-defined automation rules from trigger to action.
//! Rules are declarative (`automation-core`); external providers register
//! handler factories for the module types they implement, and the engine
//! binds each rule's modules to handlers as factories come and go.
//!
//! # Architecture
//!
//! ```text
//! RULE = TRIGGERS → CONDITIONS (all must hold) → ACTIONS (in order)
//!                    inputs fed through connections to live outputs
//! ```
//!
//! - **Binding**: every module of a rule is resolved against the factory
//!   registry; missing handlers leave the rule stored-but-uninitialized with
//!   structured errors on its status, retried whenever a matching factory
//!   registers.
//! - **Firing**: a bound trigger handler invokes its rule's [`RuleCallback`]
//!   with fresh output values; conditions gate, actions run, and action
//!   outputs become visible to later actions through their connections.
//!
//! # Key Types
//!
//! - [`RuleEngine`] - owns all rule, status, and factory state
//! - [`HandlerFactory`] - capability providers register this per module type
//! - [`TriggerHandler`] / [`ConditionHandler`] / [`ActionHandler`] - the
//!   per-kind handler contracts
//! - [`RuleCallback`] - per-rule entry point for trigger firings

use std::sync::{Mutex, MutexGuard, PoisonError};

mod callback;
mod engine;
mod handler;
mod runtime;

pub use callback::RuleCallback;
pub use engine::{EngineError, EngineResult, RuleEngine};
pub use handler::{
    ActionHandler, ConditionHandler, HandlerError, HandlerFactory, HandlerResult, InputValues,
    ModuleHandler, OutputValues, TriggerHandler,
};

/// Lock a mutex, recovering the data if a handler panicked while holding it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
