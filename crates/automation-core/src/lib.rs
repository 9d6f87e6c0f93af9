//! Core types for the automation rule engine
//!
//! This crate provides the fundamental, purely-declarative types the engine
//! operates on: Trigger, Condition, Action, Connection, Rule, and RuleStatus.
//! Nothing in here holds runtime state or locks; the runtime side lives in
//! `automation-engine`.

mod connection;
mod module;
mod rule;
mod status;

pub use connection::Connection;
pub use module::{system_type, Action, Condition, Module, ModuleKind, ModuleTypeError, Trigger};
pub use rule::{Rule, RuleConfig};
pub use status::{RuleError, RuleErrorCode, RuleStatus};

/// Separator between a base system module type and a custom sub-type.
///
/// `SampleTrigger:CustomTrigger` is a custom module type built on the
/// `SampleTrigger` system type; handlers are resolved by the base type.
pub const MODULE_TYPE_SEPARATOR: char = ':';
