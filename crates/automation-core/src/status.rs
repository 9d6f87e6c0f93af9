//! Per-rule status
//!
//! Exactly one `RuleStatus` exists per known rule id. Statuses are value
//! objects: every transition replaces the whole status, nothing is mutated
//! in place.

use serde::{Deserialize, Serialize};

/// Codes for errors surfaced on a rule's status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleErrorCode {
    /// No handler factory registered for a module's system type
    MissingHandler,

    /// A factory produced a handler of the wrong kind for a module
    HandlerMismatch,

    /// A connection references a missing or non-output-producing module
    BrokenConnection,
}

/// A structured error recorded on a rule's status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleError {
    pub code: RuleErrorCode,
    pub message: String,
}

impl RuleError {
    /// Missing handler for a module's system type
    pub fn missing_handler(type_id: &str, module_id: &str) -> Self {
        Self {
            code: RuleErrorCode::MissingHandler,
            message: format!("missing handler: {}, for module: {}", type_id, module_id),
        }
    }

    /// Missing handler recorded when a factory disappears; at that point the
    /// affected modules are not singled out, only the type is known
    pub fn missing_handler_type(type_id: &str) -> Self {
        Self {
            code: RuleErrorCode::MissingHandler,
            message: format!("missing handler: {}", type_id),
        }
    }

    /// Factory produced the wrong handler kind for a module
    pub fn handler_mismatch(type_id: &str, module_id: &str) -> Self {
        Self {
            code: RuleErrorCode::HandlerMismatch,
            message: format!(
                "handler for type {} does not match module kind of: {}",
                type_id, module_id
            ),
        }
    }

    /// Connection references a missing or non-source module
    pub fn broken_connection(module_id: &str, source_module_id: &str) -> Self {
        Self {
            code: RuleErrorCode::BrokenConnection,
            message: format!(
                "module {} cannot be connected to module {}: not present or not a data source",
                module_id, source_module_id
            ),
        }
    }
}

/// Snapshot of a rule's readiness and activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleStatus {
    /// All modules are bound to handlers and the rule can execute
    pub initialized: bool,

    /// Operator switch; a disabled rule ignores trigger firings
    pub enabled: bool,

    /// Whether a firing is executing at the moment of the query
    pub running: bool,

    /// Errors explaining why the rule is not initialized, plus any
    /// per-connection problems found at bind time
    #[serde(default)]
    pub errors: Vec<RuleError>,
}

impl RuleStatus {
    /// Status after a fully successful bind
    pub fn initialized(enabled: bool, errors: Vec<RuleError>) -> Self {
        Self {
            initialized: true,
            enabled,
            running: false,
            errors,
        }
    }

    /// Status for a rule that could not (or can no longer) bind
    pub fn uninitialized(enabled: bool, errors: Vec<RuleError>) -> Self {
        Self {
            initialized: false,
            enabled,
            running: false,
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_constructors() {
        let status = RuleStatus::initialized(true, Vec::new());
        assert!(status.initialized);
        assert!(status.enabled);
        assert!(!status.running);
        assert!(status.errors.is_empty());

        let errors = vec![RuleError::missing_handler("SampleTrigger", "t1")];
        let status = RuleStatus::uninitialized(false, errors.clone());
        assert!(!status.initialized);
        assert!(!status.enabled);
        assert_eq!(status.errors, errors);
    }

    #[test]
    fn test_error_codes_serialize_kebab_case() {
        let err = RuleError::missing_handler("SampleTrigger", "t1");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "missing-handler");
    }
}
