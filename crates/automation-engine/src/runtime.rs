//! Bound runtime form of a rule
//!
//! A `RuntimeRule` is built by the binder once every module of a rule has a
//! handler. It owns the handler references, the live output holders that
//! connections read from, and the per-module connection caches. Re-binding a
//! rule builds a fresh `RuntimeRule`, which naturally resets the caches.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use tracing::{debug, error, warn};

use automation_core::{Action, Condition, Connection, Rule, Trigger};

use crate::handler::{
    ActionHandler, ConditionHandler, HandlerResult, InputValues, OutputValues, TriggerHandler,
};
use crate::{lock, RuleCallback};

/// Holder for the current output values of a trigger or action
///
/// Output references point at this holder and read whatever values were
/// stored by the most recent firing.
#[derive(Default)]
pub(crate) struct OutputHolder {
    values: Mutex<OutputValues>,
}

impl OutputHolder {
    fn set(&self, values: OutputValues) {
        *lock(&self.values) = values;
    }

    fn value(&self, name: &str) -> serde_json::Value {
        lock(&self.values)
            .get(name)
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    }
}

/// Resolved, live reference to a producing module's current output slot
pub(crate) struct OutputRef {
    source: Arc<OutputHolder>,
    output_name: String,
}

impl OutputRef {
    fn value(&self) -> serde_json::Value {
        self.source.value(&self.output_name)
    }
}

struct BoundTrigger {
    module: Trigger,
    handler: Arc<dyn TriggerHandler>,
    outputs: Arc<OutputHolder>,
}

struct BoundCondition {
    module: Condition,
    handler: Arc<dyn ConditionHandler>,
    resolved: OnceLock<HashMap<String, OutputRef>>,
}

struct BoundAction {
    module: Action,
    handler: Arc<dyn ActionHandler>,
    outputs: Arc<OutputHolder>,
    resolved: OnceLock<HashMap<String, OutputRef>>,
}

/// A rule with every module bound to its handler
pub(crate) struct RuntimeRule {
    rule: Arc<Rule>,
    triggers: Vec<BoundTrigger>,
    conditions: Vec<BoundCondition>,
    actions: Vec<BoundAction>,
}

impl RuntimeRule {
    /// Assemble from handlers in the same order as the rule's module lists
    pub(crate) fn new(
        rule: Arc<Rule>,
        trigger_handlers: Vec<Arc<dyn TriggerHandler>>,
        condition_handlers: Vec<Arc<dyn ConditionHandler>>,
        action_handlers: Vec<Arc<dyn ActionHandler>>,
    ) -> Self {
        let triggers = rule
            .triggers
            .iter()
            .cloned()
            .zip(trigger_handlers)
            .map(|(module, handler)| BoundTrigger {
                module,
                handler,
                outputs: Arc::new(OutputHolder::default()),
            })
            .collect();

        let conditions = rule
            .conditions
            .iter()
            .cloned()
            .zip(condition_handlers)
            .map(|(module, handler)| BoundCondition {
                module,
                handler,
                resolved: OnceLock::new(),
            })
            .collect();

        let actions = rule
            .actions
            .iter()
            .cloned()
            .zip(action_handlers)
            .map(|(module, handler)| BoundAction {
                module,
                handler,
                outputs: Arc::new(OutputHolder::default()),
                resolved: OnceLock::new(),
            })
            .collect();

        Self {
            rule,
            triggers,
            conditions,
            actions,
        }
    }

    /// Wire every trigger handler to the per-rule callback
    pub(crate) fn attach_triggers(&self, callback: &Arc<RuleCallback>) {
        for trigger in &self.triggers {
            trigger.handler.set_callback(Some(callback.clone()));
        }
    }

    /// Unwire every trigger handler so no further firings arrive
    pub(crate) fn detach_triggers(&self) {
        for trigger in &self.triggers {
            trigger.handler.set_callback(None);
        }
    }

    /// Run one firing: store trigger outputs, evaluate conditions, execute
    /// actions
    ///
    /// The caller serializes firings per rule; this method assumes it is the
    /// only execution of this rule in flight.
    pub(crate) fn run(&self, trigger_module_id: &str, outputs: OutputValues) {
        let rule_id = self.rule.id.as_str();

        match self
            .triggers
            .iter()
            .find(|t| t.module.id == trigger_module_id)
        {
            Some(trigger) => trigger.outputs.set(outputs),
            None => {
                warn!(
                    rule_id = %rule_id,
                    trigger_id = %trigger_module_id,
                    "Firing from unknown trigger module, dropping"
                );
                return;
            }
        }

        match self.conditions_satisfied() {
            Ok(false) => {
                debug!(rule_id = %rule_id, "Conditions not satisfied, skipping actions");
            }
            Ok(true) => match self.execute_actions() {
                Ok(()) => debug!(rule_id = %rule_id, "Rule executed"),
                Err(e) => {
                    error!(rule_id = %rule_id, error = %e, "Action execution failed, aborting firing");
                }
            },
            Err(e) => {
                error!(rule_id = %rule_id, error = %e, "Condition evaluation failed, aborting firing");
            }
        }
    }

    /// Short-circuit AND over all conditions; an empty list is satisfied
    fn conditions_satisfied(&self) -> HandlerResult<bool> {
        for condition in &self.conditions {
            let resolved = condition
                .resolved
                .get_or_init(|| self.resolve_connections(&condition.module.id, &condition.module.connections));
            let inputs = input_values(resolved);
            if !condition.handler.is_satisfied(&inputs)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Execute actions in declaration order, propagating each action's
    /// outputs to its holder so later actions can read them
    fn execute_actions(&self) -> HandlerResult<()> {
        for action in &self.actions {
            let resolved = action
                .resolved
                .get_or_init(|| self.resolve_connections(&action.module.id, &action.module.connections));
            let inputs = input_values(resolved);
            let outputs = action.handler.execute(&inputs)?;
            action.outputs.set(outputs);
        }
        Ok(())
    }

    /// Resolve declared connections into live output references
    ///
    /// A connection whose source is missing or not output-producing is
    /// logged and skipped; the rest of the module's inputs stay usable.
    fn resolve_connections(
        &self,
        module_id: &str,
        connections: &[Connection],
    ) -> HashMap<String, OutputRef> {
        let mut resolved = HashMap::with_capacity(connections.len());
        for conn in connections {
            match self.source_holder(&conn.source_module_id) {
                Some(source) => {
                    resolved.insert(
                        conn.input_name.clone(),
                        OutputRef {
                            source,
                            output_name: conn.source_output_name.clone(),
                        },
                    );
                }
                None => {
                    warn!(
                        rule_id = %self.rule.id,
                        module_id = %module_id,
                        source_module_id = %conn.source_module_id,
                        "Connection source is not available or not a data source, skipping"
                    );
                }
            }
        }
        resolved
    }

    /// Output holder of the named trigger or action, if any
    fn source_holder(&self, module_id: &str) -> Option<Arc<OutputHolder>> {
        if let Some(t) = self.triggers.iter().find(|t| t.module.id == module_id) {
            return Some(t.outputs.clone());
        }
        if let Some(a) = self.actions.iter().find(|a| a.module.id == module_id) {
            return Some(a.outputs.clone());
        }
        None
    }
}

/// Snapshot the current value behind each resolved input
fn input_values(resolved: &HashMap<String, OutputRef>) -> InputValues {
    resolved
        .iter()
        .map(|(name, output_ref)| (name.clone(), output_ref.value()))
        .collect()
}
