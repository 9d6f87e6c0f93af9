//! The rule engine
//!
//! Holds the rule table, per-rule statuses, the handler factory registry,
//! and the reverse index from system module type to dependent rules. Binding
//! resolves every module of a rule against the registered factories; factory
//! registration and removal re-run that resolution for exactly the affected
//! rules.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use automation_core::{
    system_type, Module, ModuleTypeError, Rule, RuleConfig, RuleError, RuleStatus,
};

use crate::callback::RuleCallback;
use crate::handler::{HandlerFactory, ModuleHandler};
use crate::lock;
use crate::runtime::RuntimeRule;

/// Errors returned directly to engine callers
///
/// Binding and connection problems are never returned here; they are
/// observable only via the rule's status.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid module type id for module {module_id}: {source}")]
    InvalidModuleType {
        module_id: String,
        #[source]
        source: ModuleTypeError,
    },

    #[error("rule engine is disposed")]
    Disposed,
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Tables serialized by the engine-wide lock
#[derive(Default)]
struct EngineState {
    /// All rules added to the engine, initialized or not
    rules: HashMap<String, Arc<Rule>>,

    /// System module type to the factory producing its handlers;
    /// the last registered factory for a type wins
    factories: HashMap<String, Arc<dyn HandlerFactory>>,

    /// System module type to the rules depending on it
    type_to_rules: HashMap<String, HashSet<String>>,
}

/// Shared engine internals
///
/// Statuses and callbacks live in concurrent maps so the firing path can
/// check them without taking the engine-wide lock; all writes to them still
/// happen under that lock.
pub(crate) struct EngineInner {
    state: Mutex<EngineState>,
    statuses: DashMap<String, RuleStatus>,
    callbacks: DashMap<String, Arc<RuleCallback>>,
    disposed: AtomicBool,
}

impl EngineInner {
    /// Enabled check used by the firing path
    pub(crate) fn rule_enabled(&self, rule_id: &str) -> bool {
        self.statuses.get(rule_id).map(|s| s.enabled).unwrap_or(false)
    }

    /// Replace a rule's status if it actually changed
    fn set_status(&self, rule_id: &str, status: RuleStatus) {
        let changed = self
            .statuses
            .get(rule_id)
            .map(|current| *current != status)
            .unwrap_or(true);
        if changed {
            self.statuses.insert(rule_id.to_string(), status);
        }
    }

    /// The enabled flag to carry into a fresh status: the operator's last
    /// choice if there is one, the rule's initial flag otherwise
    fn carried_enabled(&self, rule: &Rule) -> bool {
        self.statuses
            .get(&rule.id)
            .map(|s| s.enabled)
            .unwrap_or(rule.initial_enabled)
    }

    /// Bind (or re-bind) a rule against the current factory table
    ///
    /// Resolves handlers for conditions and actions before triggers, so a
    /// trigger is never wired on a rule that cannot execute. All missing
    /// types are reported in one pass.
    fn bind_rule(self: &Arc<Self>, state: &mut EngineState, rule: &Arc<Rule>) {
        let rule_id = rule.id.clone();

        // A replaced rule may no longer use types it was indexed under
        state.type_to_rules.retain(|_, rule_ids| {
            rule_ids.remove(&rule_id);
            !rule_ids.is_empty()
        });
        for module in rule.modules() {
            // Type ids are validated when the rule is added
            if let Ok(system) = system_type(module.type_id()) {
                state
                    .type_to_rules
                    .entry(system.to_string())
                    .or_default()
                    .insert(rule_id.clone());
            }
        }

        let mut errors: Vec<RuleError> = Vec::new();
        let mut missing_types: HashSet<String> = HashSet::new();

        let mut condition_handlers = Vec::with_capacity(rule.conditions.len());
        for condition in &rule.conditions {
            if let Some(ModuleHandler::Condition(handler)) = Self::create_handler(
                state,
                Module::Condition(condition),
                &mut errors,
                &mut missing_types,
            ) {
                condition_handlers.push(handler);
            }
        }

        let mut action_handlers = Vec::with_capacity(rule.actions.len());
        for action in &rule.actions {
            if let Some(ModuleHandler::Action(handler)) = Self::create_handler(
                state,
                Module::Action(action),
                &mut errors,
                &mut missing_types,
            ) {
                action_handlers.push(handler);
            }
        }

        let mut trigger_handlers = Vec::with_capacity(rule.triggers.len());
        for trigger in &rule.triggers {
            if let Some(ModuleHandler::Trigger(handler)) = Self::create_handler(
                state,
                Module::Trigger(trigger),
                &mut errors,
                &mut missing_types,
            ) {
                trigger_handlers.push(handler);
            }
        }

        let connection_errors = Self::check_connections(rule);

        let callback = self
            .callbacks
            .entry(rule_id.clone())
            .or_insert_with(|| RuleCallback::new(rule_id.clone(), Arc::downgrade(self)))
            .clone();
        let enabled = self.carried_enabled(rule);

        if errors.is_empty() {
            let runtime = Arc::new(RuntimeRule::new(
                rule.clone(),
                trigger_handlers,
                condition_handlers,
                action_handlers,
            ));
            if let Some(previous) = callback.swap_runtime(Some(runtime.clone())) {
                previous.detach_triggers();
            }
            runtime.attach_triggers(&callback);
            self.set_status(&rule_id, RuleStatus::initialized(enabled, connection_errors));
            debug!(rule_id = %rule_id, "Rule started");
        } else {
            if let Some(previous) = callback.swap_runtime(None) {
                previous.detach_triggers();
            }
            errors.extend(connection_errors);
            let error_count = errors.len();
            self.set_status(&rule_id, RuleStatus::uninitialized(enabled, errors));
            debug!(
                rule_id = %rule_id,
                errors = error_count,
                "Rule not initialized, waiting for missing handlers"
            );
        }
    }

    /// Resolve one module against the factory table
    ///
    /// Records one missing-handler error per unresolved system type and a
    /// mismatch error per module whose factory produced the wrong kind.
    fn create_handler(
        state: &EngineState,
        module: Module<'_>,
        errors: &mut Vec<RuleError>,
        missing_types: &mut HashSet<String>,
    ) -> Option<ModuleHandler> {
        let system = system_type(module.type_id()).ok()?;

        let record_missing =
            |errors: &mut Vec<RuleError>, missing_types: &mut HashSet<String>| {
                if missing_types.insert(system.to_string()) {
                    let err = RuleError::missing_handler(module.type_id(), module.id());
                    warn!(message = %err.message, "Binding error");
                    errors.push(err);
                }
            };

        let Some(factory) = state.factories.get(system) else {
            record_missing(errors, missing_types);
            return None;
        };

        match factory.create(module) {
            Some(handler) if handler.kind() == module.kind() => Some(handler),
            Some(handler) => {
                let err = RuleError::handler_mismatch(module.type_id(), module.id());
                warn!(
                    message = %err.message,
                    produced = %handler.kind(),
                    "Binding error"
                );
                errors.push(err);
                None
            }
            None => {
                record_missing(errors, missing_types);
                None
            }
        }
    }

    /// Validate declared connections against the rule's own modules
    fn check_connections(rule: &Rule) -> Vec<RuleError> {
        let mut errors = Vec::new();
        for module in rule.modules() {
            for conn in module.connections() {
                let is_source = rule
                    .module(&conn.source_module_id)
                    .map(|m| m.is_output_source())
                    .unwrap_or(false);
                if !is_source {
                    let err = RuleError::broken_connection(module.id(), &conn.source_module_id);
                    warn!(rule_id = %rule.id, message = %err.message, "Connection error");
                    errors.push(err);
                }
            }
        }
        errors
    }

    /// Move an initialized rule back to uninitialized, keeping its callback
    /// and the operator's enabled choice
    fn deinitialize_rule(&self, rule_id: &str, errors: Vec<RuleError>) {
        if let Some(callback) = self.callbacks.get(rule_id) {
            if let Some(runtime) = callback.swap_runtime(None) {
                runtime.detach_triggers();
            }
        }
        let enabled = self.statuses.get(rule_id).map(|s| s.enabled).unwrap_or(true);
        self.set_status(rule_id, RuleStatus::uninitialized(enabled, errors));
        debug!(rule_id = %rule_id, "Rule stopped");
    }

    /// Remove every trace of a rule: runtime, callback, status, index entries
    fn drop_rule_entry(&self, state: &mut EngineState, rule_id: &str) {
        if let Some((_, callback)) = self.callbacks.remove(rule_id) {
            if let Some(runtime) = callback.swap_runtime(None) {
                runtime.detach_triggers();
            }
        }
        self.statuses.remove(rule_id);
        state.type_to_rules.retain(|_, rule_ids| {
            rule_ids.remove(rule_id);
            !rule_ids.is_empty()
        });
    }
}

/// The rule execution engine
///
/// Thread-safe and cheap to clone via [`RuleEngine::handle`]-free sharing:
/// wrap it in an `Arc` and hand it around. Factory registration, rule
/// management, and status changes serialize on one engine-wide lock; firings
/// bypass that lock and serialize per rule only.
pub struct RuleEngine {
    inner: Arc<EngineInner>,
}

impl RuleEngine {
    /// Create an empty engine with no rules and no factories
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EngineInner {
                state: Mutex::new(EngineState::default()),
                statuses: DashMap::new(),
                callbacks: DashMap::new(),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Add a rule, or replace the rule with the same id
    ///
    /// The rule is bound immediately against the currently registered
    /// factories; if handlers are missing it stays stored and uninitialized,
    /// with the missing types recorded on its status. Returns the rule id.
    pub fn add_rule(&self, config: RuleConfig) -> EngineResult<String> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(EngineError::Disposed);
        }

        let rule = Rule::from_config(config);
        for module in rule.modules() {
            system_type(module.type_id()).map_err(|source| EngineError::InvalidModuleType {
                module_id: module.id().to_string(),
                source,
            })?;
        }

        let rule = Arc::new(rule);
        let rule_id = rule.id.clone();

        let mut state = lock(&self.inner.state);
        state.rules.insert(rule_id.clone(), rule.clone());
        self.inner.bind_rule(&mut state, &rule);
        info!(rule_id = %rule_id, name = %rule.display_name(), "Rule set");

        Ok(rule_id)
    }

    /// Remove a rule, returning its definition
    ///
    /// Leaves no residual status, callback, or reverse-index entries.
    pub fn remove_rule(&self, rule_id: &str) -> Option<Arc<Rule>> {
        let mut state = lock(&self.inner.state);
        let rule = state.rules.remove(rule_id)?;
        self.inner.drop_rule_entry(&mut state, rule_id);
        info!(rule_id = %rule_id, "Rule removed");
        Some(rule)
    }

    /// Get a rule by id
    pub fn get_rule(&self, rule_id: &str) -> Option<Arc<Rule>> {
        lock(&self.inner.state).rules.get(rule_id).cloned()
    }

    /// All rules, initialized or not
    pub fn rules(&self) -> Vec<Arc<Rule>> {
        lock(&self.inner.state).rules.values().cloned().collect()
    }

    /// Number of rules known to the engine
    pub fn rule_count(&self) -> usize {
        lock(&self.inner.state).rules.len()
    }

    /// Rules carrying the given tag
    pub fn rules_by_tag(&self, tag: &str) -> Vec<Arc<Rule>> {
        lock(&self.inner.state)
            .rules
            .values()
            .filter(|r| r.has_tag(tag))
            .cloned()
            .collect()
    }

    /// Rules carrying any of the given tags
    pub fn rules_by_tags(&self, tags: &HashSet<String>) -> Vec<Arc<Rule>> {
        lock(&self.inner.state)
            .rules
            .values()
            .filter(|r| r.tags.iter().any(|t| tags.contains(t)))
            .cloned()
            .collect()
    }

    /// Flip a rule's enabled flag; a pure status replace
    ///
    /// Does not start or stop anything by itself: the firing path checks
    /// the flag independently. Returns false for unknown rules.
    pub fn set_enabled(&self, rule_id: &str, enabled: bool) -> bool {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return false;
        }
        let _state = lock(&self.inner.state);
        let Some(current) = self.inner.statuses.get(rule_id).map(|s| s.clone()) else {
            return false;
        };
        if current.enabled != enabled {
            let mut next = current;
            next.enabled = enabled;
            self.inner.set_status(rule_id, next);
            info!(rule_id = %rule_id, enabled, "Rule enabled flag changed");
        }
        true
    }

    /// Current status of a rule, with the live running flag
    pub fn status(&self, rule_id: &str) -> Option<RuleStatus> {
        let mut status = self.inner.statuses.get(rule_id).map(|s| s.clone())?;
        status.running = self.is_running(rule_id);
        Some(status)
    }

    /// Whether a firing of the rule is executing right now
    pub fn is_running(&self, rule_id: &str) -> bool {
        self.inner
            .callbacks
            .get(rule_id)
            .map(|c| c.is_running())
            .unwrap_or(false)
    }

    /// When the rule last received a firing that passed the enabled check
    pub fn last_fired(&self, rule_id: &str) -> Option<DateTime<Utc>> {
        self.inner.callbacks.get(rule_id).and_then(|c| c.last_fired())
    }

    /// Register a handler factory for every module type it supports
    ///
    /// Rules waiting on one of those types are re-bound in the same critical
    /// section. For a type already backed by another factory the last
    /// registration wins.
    pub fn register_factory(&self, factory: Arc<dyn HandlerFactory>) {
        if self.inner.disposed.load(Ordering::SeqCst) {
            warn!("Rule engine is disposed, ignoring factory registration");
            return;
        }

        let mut state = lock(&self.inner.state);
        let mut pending: HashSet<String> = HashSet::new();

        for type_id in factory.supported_types() {
            debug!(module_type = %type_id, "Registering handler factory");
            if let Some(previous) = state.factories.insert(type_id.clone(), factory.clone()) {
                if !Arc::ptr_eq(&previous, &factory) {
                    debug!(
                        module_type = %type_id,
                        "Replaced existing handler factory, last registration wins"
                    );
                }
            }
            if let Some(rule_ids) = state.type_to_rules.get(&type_id) {
                for rule_id in rule_ids {
                    let initialized = self
                        .inner
                        .statuses
                        .get(rule_id)
                        .map(|s| s.initialized)
                        .unwrap_or(false);
                    if !initialized {
                        pending.insert(rule_id.clone());
                    }
                }
            }
        }

        for rule_id in pending {
            if let Some(rule) = state.rules.get(&rule_id).cloned() {
                self.inner.bind_rule(&mut state, &rule);
            }
        }
    }

    /// Unregister a handler factory
    ///
    /// Removes exactly the type entries still owned by this factory (a type
    /// taken over by a later registration is left alone) and de-initializes
    /// every initialized rule that depended on the removed types, recording
    /// one missing-handler error per removed type the rule uses. The rules
    /// themselves stay stored and re-bind when the types reappear.
    pub fn unregister_factory(&self, factory: &Arc<dyn HandlerFactory>) {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return;
        }

        let mut state = lock(&self.inner.state);
        let mut affected: HashMap<String, Vec<String>> = HashMap::new();

        for type_id in factory.supported_types() {
            let owned = state
                .factories
                .get(&type_id)
                .map(|current| Arc::ptr_eq(current, factory))
                .unwrap_or(false);
            if !owned {
                continue;
            }
            state.factories.remove(&type_id);
            debug!(module_type = %type_id, "Unregistered handler factory");

            if let Some(rule_ids) = state.type_to_rules.get(&type_id) {
                for rule_id in rule_ids {
                    let initialized = self
                        .inner
                        .statuses
                        .get(rule_id)
                        .map(|s| s.initialized)
                        .unwrap_or(false);
                    if initialized {
                        affected
                            .entry(rule_id.clone())
                            .or_default()
                            .push(type_id.clone());
                    }
                }
            }
        }

        for (rule_id, missing) in affected {
            let errors = missing
                .iter()
                .map(|type_id| RuleError::missing_handler_type(type_id))
                .collect();
            self.inner.deinitialize_rule(&rule_id, errors);
        }
    }

    /// Tear the engine down
    ///
    /// Idempotent and terminal: every rule is unbound and dropped together
    /// with its status and callback, the factory table is cleared, and no
    /// further rules or registrations are accepted.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut state = lock(&self.inner.state);
        let rule_ids: Vec<String> = state.rules.keys().cloned().collect();
        for rule_id in &rule_ids {
            self.inner.drop_rule_entry(&mut state, rule_id);
        }
        state.rules.clear();
        state.factories.clear();
        state.type_to_rules.clear();
        info!("Rule engine disposed");
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}
