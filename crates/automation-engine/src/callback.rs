//! Per-rule trigger callback
//!
//! Exactly one callback exists per rule known to the engine. It is handed to
//! every trigger handler of the rule on binding and survives
//! uninitialize/reinitialize cycles; only rule removal (or engine disposal)
//! drops it. Firings run on the invoking handler's thread of control and are
//! serialized per rule, so a hung handler stalls only its own rule.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use crate::engine::EngineInner;
use crate::handler::OutputValues;
use crate::lock;
use crate::runtime::RuntimeRule;

/// Callback a trigger handler invokes when it decides to fire
pub struct RuleCallback {
    rule_id: String,
    engine: Weak<EngineInner>,

    /// Current bound runtime; `None` while the rule is uninitialized
    runtime: Mutex<Option<Arc<RuntimeRule>>>,

    /// Serializes firings of this rule
    run_lock: Mutex<()>,

    running: AtomicBool,
    last_fired: Mutex<Option<DateTime<Utc>>>,
}

impl RuleCallback {
    pub(crate) fn new(rule_id: String, engine: Weak<EngineInner>) -> Arc<Self> {
        Arc::new(Self {
            rule_id,
            engine,
            runtime: Mutex::new(None),
            run_lock: Mutex::new(()),
            running: AtomicBool::new(false),
            last_fired: Mutex::new(None),
        })
    }

    /// Id of the rule this callback belongs to
    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }

    /// Deliver a firing from the named trigger module
    ///
    /// Drops the firing silently when the rule is gone, disabled, or
    /// currently unbound; otherwise runs conditions and actions on the
    /// caller's thread, serialized against other firings of the same rule.
    pub fn triggered(&self, trigger_module_id: &str, outputs: OutputValues) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        if !engine.rule_enabled(&self.rule_id) {
            debug!(
                rule_id = %self.rule_id,
                "Rule does not exist or is not enabled, dropping firing"
            );
            return;
        }

        let runtime = lock(&self.runtime).clone();
        let Some(runtime) = runtime else {
            debug!(rule_id = %self.rule_id, "Rule is not bound, dropping firing");
            return;
        };

        let _firing = lock(&self.run_lock);
        self.running.store(true, Ordering::SeqCst);
        *lock(&self.last_fired) = Some(Utc::now());

        // A panicking handler must not escape the engine or wedge the
        // running flag; it aborts this firing only.
        let result = catch_unwind(AssertUnwindSafe(|| runtime.run(trigger_module_id, outputs)));
        self.running.store(false, Ordering::SeqCst);
        if result.is_err() {
            error!(
                rule_id = %self.rule_id,
                trigger_id = %trigger_module_id,
                "Handler panicked during firing, aborting"
            );
        }
    }

    /// Swap the bound runtime, returning the previous one
    pub(crate) fn swap_runtime(&self, runtime: Option<Arc<RuntimeRule>>) -> Option<Arc<RuntimeRule>> {
        std::mem::replace(&mut *lock(&self.runtime), runtime)
    }

    /// Whether a firing of this rule is executing right now
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// When the rule last received a firing that passed the enabled check
    pub(crate) fn last_fired(&self) -> Option<DateTime<Utc>> {
        *lock(&self.last_fired)
    }
}
