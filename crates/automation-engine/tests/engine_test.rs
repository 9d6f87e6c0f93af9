//! End-to-end engine scenarios
//!
//! These tests drive the engine the way a provider bundle would: register a
//! handler factory for a small family of sample module types, add rules
//! wired through connections, and fire triggers by hand.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use automation_core::{system_type, Module, RuleConfig};
use automation_engine::{
    ActionHandler, ConditionHandler, HandlerError, HandlerFactory, HandlerResult, InputValues,
    ModuleHandler, OutputValues, RuleCallback, RuleEngine, TriggerHandler,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Trigger handler the test fires by hand
struct ManualTrigger {
    module_id: String,
    callback: Mutex<Option<Arc<RuleCallback>>>,
}

impl ManualTrigger {
    fn new(module_id: &str) -> Arc<Self> {
        Arc::new(Self {
            module_id: module_id.to_string(),
            callback: Mutex::new(None),
        })
    }

    fn fire(&self, outputs: OutputValues) {
        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback.triggered(&self.module_id, outputs);
        }
    }

    fn is_wired(&self) -> bool {
        self.callback.lock().unwrap().is_some()
    }
}

impl TriggerHandler for ManualTrigger {
    fn set_callback(&self, callback: Option<Arc<RuleCallback>>) {
        *self.callback.lock().unwrap() = callback;
    }
}

/// Condition: input "value" must be strictly above the configured "min"
struct AboveCondition {
    min: f64,
}

impl ConditionHandler for AboveCondition {
    fn is_satisfied(&self, inputs: &InputValues) -> HandlerResult<bool> {
        let value = inputs
            .get("value")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| HandlerError::MissingInput("value".to_string()))?;
        Ok(value > self.min)
    }
}

/// Action recording its inputs and emitting the outputs from its config
struct RecordAction {
    module_id: String,
    log: Arc<Mutex<Vec<(String, InputValues)>>>,
    outputs: OutputValues,
}

impl ActionHandler for RecordAction {
    fn execute(&self, inputs: &InputValues) -> HandlerResult<OutputValues> {
        self.log
            .lock()
            .unwrap()
            .push((self.module_id.clone(), inputs.clone()));
        Ok(self.outputs.clone())
    }
}

/// Action that always fails
struct FailAction;

impl ActionHandler for FailAction {
    fn execute(&self, _inputs: &InputValues) -> HandlerResult<OutputValues> {
        Err(HandlerError::Failed("device unreachable".to_string()))
    }
}

/// Factory for the sample module family used across these tests
///
/// Created trigger handlers are kept by module id so tests can fire them.
struct SampleFactory {
    log: Arc<Mutex<Vec<(String, InputValues)>>>,
    triggers: Mutex<HashMap<String, Arc<ManualTrigger>>>,
}

impl SampleFactory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Arc::new(Mutex::new(Vec::new())),
            triggers: Mutex::new(HashMap::new()),
        })
    }

    fn trigger(&self, module_id: &str) -> Arc<ManualTrigger> {
        self.triggers
            .lock()
            .unwrap()
            .get(module_id)
            .cloned()
            .expect("trigger handler not created yet")
    }

    fn executed(&self) -> Vec<(String, InputValues)> {
        self.log.lock().unwrap().clone()
    }
}

impl HandlerFactory for SampleFactory {
    fn supported_types(&self) -> HashSet<String> {
        ["SampleTrigger", "AboveCondition", "RecordAction", "FailAction"]
            .iter()
            .map(|t| t.to_string())
            .collect()
    }

    fn create(&self, module: Module<'_>) -> Option<ModuleHandler> {
        let system = system_type(module.type_id()).ok()?;
        match system {
            "SampleTrigger" => {
                let handler = ManualTrigger::new(module.id());
                self.triggers
                    .lock()
                    .unwrap()
                    .insert(module.id().to_string(), handler.clone());
                Some(ModuleHandler::Trigger(handler))
            }
            "AboveCondition" => {
                let min = module
                    .configuration()
                    .get("min")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0);
                Some(ModuleHandler::Condition(Arc::new(AboveCondition { min })))
            }
            "RecordAction" => {
                let outputs = module
                    .configuration()
                    .get("emit")
                    .and_then(|v| v.as_object())
                    .map(|m| m.clone().into_iter().collect())
                    .unwrap_or_default();
                Some(ModuleHandler::Action(Arc::new(RecordAction {
                    module_id: module.id().to_string(),
                    log: self.log.clone(),
                    outputs,
                })))
            }
            "FailAction" => Some(ModuleHandler::Action(Arc::new(FailAction))),
            _ => None,
        }
    }
}

/// Trigger `temp` output wired into a `> 20` condition and a recording action
fn thermostat_rule(id: &str, trigger_id: &str) -> RuleConfig {
    serde_json::from_value(json!({
        "id": id,
        "name": "Heating alert",
        "tags": ["climate"],
        "triggers": [
            {"id": trigger_id, "type": "SampleTrigger"}
        ],
        "conditions": [
            {
                "id": format!("{}-c1", id),
                "type": "AboveCondition",
                "configuration": {"min": 20},
                "connections": [{
                    "input_name": "value",
                    "source_module_id": trigger_id,
                    "source_output_name": "temp"
                }]
            }
        ],
        "actions": [
            {
                "id": format!("{}-a1", id),
                "type": "RecordAction",
                "connections": [{
                    "input_name": "temperature",
                    "source_module_id": trigger_id,
                    "source_output_name": "temp"
                }]
            }
        ]
    }))
    .unwrap()
}

fn temp_outputs(temp: i64) -> OutputValues {
    OutputValues::from([("temp".to_string(), json!(temp))])
}

#[test]
fn test_thermostat_scenario() {
    init_tracing();
    let engine = RuleEngine::new();
    let factory = SampleFactory::new();
    engine.register_factory(factory.clone());
    engine.add_rule(thermostat_rule("r1", "r1-t1")).unwrap();

    assert!(engine.status("r1").unwrap().initialized);
    let trigger = factory.trigger("r1-t1");

    trigger.fire(temp_outputs(22));
    let executed = factory.executed();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].0, "r1-a1");
    assert_eq!(executed[0].1["temperature"], json!(22));

    trigger.fire(temp_outputs(18));
    assert_eq!(factory.executed().len(), 1, "18 is not above 20");

    assert!(engine.last_fired("r1").is_some());
}

#[test]
fn test_disabled_rule_ignores_firings() {
    init_tracing();
    let engine = RuleEngine::new();
    let factory = SampleFactory::new();
    engine.register_factory(factory.clone());
    engine.add_rule(thermostat_rule("r1", "r1-t1")).unwrap();

    assert!(engine.set_enabled("r1", false));
    factory.trigger("r1-t1").fire(temp_outputs(25));

    assert!(factory.executed().is_empty());
    let status = engine.status("r1").unwrap();
    assert!(status.initialized, "disabling does not uninitialize");
    assert!(!status.enabled);

    engine.set_enabled("r1", true);
    factory.trigger("r1-t1").fire(temp_outputs(25));
    assert_eq!(factory.executed().len(), 1);
}

#[test]
fn test_empty_condition_list_always_fires() {
    init_tracing();
    let engine = RuleEngine::new();
    let factory = SampleFactory::new();
    engine.register_factory(factory.clone());

    let config: RuleConfig = serde_json::from_value(json!({
        "id": "r1",
        "triggers": [{"id": "t1", "type": "SampleTrigger"}],
        "actions": [{"id": "a1", "type": "RecordAction"}]
    }))
    .unwrap();
    engine.add_rule(config).unwrap();

    factory.trigger("t1").fire(OutputValues::new());
    assert_eq!(factory.executed().len(), 1);
}

#[test]
fn test_failing_action_aborts_remaining_actions() {
    init_tracing();
    let engine = RuleEngine::new();
    let factory = SampleFactory::new();
    engine.register_factory(factory.clone());

    let config: RuleConfig = serde_json::from_value(json!({
        "id": "r1",
        "triggers": [{"id": "t1", "type": "SampleTrigger"}],
        "actions": [
            {"id": "a1", "type": "RecordAction"},
            {"id": "a2", "type": "FailAction"},
            {"id": "a3", "type": "RecordAction"}
        ]
    }))
    .unwrap();
    engine.add_rule(config).unwrap();

    factory.trigger("t1").fire(OutputValues::new());

    let executed = factory.executed();
    assert_eq!(executed.len(), 1, "a3 must not run after a2 failed");
    assert_eq!(executed[0].0, "a1");

    // Transient per-firing failure: status untouched, next firing works
    let status = engine.status("r1").unwrap();
    assert!(status.initialized);
    assert!(status.enabled);
    assert!(status.errors.is_empty());

    factory.trigger("t1").fire(OutputValues::new());
    assert_eq!(factory.executed().len(), 2);
}

#[test]
fn test_action_outputs_flow_to_later_actions() {
    init_tracing();
    let engine = RuleEngine::new();
    let factory = SampleFactory::new();
    engine.register_factory(factory.clone());

    let config: RuleConfig = serde_json::from_value(json!({
        "id": "r1",
        "triggers": [{"id": "t1", "type": "SampleTrigger"}],
        "actions": [
            {
                "id": "a1",
                "type": "RecordAction",
                "configuration": {"emit": {"result": "stored"}}
            },
            {
                "id": "a2",
                "type": "RecordAction",
                "connections": [{
                    "input_name": "previous",
                    "source_module_id": "a1",
                    "source_output_name": "result"
                }]
            }
        ]
    }))
    .unwrap();
    engine.add_rule(config).unwrap();

    factory.trigger("t1").fire(OutputValues::new());

    let executed = factory.executed();
    assert_eq!(executed.len(), 2);
    assert_eq!(executed[1].0, "a2");
    assert_eq!(executed[1].1["previous"], json!("stored"));
}

#[test]
fn test_factory_churn_rewires_triggers() {
    init_tracing();
    let engine = RuleEngine::new();
    let factory: Arc<SampleFactory> = SampleFactory::new();
    let dyn_factory: Arc<dyn HandlerFactory> = factory.clone();

    engine.add_rule(thermostat_rule("r1", "r1-t1")).unwrap();
    assert!(!engine.status("r1").unwrap().initialized);

    engine.register_factory(dyn_factory.clone());
    let trigger = factory.trigger("r1-t1");
    assert!(trigger.is_wired());

    engine.unregister_factory(&dyn_factory);
    assert!(!trigger.is_wired(), "trigger must be detached on unregister");
    assert!(!engine.status("r1").unwrap().initialized);

    // Firing the stale handler is harmless
    trigger.fire(temp_outputs(25));
    assert!(factory.executed().is_empty());

    engine.register_factory(dyn_factory);
    assert!(engine.status("r1").unwrap().initialized);
    factory.trigger("r1-t1").fire(temp_outputs(25));
    assert_eq!(factory.executed().len(), 1);
}

#[test]
fn test_remove_rule_detaches_trigger() {
    init_tracing();
    let engine = RuleEngine::new();
    let factory = SampleFactory::new();
    engine.register_factory(factory.clone());
    engine.add_rule(thermostat_rule("r1", "r1-t1")).unwrap();

    let trigger = factory.trigger("r1-t1");
    assert!(trigger.is_wired());

    engine.remove_rule("r1").unwrap();
    assert!(!trigger.is_wired());
    trigger.fire(temp_outputs(25));
    assert!(factory.executed().is_empty());
}

#[test]
fn test_dispose_detaches_everything() {
    init_tracing();
    let engine = RuleEngine::new();
    let factory = SampleFactory::new();
    engine.register_factory(factory.clone());
    engine.add_rule(thermostat_rule("r1", "r1-t1")).unwrap();

    let trigger = factory.trigger("r1-t1");
    engine.dispose();

    assert!(!trigger.is_wired());
    trigger.fire(temp_outputs(25));
    assert!(factory.executed().is_empty());
}

/// Action blocking until the test sends a release
///
/// Signals `started` on entry, then waits on `release`; each firing consumes
/// one release message.
struct BlockAction {
    started: mpsc::Sender<()>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl ActionHandler for BlockAction {
    fn execute(&self, _inputs: &InputValues) -> HandlerResult<OutputValues> {
        self.started.send(()).ok();
        self.release.lock().unwrap().recv().ok();
        Ok(OutputValues::new())
    }
}

struct BlockFactory {
    trigger: Arc<ManualTrigger>,
    started: mpsc::Sender<()>,
    release: Mutex<Option<mpsc::Receiver<()>>>,
}

impl BlockFactory {
    fn shared(
        trigger: Arc<ManualTrigger>,
        started: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            trigger,
            started,
            release: Mutex::new(Some(release)),
        })
    }
}

impl HandlerFactory for BlockFactory {
    fn supported_types(&self) -> HashSet<String> {
        ["SampleTrigger", "BlockAction"]
            .iter()
            .map(|t| t.to_string())
            .collect()
    }

    fn create(&self, module: Module<'_>) -> Option<ModuleHandler> {
        match module.type_id() {
            "SampleTrigger" => Some(ModuleHandler::Trigger(self.trigger.clone())),
            "BlockAction" => Some(ModuleHandler::Action(Arc::new(BlockAction {
                started: self.started.clone(),
                release: Mutex::new(self.release.lock().unwrap().take()?),
            }))),
            _ => None,
        }
    }
}

fn blocking_rule(id: &str, trigger_id: &str) -> RuleConfig {
    serde_json::from_value(json!({
        "id": id,
        "triggers": [{"id": trigger_id, "type": "SampleTrigger"}],
        "actions": [{"id": format!("{}-a1", id), "type": "BlockAction"}]
    }))
    .unwrap()
}

fn fire_in_thread(trigger: &Arc<ManualTrigger>) -> std::thread::JoinHandle<()> {
    let trigger = trigger.clone();
    std::thread::spawn(move || trigger.fire(OutputValues::new()))
}

#[test]
fn test_running_flag_during_blocking_action() {
    init_tracing();
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let trigger = ManualTrigger::new("t1");

    let engine = RuleEngine::new();
    engine.register_factory(BlockFactory::shared(trigger.clone(), started_tx, release_rx));
    engine.add_rule(blocking_rule("r1", "t1")).unwrap();
    assert!(!engine.is_running("r1"));

    let firing = fire_in_thread(&trigger);

    started_rx.recv().unwrap();
    assert!(engine.is_running("r1"));
    assert!(engine.status("r1").unwrap().running);

    release_tx.send(()).unwrap();
    firing.join().unwrap();
    assert!(!engine.is_running("r1"));
}

#[test]
fn test_firings_of_one_rule_are_serialized() {
    init_tracing();
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let trigger = ManualTrigger::new("t1");

    let engine = RuleEngine::new();
    engine.register_factory(BlockFactory::shared(trigger.clone(), started_tx, release_rx));
    engine.add_rule(blocking_rule("r1", "t1")).unwrap();

    let first = fire_in_thread(&trigger);
    started_rx.recv().unwrap();

    // Second firing of the same rule must queue behind the first
    let second = fire_in_thread(&trigger);
    std::thread::sleep(Duration::from_millis(50));
    assert!(
        started_rx.try_recv().is_err(),
        "second firing ran while the first was still executing"
    );

    release_tx.send(()).unwrap();
    started_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("second firing never ran after the first completed");
    release_tx.send(()).unwrap();

    first.join().unwrap();
    second.join().unwrap();
    assert!(!engine.is_running("r1"));
}

#[test]
fn test_firings_of_different_rules_interleave() {
    init_tracing();
    let engine = RuleEngine::new();

    let (started1_tx, started1_rx) = mpsc::channel();
    let (release1_tx, release1_rx) = mpsc::channel();
    let trigger1 = ManualTrigger::new("t1");
    engine.register_factory(BlockFactory::shared(trigger1.clone(), started1_tx, release1_rx));
    engine.add_rule(blocking_rule("r1", "t1")).unwrap();

    let (started2_tx, started2_rx) = mpsc::channel();
    let (release2_tx, release2_rx) = mpsc::channel();
    let trigger2 = ManualTrigger::new("t2");
    engine.register_factory(BlockFactory::shared(trigger2.clone(), started2_tx, release2_rx));
    engine.add_rule(blocking_rule("r2", "t2")).unwrap();

    let first = fire_in_thread(&trigger1);
    started1_rx.recv().unwrap();

    // r2 must start while r1 is still blocked
    let second = fire_in_thread(&trigger2);
    started2_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("rules must not serialize against each other");
    assert!(engine.is_running("r1"));
    assert!(engine.is_running("r2"));

    release1_tx.send(()).unwrap();
    release2_tx.send(()).unwrap();
    first.join().unwrap();
    second.join().unwrap();
}

#[test]
fn test_panicking_action_aborts_only_the_firing() {
    init_tracing();

    struct PanicAction;

    impl ActionHandler for PanicAction {
        fn execute(&self, _inputs: &InputValues) -> HandlerResult<OutputValues> {
            panic!("handler blew up");
        }
    }

    struct PanicFactory {
        trigger: Arc<ManualTrigger>,
    }

    impl HandlerFactory for PanicFactory {
        fn supported_types(&self) -> HashSet<String> {
            ["SampleTrigger", "PanicAction"]
                .iter()
                .map(|t| t.to_string())
                .collect()
        }

        fn create(&self, module: Module<'_>) -> Option<ModuleHandler> {
            match module.type_id() {
                "SampleTrigger" => Some(ModuleHandler::Trigger(self.trigger.clone())),
                "PanicAction" => Some(ModuleHandler::Action(Arc::new(PanicAction))),
                _ => None,
            }
        }
    }

    let trigger = ManualTrigger::new("t1");
    let engine = RuleEngine::new();
    engine.register_factory(Arc::new(PanicFactory {
        trigger: trigger.clone(),
    }));

    let config: RuleConfig = serde_json::from_value(json!({
        "id": "r1",
        "triggers": [{"id": "t1", "type": "SampleTrigger"}],
        "actions": [{"id": "a1", "type": "PanicAction"}]
    }))
    .unwrap();
    engine.add_rule(config).unwrap();

    // The panic must not unwind out of the firing
    trigger.fire(OutputValues::new());

    assert!(!engine.is_running("r1"), "running flag must reset after a panic");
    let status = engine.status("r1").unwrap();
    assert!(status.initialized);
    assert!(status.errors.is_empty(), "a per-firing failure never touches the status");

    // The rule stays operable
    trigger.fire(OutputValues::new());
    assert!(!engine.is_running("r1"));
}
