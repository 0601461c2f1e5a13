//! Shared test support: a scripted in-memory browser driver.
//!
//! `MockDriver` records every driver call, serves scripted evaluation
//! results, and can be told to fail specific operations (optionally only
//! on the n-th occurrence). All drivers built from one `MockState` share
//! their recording, which lets suite tests observe concurrency across
//! per-test driver instances.

// Each test binary uses a different slice of this module.
#![allow(dead_code)]

use async_trait::async_trait;
use cdp_director::definition::DialogAction;
use cdp_director::driver::{
    BrowserDriver, ConnectOptions, ConsoleEntry, DriverError, MockRule, NetworkEntry,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct MockState {
    /// Every driver call, in order, as "op:detail" strings.
    pub calls: Mutex<Vec<String>>,

    /// Scripted evaluation results, exact script text → value.
    pub evals: Mutex<HashMap<String, Value>>,

    /// Unscripted evaluations error out when strict; otherwise they
    /// return `true`.
    pub strict: AtomicUsize,

    /// Operation key → occurrence (1-based) that fails. Occurrence 0
    /// fails every time.
    pub failures: Mutex<HashMap<String, usize>>,

    /// Per-key call counters backing occurrence-based failures.
    counters: Mutex<HashMap<String, usize>>,

    pub console: Mutex<Vec<ConsoleEntry>>,
    pub network: Mutex<Vec<NetworkEntry>>,
    pub mock_rules: Mutex<Vec<MockRule>>,

    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl MockState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub fn script(&self, expression: &str, value: Value) {
        self.evals
            .lock()
            .unwrap()
            .insert(expression.to_string(), value);
    }

    pub fn set_strict(&self) {
        self.strict.store(1, Ordering::SeqCst);
    }

    /// Fail every invocation of the given operation key.
    pub fn fail(&self, key: &str) {
        self.failures.lock().unwrap().insert(key.to_string(), 0);
    }

    /// Fail only the n-th (1-based) invocation of the operation key.
    pub fn fail_on_occurrence(&self, key: &str, occurrence: usize) {
        self.failures
            .lock()
            .unwrap()
            .insert(key.to_string(), occurrence);
    }

    fn record(&self, key: String) -> Result<(), DriverError> {
        self.calls.lock().unwrap().push(key.clone());

        let count = {
            let mut counters = self.counters.lock().unwrap();
            let counter = counters.entry(key.clone()).or_insert(0);
            *counter += 1;
            *counter
        };

        if let Some(occurrence) = self.failures.lock().unwrap().get(&key) {
            if *occurrence == 0 || *occurrence == count {
                return Err(DriverError::Interaction(format!(
                    "scripted failure for {key}"
                )));
            }
        }
        Ok(())
    }
}

/// A scripted driver; cheap to construct, shares its state.
pub struct MockDriver {
    pub state: Arc<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            state: MockState::new(),
        }
    }

    pub fn with_state(state: Arc<MockState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl BrowserDriver for MockDriver {
    async fn connect(&self, url: &str, opts: ConnectOptions) -> Result<(), DriverError> {
        let active = self.state.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_active.fetch_max(active, Ordering::SeqCst);
        self.state.record(format!(
            "connect:{url}:tab={}:session={}",
            opts.create_tab,
            opts.session_id.as_deref().unwrap_or("-")
        ))
    }

    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        self.state.record(format!("navigate:{url}"))
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, DriverError> {
        self.state.record(format!("evaluate:{expression}"))?;
        if let Some(value) = self.state.evals.lock().unwrap().get(expression) {
            return Ok(value.clone());
        }
        if self.state.strict.load(Ordering::SeqCst) != 0 {
            return Err(DriverError::Evaluate(format!(
                "unscripted expression: {expression}"
            )));
        }
        Ok(Value::Bool(true))
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), DriverError> {
        self.state.record(format!("fill:{selector}={value}"))
    }

    async fn click(&self, selector: &str) -> Result<(), DriverError> {
        self.state.record(format!("click:{selector}"))
    }

    async fn hover(&self, selector: &str) -> Result<(), DriverError> {
        self.state.record(format!("hover:{selector}"))
    }

    async fn select(&self, selector: &str, value: &str) -> Result<(), DriverError> {
        self.state.record(format!("select:{selector}={value}"))
    }

    async fn press_key(&self, key: &str, modifiers: &[String]) -> Result<(), DriverError> {
        self.state
            .record(format!("press_key:{key}+{}", modifiers.join(",")))
    }

    async fn switch_frame(&self, selector: Option<&str>) -> Result<(), DriverError> {
        self.state
            .record(format!("switch_frame:{}", selector.unwrap_or("top")))
    }

    async fn handle_dialog(
        &self,
        action: DialogAction,
        text: Option<&str>,
    ) -> Result<(), DriverError> {
        self.state.record(format!(
            "handle_dialog:{action:?}:{}",
            text.unwrap_or_default()
        ))
    }

    async fn capture_screenshot(&self) -> Result<String, DriverError> {
        self.state.record("screenshot:".to_string())?;
        Ok("iVBORw0KGgo=".to_string())
    }

    async fn get_console_messages(&self) -> Result<Vec<ConsoleEntry>, DriverError> {
        self.state.record("console_messages:".to_string())?;
        Ok(self.state.console.lock().unwrap().clone())
    }

    async fn get_network_responses(&self) -> Result<Vec<NetworkEntry>, DriverError> {
        self.state.record("network_responses:".to_string())?;
        Ok(self.state.network.lock().unwrap().clone())
    }

    async fn get_dom_snapshot(&self) -> Result<String, DriverError> {
        self.state.record("dom_snapshot:".to_string())?;
        Ok("<html><body>mock</body></html>".to_string())
    }

    async fn add_mock_rule(&self, rule: MockRule) -> Result<(), DriverError> {
        self.state.record(format!("add_mock_rule:{}", rule.pattern))?;
        self.state.mock_rules.lock().unwrap().push(rule);
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.state.active.fetch_sub(1, Ordering::SeqCst);
        self.state.record("close:".to_string())
    }
}

/// Parse a YAML test definition, panicking on malformed test input.
pub fn definition(yaml: &str) -> cdp_director::TestDefinition {
    serde_yaml::from_str(yaml).expect("test definition should parse")
}
