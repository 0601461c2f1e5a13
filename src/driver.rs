//! The browser driver port: the capability set the runner consumes.
//!
//! The runner never talks CDP directly; it depends on this trait. The
//! production implementation lives in [`crate::chrome`]; tests use a
//! scripted in-memory implementation.

use crate::definition::{DialogAction, MockRuleSpec};
use crate::errors::StepError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by a browser driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Attaching to the browser or target failed.
    #[error("CDP connection failed: {0}")]
    Connect(String),

    /// A navigation did not commit.
    #[error("navigation to '{url}' failed: {reason}")]
    Navigation { url: String, reason: String },

    /// JavaScript evaluation threw or could not be serialized back.
    #[error("JavaScript evaluation failed: {0}")]
    Evaluate(String),

    /// A selector did not resolve to an element.
    #[error("element not found: {selector}")]
    ElementNotFound { selector: String },

    /// A DOM interaction (click, fill, key press, ...) failed.
    #[error("browser interaction failed: {0}")]
    Interaction(String),

    /// Screenshot capture failed.
    #[error("screenshot capture failed: {0}")]
    Screenshot(String),

    /// An operation was attempted before `connect` or after `close`.
    #[error("not connected to a browser target")]
    NotConnected,
}

impl From<DriverError> for StepError {
    fn from(err: DriverError) -> Self {
        StepError::Driver(err.to_string())
    }
}

/// A captured console message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleEntry {
    /// Console level: "log", "info", "warn", "error", "debug".
    #[serde(rename = "type")]
    pub level: String,

    pub text: String,

    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// A captured network response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkEntry {
    pub url: String,
    pub method: String,
    pub status: u16,

    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Options for attaching to a browser.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Open an isolated tab instead of reusing the current target.
    pub create_tab: bool,

    /// Logical session the tab is registered under.
    pub session_id: Option<String>,
}

/// An armed network interception rule, ready to serve.
///
/// Built from a [`MockRuleSpec`] by encoding the body once up front.
#[derive(Debug, Clone)]
pub struct MockRule {
    pub pattern: String,
    pub status: u16,
    pub body: Option<String>,
    pub content_type: String,
    pub delay_ms: u64,
}

impl MockRule {
    /// Encode a definition-level rule into servable form. Non-string
    /// bodies are JSON-encoded; string bodies pass through verbatim.
    pub fn from_spec(spec: &MockRuleSpec) -> Self {
        let body = spec.body.as_ref().map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        Self {
            pattern: spec.pattern.clone(),
            status: spec.status,
            body,
            content_type: spec
                .content_type
                .clone()
                .unwrap_or_else(|| "application/json".to_string()),
            delay_ms: spec.delay_ms.unwrap_or(0),
        }
    }

    /// True when this rule intercepts the given URL.
    pub fn matches(&self, url: &str) -> bool {
        glob_match(&self.pattern, url)
    }
}

/// Match a URL against a glob pattern (`*` any run, `?` one char).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let mut regex_src = String::with_capacity(pattern.len() + 8);
    regex_src.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => regex_src.push_str(".*"),
            '?' => regex_src.push('.'),
            c => regex_src.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex_src.push('$');

    match regex::Regex::new(&regex_src) {
        Ok(re) => re.is_match(text),
        Err(_) => false,
    }
}

/// The capability set the step runner depends on.
///
/// Implementations are expected to be cheap to construct; all I/O starts
/// at `connect`. Methods take `&self` so a single driver can be shared
/// across capture tasks; implementations keep their target state behind
/// interior mutability.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Attach to a target. When `opts.create_tab` is set, open a new
    /// isolated tab and associate it with `opts.session_id`.
    async fn connect(&self, url: &str, opts: ConnectOptions) -> Result<(), DriverError>;

    /// Commit a navigation; resolves when the page is ready.
    async fn navigate(&self, url: &str) -> Result<(), DriverError>;

    /// Run JS in the current frame and JSON-return the result.
    async fn evaluate(&self, expression: &str) -> Result<Value, DriverError>;

    async fn fill(&self, selector: &str, value: &str) -> Result<(), DriverError>;

    async fn click(&self, selector: &str) -> Result<(), DriverError>;

    async fn hover(&self, selector: &str) -> Result<(), DriverError>;

    async fn select(&self, selector: &str, value: &str) -> Result<(), DriverError>;

    async fn press_key(&self, key: &str, modifiers: &[String]) -> Result<(), DriverError>;

    /// Scope subsequent selector operations to the iframe matching
    /// `selector`; None returns to the main frame.
    async fn switch_frame(&self, selector: Option<&str>) -> Result<(), DriverError>;

    /// Arm a one-shot response for the next JavaScript dialog.
    async fn handle_dialog(
        &self,
        action: DialogAction,
        text: Option<&str>,
    ) -> Result<(), DriverError>;

    /// Capture the viewport as base64-encoded PNG.
    async fn capture_screenshot(&self) -> Result<String, DriverError>;

    async fn get_console_messages(&self) -> Result<Vec<ConsoleEntry>, DriverError>;

    async fn get_network_responses(&self) -> Result<Vec<NetworkEntry>, DriverError>;

    /// Serialized HTML of the current document.
    async fn get_dom_snapshot(&self) -> Result<String, DriverError>;

    /// Register a glob-matched interception; first armed match wins.
    async fn add_mock_rule(&self, rule: MockRule) -> Result<(), DriverError>;

    /// Detach and release the target.
    async fn close(&self) -> Result<(), DriverError>;
}
