//! Test definition data model.
//!
//! This module provides the core data structures for declaratively
//! describing a browser test: the test definition (url, env, inputs,
//! before/steps/after hooks, timeout, page verification) and the step,
//! a tagged variant discriminated by which operation field is present.
//!
//! Definitions load from YAML or JSON via serde; field names on the wire
//! are camelCase except the step operation names themselves, which are
//! snake_case (`wait_for`, `click_text`, ...).

use crate::variables::VarEnv;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Default total wall-clock budget for one test execution (ms).
pub const DEFAULT_TEST_TIMEOUT_MS: u64 = 30_000;

/// Default polling interval for `assert` retries (ms).
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 100;

/// Default retry window for `assert` (ms).
pub const DEFAULT_RETRY_TIMEOUT_MS: u64 = 5_000;

/// Default timeout for the `wait_for` family and page verification (ms).
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 5_000;

/// A declarative browser test: initial page, static env, runtime inputs,
/// setup/main/cleanup step sequences and execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestDefinition {
    /// Initial page to load.
    pub url: String,

    /// Static lookup for `$env.KEY` interpolation.
    #[serde(default)]
    pub env: HashMap<String, Value>,

    /// Parameters seeded into variables before step 1.
    #[serde(default)]
    pub inputs: Vec<InputSpec>,

    /// Setup steps; executed in three ordered phases around navigation.
    #[serde(default)]
    pub before: Vec<Step>,

    /// Main body.
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Cleanup steps; always run, on every exit path.
    #[serde(default)]
    pub after: Vec<Step>,

    /// Total wall-clock budget in milliseconds.
    #[serde(default = "default_test_timeout")]
    pub timeout: u64,

    /// Skip ahead to this 0-based main-step index.
    #[serde(rename = "resumeFrom", default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<i64>,

    /// Precondition checked after the initial navigation.
    #[serde(rename = "verifyPage", default, skip_serializing_if = "Option::is_none")]
    pub verify_page: Option<VerifyPage>,
}

fn default_test_timeout() -> u64 {
    DEFAULT_TEST_TIMEOUT_MS
}

impl TestDefinition {
    /// Structural validation applied at load time.
    ///
    /// Step-level problems (missing companion fields, loop shape) are
    /// deliberately left to execution time, where they surface as step
    /// failures with the step index attached.
    pub fn validate(&self) -> Result<(), String> {
        if self.url.trim().is_empty() {
            return Err("Test definition requires a non-empty url".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for input in &self.inputs {
            if !crate::variables::is_valid_name(&input.name) {
                return Err(format!(
                    "Input name '{}' is not a valid variable name",
                    input.name
                ));
            }
            if !seen.insert(input.name.clone()) {
                return Err(format!("Duplicate input name '{}'", input.name));
            }
        }

        Ok(())
    }
}

/// A runtime parameter declared on a test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    /// Variable name the value is seeded under.
    pub name: String,

    /// Human-facing label shown by front-ends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Expected value type.
    #[serde(rename = "type", default)]
    pub input_type: InputType,

    /// Value used when the caller provides none.
    #[serde(rename = "default", default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,

    /// Whether the caller must provide a value (or a default must exist).
    #[serde(default)]
    pub required: bool,
}

/// Accepted input value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    #[default]
    Text,
    Number,
    Boolean,
}

/// Post-navigation page precondition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyPage {
    /// CSS selector that must be present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,

    /// Substring the document title must contain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Substring the page URL must contain.
    #[serde(rename = "urlContains", default, skip_serializing_if = "Option::is_none")]
    pub url_contains: Option<String>,

    /// Polling window in milliseconds.
    #[serde(default = "default_wait_timeout")]
    pub timeout: u64,
}

fn default_wait_timeout() -> u64 {
    DEFAULT_WAIT_TIMEOUT_MS
}

/// Retry window for `assert`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetrySpec {
    /// Polling interval (ms).
    #[serde(default = "default_retry_interval")]
    pub interval: u64,

    /// Total window (ms).
    #[serde(default = "default_retry_timeout")]
    pub timeout: u64,
}

fn default_retry_interval() -> u64 {
    DEFAULT_RETRY_INTERVAL_MS
}

fn default_retry_timeout() -> u64 {
    DEFAULT_RETRY_TIMEOUT_MS
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RETRY_INTERVAL_MS,
            timeout: DEFAULT_RETRY_TIMEOUT_MS,
        }
    }
}

/// Text matching mode for `wait_for_text` / `wait_for_text_gone` /
/// `assert_text`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TextMatch {
    #[default]
    Contains,
    Exact,
    Regex,
}

/// What to do with a JavaScript dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialogAction {
    Accept,
    Dismiss,
}

/// `handle_dialog` arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogSpec {
    pub action: DialogAction,

    /// Prompt text supplied when accepting a `prompt()` dialog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Console scan configuration for `console_check`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConsoleCheckSpec {
    /// Console levels that fail the step when observed. Empty means
    /// the default of `["error"]`.
    #[serde(rename = "failOn", default)]
    pub fail_on: Vec<String>,

    /// Only messages matching this substring are considered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// Network scan configuration for `network_check`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NetworkCheckSpec {
    /// Glob restricting which URLs are inspected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// 4xx/5xx statuses that are tolerated anyway.
    #[serde(rename = "allowStatuses", default)]
    pub allow_statuses: Vec<u16>,
}

/// A network interception rule armed by `mock_network`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockRuleSpec {
    /// Glob matched against request URLs; first armed match wins.
    pub pattern: String,

    /// Status of the synthetic response.
    #[serde(default = "default_mock_status")]
    pub status: u16,

    /// Response body. Non-string values are JSON-encoded and served as
    /// `application/json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,

    /// Artificial response delay (ms).
    #[serde(rename = "delayMs", default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,

    /// Overrides the inferred content type.
    #[serde(rename = "contentType", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

fn default_mock_status() -> u16 {
    200
}

/// `http_request` arguments: a server-side request executed by the
/// director process itself, not the browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequestSpec {
    pub url: String,

    #[serde(default = "default_http_method")]
    pub method: String,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request body. Object/array values are sent as JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,

    /// Variable name the response is stored under.
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub store_as: Option<String>,
}

fn default_http_method() -> String {
    "GET".to_string()
}

/// `loop` arguments: iterate body steps over an array or while a
/// condition holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopSpec {
    /// JS expression producing an array, evaluated once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub over: Option<String>,

    /// JS expression re-evaluated before each iteration. Requires `max`.
    #[serde(rename = "while", default, skip_serializing_if = "Option::is_none")]
    pub while_expr: Option<String>,

    /// Iteration bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u64>,

    /// Variable receiving the current element (`over` loops).
    #[serde(rename = "as", default = "default_loop_item")]
    pub item_as: String,

    /// Variable receiving the current index.
    #[serde(rename = "indexAs", default = "default_loop_index")]
    pub index_as: String,

    /// Body steps.
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn default_loop_item() -> String {
    "item".to_string()
}

fn default_loop_index() -> String {
    "index".to_string()
}

/// One unit of test work.
///
/// The step is a tagged variant represented as a single struct with
/// optional operation fields; exactly one operation field is expected to
/// be present, and [`Step::kind`] resolves the discriminant. Unknown or
/// absent operations surface as an "unknown step type" failure at
/// dispatch, never at parse time.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Step {
    // ── Common modifiers ──────────────────────────────────────────────
    /// Human-facing step label used in events and error messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// JS expression gating execution; falsy means skip.
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Variable name the step's produced value is stored under.
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub store_as: Option<String>,

    /// Capture a DOM snapshot after the step executes.
    #[serde(rename = "captureDom", default, skip_serializing_if = "is_false")]
    pub capture_dom: bool,

    // ── Operations (exactly one is expected) ──────────────────────────
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub click: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assert: Option<String>,

    /// Sleep for this many milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for_text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for_text_gone: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assert_text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub click_text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub click_nth: Option<String>,

    /// Type text into the focused element (or `selector` when given).
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub press_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hover: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_to: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clear_input: Option<String>,

    /// Enumerate form controls under this scope selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_input: Option<String>,

    /// Selector → value map filled in one step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_form: Option<HashMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_check: Option<ConsoleCheckSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_check: Option<NetworkCheckSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock_network: Option<MockRuleSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_request: Option<HttpRequestSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<bool>,

    /// Scope subsequent selector operations to this iframe; empty
    /// string or "top" returns to the main frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub switch_frame: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle_dialog: Option<DialogSpec>,

    /// Selector of the control that dismisses a modal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_modal: Option<String>,

    /// Select a dropdown option by its visible label (companion field
    /// `option`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choose_dropdown: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expand_menu: Option<String>,

    /// Toggle (or force via `state`) a checkbox/switch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toggle: Option<String>,

    #[serde(rename = "loop", default, skip_serializing_if = "Option::is_none")]
    pub loop_spec: Option<LoopSpec>,

    /// Run another saved test's main steps inline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_test: Option<String>,

    // ── Companion fields ──────────────────────────────────────────────
    /// Value for fill/select/type operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Scope selector for text operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,

    /// Retry window for `assert`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,

    /// Timeout override for the wait family (ms).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Match mode for text operations.
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub match_mode: Option<TextMatch>,

    /// Element index for `click_nth`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,

    /// Modifier keys for `press_key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modifiers: Option<Vec<String>>,

    /// Target state for `toggle`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<bool>,

    /// Visible option label for `choose_dropdown`.
    #[serde(rename = "option", default, skip_serializing_if = "Option::is_none")]
    pub option_label: Option<String>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Discriminant resolved from which operation field a step carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Eval,
    Fill,
    Click,
    Assert,
    Wait,
    WaitFor,
    WaitForText,
    WaitForTextGone,
    AssertText,
    ClickText,
    ClickNth,
    Type,
    Select,
    PressKey,
    Hover,
    ScrollTo,
    ClearInput,
    ScanInput,
    FillForm,
    ConsoleCheck,
    NetworkCheck,
    MockNetwork,
    HttpRequest,
    Screenshot,
    SwitchFrame,
    HandleDialog,
    CloseModal,
    ChooseDropdown,
    ExpandMenu,
    Toggle,
    Loop,
    RunTest,
}

impl StepKind {
    /// The operation name as written in test files.
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Eval => "eval",
            StepKind::Fill => "fill",
            StepKind::Click => "click",
            StepKind::Assert => "assert",
            StepKind::Wait => "wait",
            StepKind::WaitFor => "wait_for",
            StepKind::WaitForText => "wait_for_text",
            StepKind::WaitForTextGone => "wait_for_text_gone",
            StepKind::AssertText => "assert_text",
            StepKind::ClickText => "click_text",
            StepKind::ClickNth => "click_nth",
            StepKind::Type => "type",
            StepKind::Select => "select",
            StepKind::PressKey => "press_key",
            StepKind::Hover => "hover",
            StepKind::ScrollTo => "scroll_to",
            StepKind::ClearInput => "clear_input",
            StepKind::ScanInput => "scan_input",
            StepKind::FillForm => "fill_form",
            StepKind::ConsoleCheck => "console_check",
            StepKind::NetworkCheck => "network_check",
            StepKind::MockNetwork => "mock_network",
            StepKind::HttpRequest => "http_request",
            StepKind::Screenshot => "screenshot",
            StepKind::SwitchFrame => "switch_frame",
            StepKind::HandleDialog => "handle_dialog",
            StepKind::CloseModal => "close_modal",
            StepKind::ChooseDropdown => "choose_dropdown",
            StepKind::ExpandMenu => "expand_menu",
            StepKind::Toggle => "toggle",
            StepKind::Loop => "loop",
            StepKind::RunTest => "run_test",
        }
    }
}

impl Step {
    /// Resolve which operation this step carries, or None when no
    /// recognized operation field is present.
    pub fn kind(&self) -> Option<StepKind> {
        if self.eval.is_some() {
            Some(StepKind::Eval)
        } else if self.fill.is_some() {
            Some(StepKind::Fill)
        } else if self.click.is_some() {
            Some(StepKind::Click)
        } else if self.assert.is_some() {
            Some(StepKind::Assert)
        } else if self.wait.is_some() {
            Some(StepKind::Wait)
        } else if self.wait_for.is_some() {
            Some(StepKind::WaitFor)
        } else if self.wait_for_text.is_some() {
            Some(StepKind::WaitForText)
        } else if self.wait_for_text_gone.is_some() {
            Some(StepKind::WaitForTextGone)
        } else if self.assert_text.is_some() {
            Some(StepKind::AssertText)
        } else if self.click_text.is_some() {
            Some(StepKind::ClickText)
        } else if self.click_nth.is_some() {
            Some(StepKind::ClickNth)
        } else if self.type_text.is_some() {
            Some(StepKind::Type)
        } else if self.select.is_some() {
            Some(StepKind::Select)
        } else if self.press_key.is_some() {
            Some(StepKind::PressKey)
        } else if self.hover.is_some() {
            Some(StepKind::Hover)
        } else if self.scroll_to.is_some() {
            Some(StepKind::ScrollTo)
        } else if self.clear_input.is_some() {
            Some(StepKind::ClearInput)
        } else if self.scan_input.is_some() {
            Some(StepKind::ScanInput)
        } else if self.fill_form.is_some() {
            Some(StepKind::FillForm)
        } else if self.console_check.is_some() {
            Some(StepKind::ConsoleCheck)
        } else if self.network_check.is_some() {
            Some(StepKind::NetworkCheck)
        } else if self.mock_network.is_some() {
            Some(StepKind::MockNetwork)
        } else if self.http_request.is_some() {
            Some(StepKind::HttpRequest)
        } else if self.screenshot.is_some() {
            Some(StepKind::Screenshot)
        } else if self.switch_frame.is_some() {
            Some(StepKind::SwitchFrame)
        } else if self.handle_dialog.is_some() {
            Some(StepKind::HandleDialog)
        } else if self.close_modal.is_some() {
            Some(StepKind::CloseModal)
        } else if self.choose_dropdown.is_some() {
            Some(StepKind::ChooseDropdown)
        } else if self.expand_menu.is_some() {
            Some(StepKind::ExpandMenu)
        } else if self.toggle.is_some() {
            Some(StepKind::Toggle)
        } else if self.loop_spec.is_some() {
            Some(StepKind::Loop)
        } else if self.run_test.is_some() {
            Some(StepKind::RunTest)
        } else {
            None
        }
    }

    /// Label shown in events and error messages: the explicit label when
    /// present, otherwise the operation name.
    pub fn display_label(&self) -> String {
        if let Some(label) = &self.label {
            return label.clone();
        }
        match self.kind() {
            Some(kind) => kind.name().to_string(),
            None => "unknown".to_string(),
        }
    }

    /// Produce a copy of this step with every string-valued field
    /// interpolated against the current variable environment.
    ///
    /// Loop body steps are NOT interpolated here: each body step is
    /// interpolated immediately before it executes, so side effects of
    /// earlier iterations stay visible. `loop.while` is interpolated
    /// again before every iteration by the loop handler.
    pub fn interpolated(&self, env: &VarEnv) -> Step {
        let mut step = self.clone();

        let interp = |value: &mut Option<String>| {
            if let Some(text) = value.as_ref() {
                *value = Some(env.interpolate(text));
            }
        };

        interp(&mut step.label);
        interp(&mut step.condition);
        interp(&mut step.eval);
        interp(&mut step.fill);
        interp(&mut step.click);
        interp(&mut step.assert);
        interp(&mut step.wait_for);
        interp(&mut step.wait_for_text);
        interp(&mut step.wait_for_text_gone);
        interp(&mut step.assert_text);
        interp(&mut step.click_text);
        interp(&mut step.click_nth);
        interp(&mut step.type_text);
        interp(&mut step.select);
        interp(&mut step.press_key);
        interp(&mut step.hover);
        interp(&mut step.scroll_to);
        interp(&mut step.clear_input);
        interp(&mut step.scan_input);
        interp(&mut step.switch_frame);
        interp(&mut step.close_modal);
        interp(&mut step.choose_dropdown);
        interp(&mut step.expand_menu);
        interp(&mut step.toggle);
        interp(&mut step.run_test);
        interp(&mut step.value);
        interp(&mut step.selector);
        interp(&mut step.option_label);

        if let Some(fields) = step.fill_form.take() {
            step.fill_form = Some(
                fields
                    .into_iter()
                    .map(|(k, v)| (env.interpolate(&k), env.interpolate(&v)))
                    .collect(),
            );
        }

        if let Some(check) = step.console_check.as_mut() {
            if let Some(pattern) = check.pattern.as_ref() {
                check.pattern = Some(env.interpolate(pattern));
            }
        }

        if let Some(check) = step.network_check.as_mut() {
            if let Some(pattern) = check.pattern.as_ref() {
                check.pattern = Some(env.interpolate(pattern));
            }
        }

        if let Some(mock) = step.mock_network.as_mut() {
            mock.pattern = env.interpolate(&mock.pattern);
            if let Some(body) = mock.body.take() {
                mock.body = Some(env.interpolate_value(body));
            }
        }

        if let Some(req) = step.http_request.as_mut() {
            req.url = env.interpolate(&req.url);
            req.method = env.interpolate(&req.method);
            req.headers = std::mem::take(&mut req.headers)
                .into_iter()
                .map(|(k, v)| (k, env.interpolate(&v)))
                .collect();
            if let Some(body) = req.body.take() {
                req.body = Some(env.interpolate_value(body));
            }
        }

        if let Some(dialog) = step.handle_dialog.as_mut() {
            if let Some(text) = dialog.text.as_ref() {
                dialog.text = Some(env.interpolate(text));
            }
        }

        if let Some(spec) = step.loop_spec.as_mut() {
            if let Some(over) = spec.over.as_ref() {
                spec.over = Some(env.interpolate(over));
            }
            // while_expr intentionally left raw; see doc comment.
        }

        step
    }
}
