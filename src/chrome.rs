//! Chrome DevTools Protocol driver over chromiumoxide.
//!
//! Attaches to an already-running Chrome (by HTTP debug endpoint or
//! websocket URL), optionally opening an isolated tab per session.
//! Console messages and network responses are captured by background
//! event-listener tasks; mock rules are served through the CDP Fetch
//! domain with first-armed-match resolution.
//!
//! Selector-based primitives are implemented as page JavaScript with
//! JSON-encoded arguments. When a frame is active (`switch_frame`),
//! scripts are rebound to the frame's document, which works for
//! same-origin frames; cross-origin frames are out of reach by design.

use crate::definition::DialogAction;
use crate::driver::{
    BrowserDriver, ConnectOptions, ConsoleEntry, DriverError, MockRule, NetworkEntry,
};
use crate::session::SessionManager;
use async_trait::async_trait;
use base64::Engine;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::fetch::{
    self, ContinueRequestParams, EventRequestPaused, FulfillRequestParams, HeaderEntry,
    RequestPattern,
};
use chromiumoxide::cdp::browser_protocol::network::{
    self, EventRequestWillBeSent, EventResponseReceived, RequestId,
};
use chromiumoxide::cdp::browser_protocol::page::{
    EventJavascriptDialogOpening, HandleJavaScriptDialogParams,
};
use chromiumoxide::cdp::js_protocol::runtime::{ConsoleApiCalledType, EventConsoleApiCalled};
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const NAVIGATION_POLL: Duration = Duration::from_millis(100);
const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);

fn js_str(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string())
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

struct ChromeState {
    _browser: Browser,
    page: Arc<Page>,
    session_id: Option<String>,
    tasks: Vec<JoinHandle<()>>,
}

/// Production [`BrowserDriver`] backed by chromiumoxide.
pub struct ChromeDriver {
    sessions: Option<Arc<SessionManager>>,
    state: tokio::sync::Mutex<Option<ChromeState>>,
    console: Arc<Mutex<Vec<ConsoleEntry>>>,
    network: Arc<Mutex<Vec<NetworkEntry>>>,
    mock_rules: Arc<Mutex<Vec<MockRule>>>,
    pending_dialog: Arc<Mutex<Option<(DialogAction, Option<String>)>>>,
    frame_selector: Mutex<Option<String>>,
}

impl ChromeDriver {
    /// A driver that registers its tab with the given session registry.
    pub fn new(sessions: Option<Arc<SessionManager>>) -> Self {
        Self {
            sessions,
            state: tokio::sync::Mutex::new(None),
            console: Arc::new(Mutex::new(Vec::new())),
            network: Arc::new(Mutex::new(Vec::new())),
            mock_rules: Arc::new(Mutex::new(Vec::new())),
            pending_dialog: Arc::new(Mutex::new(None)),
            frame_selector: Mutex::new(None),
        }
    }

    async fn page(&self) -> Result<Arc<Page>, DriverError> {
        let state = self.state.lock().await;
        state
            .as_ref()
            .map(|s| s.page.clone())
            .ok_or(DriverError::NotConnected)
    }

    /// Resolve the endpoint into a websocket debugger URL. HTTP
    /// endpoints are asked for `/json/version`.
    async fn resolve_ws_url(url: &str) -> Result<String, DriverError> {
        if url.starts_with("ws://") || url.starts_with("wss://") {
            return Ok(url.to_string());
        }

        let version_url = format!("{}/json/version", url.trim_end_matches('/'));
        let info: Value = reqwest::get(&version_url)
            .await
            .map_err(|err| DriverError::Connect(format!("{version_url}: {err}")))?
            .json()
            .await
            .map_err(|err| DriverError::Connect(format!("{version_url}: {err}")))?;

        info.get("webSocketDebuggerUrl")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                DriverError::Connect(format!(
                    "{version_url} returned no webSocketDebuggerUrl"
                ))
            })
    }

    /// Spawn the capture tasks for one page: console, network and
    /// dialog handling.
    async fn spawn_capture_tasks(
        &self,
        page: &Arc<Page>,
    ) -> Result<Vec<JoinHandle<()>>, DriverError> {
        let mut tasks = Vec::new();

        let console = self.console.clone();
        let mut console_events = page
            .event_listener::<EventConsoleApiCalled>()
            .await
            .map_err(|err| DriverError::Connect(err.to_string()))?;
        tasks.push(tokio::spawn(async move {
            while let Some(event) = console_events.next().await {
                let entry = parse_console_event(&event);
                if let Ok(mut log) = console.lock() {
                    log.push(entry);
                }
            }
        }));

        // Method arrives on requestWillBeSent, status on
        // responseReceived; join the two by request id.
        let methods: Arc<Mutex<HashMap<RequestId, String>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let methods_writer = methods.clone();
        let mut request_events = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(|err| DriverError::Connect(err.to_string()))?;
        tasks.push(tokio::spawn(async move {
            while let Some(event) = request_events.next().await {
                if let Ok(mut map) = methods_writer.lock() {
                    map.insert(event.request_id.clone(), event.request.method.clone());
                }
            }
        }));

        let network_log = self.network.clone();
        let mut response_events = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(|err| DriverError::Connect(err.to_string()))?;
        tasks.push(tokio::spawn(async move {
            while let Some(event) = response_events.next().await {
                let method = methods
                    .lock()
                    .ok()
                    .and_then(|mut map| map.remove(&event.request_id))
                    .unwrap_or_else(|| "GET".to_string());
                let entry = NetworkEntry {
                    url: event.response.url.clone(),
                    method,
                    status: event.response.status.max(0) as u16,
                    timestamp: now_ms(),
                };
                if let Ok(mut log) = network_log.lock() {
                    log.push(entry);
                }
            }
        }));

        let pending = self.pending_dialog.clone();
        let dialog_page = page.clone();
        let mut dialog_events = page
            .event_listener::<EventJavascriptDialogOpening>()
            .await
            .map_err(|err| DriverError::Connect(err.to_string()))?;
        tasks.push(tokio::spawn(async move {
            while let Some(event) = dialog_events.next().await {
                let armed = pending.lock().ok().and_then(|mut slot| slot.take());
                // Unarmed dialogs are dismissed so they cannot wedge the run.
                let (action, text) = armed.unwrap_or((DialogAction::Dismiss, None));
                debug!(message = %event.message, ?action, "Handling JavaScript dialog");
                let params = HandleJavaScriptDialogParams {
                    accept: matches!(action, DialogAction::Accept),
                    prompt_text: text,
                };
                if let Err(err) = dialog_page.execute(params).await {
                    warn!(error = %err, "Failed to handle dialog");
                }
            }
        }));

        Ok(tasks)
    }

    /// Arm CDP Fetch interception and the serving task.
    async fn arm_interception(&self, page: &Arc<Page>) -> Result<JoinHandle<()>, DriverError> {
        let enable = fetch::EnableParams {
            patterns: Some(vec![RequestPattern {
                url_pattern: Some("*".to_string()),
                resource_type: None,
                request_stage: None,
            }]),
            handle_auth_requests: None,
        };
        page.execute(enable)
            .await
            .map_err(|err| DriverError::Connect(format!("Fetch.enable failed: {err}")))?;

        let rules = self.mock_rules.clone();
        let serve_page = page.clone();
        let mut paused_events = page
            .event_listener::<EventRequestPaused>()
            .await
            .map_err(|err| DriverError::Connect(err.to_string()))?;

        Ok(tokio::spawn(async move {
            while let Some(event) = paused_events.next().await {
                let url = event.request.url.clone();
                let rule = rules
                    .lock()
                    .ok()
                    .and_then(|armed| armed.iter().find(|r| r.matches(&url)).cloned());

                match rule {
                    None => {
                        let params = ContinueRequestParams::new(event.request_id.clone());
                        if let Err(err) = serve_page.execute(params).await {
                            debug!(error = %err, url = %url, "Continue request failed");
                        }
                    }
                    Some(rule) => {
                        if rule.delay_ms > 0 {
                            tokio::time::sleep(Duration::from_millis(rule.delay_ms)).await;
                        }
                        let params = build_fulfill(&event, &rule);
                        match params {
                            Ok(params) => {
                                debug!(url = %url, status = rule.status, "Serving mock response");
                                if let Err(err) = serve_page.execute(params).await {
                                    warn!(error = %err, url = %url, "Fulfill request failed");
                                }
                            }
                            Err(err) => {
                                warn!(error = %err, url = %url, "Mock rule could not be served");
                            }
                        }
                    }
                }
            }
        }))
    }

    /// Wrap an expression so it evaluates against the active frame's
    /// document. Top-frame evaluation passes through untouched.
    fn scoped(&self, expression: &str) -> String {
        let frame = self
            .frame_selector
            .lock()
            .ok()
            .and_then(|guard| guard.clone());
        match frame {
            None => expression.to_string(),
            Some(selector) => format!(
                "(function() {{\n\
                   const f = document.querySelector({sel});\n\
                   const d = f && (f.contentDocument || (f.contentWindow && f.contentWindow.document));\n\
                   if (!d) throw new Error('frame not found: ' + {sel});\n\
                   return (function(window, document) {{ return ({expression}); }})(d.defaultView, d);\n\
                 }})()",
                sel = js_str(&selector),
            ),
        }
    }

    async fn eval_raw(&self, script: &str) -> Result<Value, DriverError> {
        let page = self.page().await?;
        let result = page
            .evaluate(script)
            .await
            .map_err(|err| DriverError::Evaluate(err.to_string()))?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    /// Evaluate a script that reports element presence; false maps to
    /// ElementNotFound.
    async fn eval_element(&self, script: String, selector: &str) -> Result<(), DriverError> {
        let found = self.eval_raw(&self.scoped(&script)).await?;
        match found {
            Value::Bool(true) => Ok(()),
            _ => Err(DriverError::ElementNotFound {
                selector: selector.to_string(),
            }),
        }
    }
}

fn parse_console_event(event: &EventConsoleApiCalled) -> ConsoleEntry {
    let level = match event.r#type {
        ConsoleApiCalledType::Log => "log",
        ConsoleApiCalledType::Info => "info",
        ConsoleApiCalledType::Warning => "warn",
        ConsoleApiCalledType::Error => "error",
        ConsoleApiCalledType::Debug => "debug",
        _ => "log",
    };

    let text = event
        .args
        .iter()
        .map(|arg| match arg.value.as_ref() {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "<object>".to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ");

    ConsoleEntry {
        level: level.to_string(),
        text,
        timestamp: now_ms(),
    }
}

fn build_fulfill(
    event: &EventRequestPaused,
    rule: &MockRule,
) -> Result<FulfillRequestParams, String> {
    // CORS preflight: 204 with permissive headers, no body.
    if event.request.method.eq_ignore_ascii_case("OPTIONS") {
        return FulfillRequestParams::builder()
            .request_id(event.request_id.clone())
            .response_code(204)
            .response_headers(cors_headers(None))
            .build();
    }

    let mut builder = FulfillRequestParams::builder()
        .request_id(event.request_id.clone())
        .response_code(rule.status as i64)
        .response_headers(cors_headers(Some(rule.content_type.clone())));

    if let Some(body) = &rule.body {
        builder = builder.body(base64::engine::general_purpose::STANDARD.encode(body));
    }
    builder.build()
}

fn cors_headers(content_type: Option<String>) -> Vec<HeaderEntry> {
    let mut headers = vec![
        HeaderEntry {
            name: "Access-Control-Allow-Origin".to_string(),
            value: "*".to_string(),
        },
        HeaderEntry {
            name: "Access-Control-Allow-Methods".to_string(),
            value: "GET, POST, PUT, PATCH, DELETE, OPTIONS".to_string(),
        },
        HeaderEntry {
            name: "Access-Control-Allow-Headers".to_string(),
            value: "*".to_string(),
        },
    ];
    if let Some(content_type) = content_type {
        headers.push(HeaderEntry {
            name: "Content-Type".to_string(),
            value: content_type,
        });
    }
    headers
}

#[async_trait]
impl BrowserDriver for ChromeDriver {
    async fn connect(&self, url: &str, opts: ConnectOptions) -> Result<(), DriverError> {
        let ws_url = Self::resolve_ws_url(url).await?;
        debug!(ws_url = %ws_url, create_tab = opts.create_tab, "Connecting to browser");

        let (browser, mut handler) = Browser::connect(ws_url)
            .await
            .map_err(|err| DriverError::Connect(err.to_string()))?;

        // chromiumoxide requires the handler stream to be driven for
        // any CDP traffic to flow.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "Browser handler error");
                }
            }
        });

        let page = if opts.create_tab {
            browser
                .new_page("about:blank")
                .await
                .map_err(|err| DriverError::Connect(err.to_string()))?
        } else {
            match browser
                .pages()
                .await
                .map_err(|err| DriverError::Connect(err.to_string()))?
                .into_iter()
                .next()
            {
                Some(page) => page,
                None => browser
                    .new_page("about:blank")
                    .await
                    .map_err(|err| DriverError::Connect(err.to_string()))?,
            }
        };
        let page = Arc::new(page);

        page.execute(network::EnableParams::default())
            .await
            .map_err(|err| DriverError::Connect(format!("Network.enable failed: {err}")))?;

        let mut tasks = self.spawn_capture_tasks(&page).await?;
        tasks.push(self.arm_interception(&page).await?);
        tasks.push(handler_task);

        if let (Some(sessions), Some(session_id)) = (&self.sessions, &opts.session_id) {
            let target_id = page.target_id().inner().clone();
            if let Err(err) = sessions.register(session_id.clone(), target_id).await {
                warn!(error = %err, "Session registration failed");
            }
        }

        let mut state = self.state.lock().await;
        *state = Some(ChromeState {
            _browser: browser,
            page,
            session_id: opts.session_id,
            tasks,
        });
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        let page = self.page().await?;
        page.goto(url)
            .await
            .map_err(|err| DriverError::Navigation {
                url: url.to_string(),
                reason: err.to_string(),
            })?;

        // Poll readyState rather than trusting lifecycle events; SPAs
        // frequently rewrite history without firing them.
        let deadline = std::time::Instant::now() + NAVIGATION_TIMEOUT;
        loop {
            let ready = page
                .evaluate("document.readyState")
                .await
                .ok()
                .and_then(|result| result.value().cloned())
                .and_then(|value| value.as_str().map(|s| s.to_string()));

            if matches!(ready.as_deref(), Some("complete") | Some("interactive")) {
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                return Err(DriverError::Navigation {
                    url: url.to_string(),
                    reason: "page never became ready".to_string(),
                });
            }
            tokio::time::sleep(NAVIGATION_POLL).await;
        }
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, DriverError> {
        self.eval_raw(&self.scoped(expression)).await
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), DriverError> {
        let script = format!(
            "(() => {{\n\
               const el = document.querySelector({sel});\n\
               if (!el) return false;\n\
               el.focus();\n\
               el.value = {val};\n\
               el.dispatchEvent(new Event('input', {{ bubbles: true }}));\n\
               el.dispatchEvent(new Event('change', {{ bubbles: true }}));\n\
               return true;\n\
             }})()",
            sel = js_str(selector),
            val = js_str(value),
        );
        self.eval_element(script, selector).await
    }

    async fn click(&self, selector: &str) -> Result<(), DriverError> {
        let script = format!(
            "(() => {{ const el = document.querySelector({}); if (!el) return false; el.click(); return true; }})()",
            js_str(selector),
        );
        self.eval_element(script, selector).await
    }

    async fn hover(&self, selector: &str) -> Result<(), DriverError> {
        let script = format!(
            "(() => {{\n\
               const el = document.querySelector({});\n\
               if (!el) return false;\n\
               for (const type of ['mouseover', 'mouseenter']) {{\n\
                 el.dispatchEvent(new MouseEvent(type, {{ bubbles: true }}));\n\
               }}\n\
               return true;\n\
             }})()",
            js_str(selector),
        );
        self.eval_element(script, selector).await
    }

    async fn select(&self, selector: &str, value: &str) -> Result<(), DriverError> {
        let script = format!(
            "(() => {{\n\
               const el = document.querySelector({sel});\n\
               if (!el) return false;\n\
               el.value = {val};\n\
               el.dispatchEvent(new Event('change', {{ bubbles: true }}));\n\
               return true;\n\
             }})()",
            sel = js_str(selector),
            val = js_str(value),
        );
        self.eval_element(script, selector).await
    }

    async fn press_key(&self, key: &str, modifiers: &[String]) -> Result<(), DriverError> {
        let mods: Vec<String> = modifiers.iter().map(|m| m.to_lowercase()).collect();
        let script = format!(
            "(() => {{\n\
               const el = document.activeElement || document.body;\n\
               const init = {{\n\
                 key: {key},\n\
                 bubbles: true,\n\
                 cancelable: true,\n\
                 ctrlKey: {ctrl},\n\
                 shiftKey: {shift},\n\
                 altKey: {alt},\n\
                 metaKey: {meta},\n\
               }};\n\
               el.dispatchEvent(new KeyboardEvent('keydown', init));\n\
               el.dispatchEvent(new KeyboardEvent('keyup', init));\n\
               return true;\n\
             }})()",
            key = js_str(key),
            ctrl = mods.iter().any(|m| m == "control" || m == "ctrl"),
            shift = mods.iter().any(|m| m == "shift"),
            alt = mods.iter().any(|m| m == "alt"),
            meta = mods.iter().any(|m| m == "meta" || m == "cmd"),
        );
        self.eval_raw(&self.scoped(&script)).await?;
        Ok(())
    }

    async fn switch_frame(&self, selector: Option<&str>) -> Result<(), DriverError> {
        if let Some(selector) = selector {
            // Verify the frame exists before scoping to it.
            let probe = format!(
                "(() => {{ const f = document.querySelector({}); return !!(f && (f.contentDocument || f.contentWindow)); }})()",
                js_str(selector),
            );
            let found = self.eval_raw(&probe).await?;
            if found != Value::Bool(true) {
                return Err(DriverError::ElementNotFound {
                    selector: selector.to_string(),
                });
            }
        }
        if let Ok(mut guard) = self.frame_selector.lock() {
            *guard = selector.map(|s| s.to_string());
        }
        Ok(())
    }

    async fn handle_dialog(
        &self,
        action: DialogAction,
        text: Option<&str>,
    ) -> Result<(), DriverError> {
        if let Ok(mut slot) = self.pending_dialog.lock() {
            *slot = Some((action, text.map(|t| t.to_string())));
        }
        Ok(())
    }

    async fn capture_screenshot(&self) -> Result<String, DriverError> {
        let page = self.page().await?;
        let bytes = page
            .screenshot(ScreenshotParams::default())
            .await
            .map_err(|err| DriverError::Screenshot(err.to_string()))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    async fn get_console_messages(&self) -> Result<Vec<ConsoleEntry>, DriverError> {
        Ok(self
            .console
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default())
    }

    async fn get_network_responses(&self) -> Result<Vec<NetworkEntry>, DriverError> {
        Ok(self
            .network
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default())
    }

    async fn get_dom_snapshot(&self) -> Result<String, DriverError> {
        let value = self
            .eval_raw(&self.scoped("document.documentElement.outerHTML"))
            .await?;
        match value {
            Value::String(html) => Ok(html),
            other => Ok(other.to_string()),
        }
    }

    async fn add_mock_rule(&self, rule: MockRule) -> Result<(), DriverError> {
        // Interception is armed at connect; arming a rule is a plain
        // push. First armed match wins at serve time.
        if let Ok(mut rules) = self.mock_rules.lock() {
            rules.push(rule);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        let state = self.state.lock().await.take();
        let Some(state) = state else {
            return Ok(());
        };

        // Stop listener tasks first so their Arc clones release the page.
        for task in state.tasks {
            task.abort();
        }

        if let (Some(sessions), Some(session_id)) = (&self.sessions, &state.session_id) {
            if let Err(err) = sessions.touch(session_id.clone()).await {
                debug!(error = %err, "Session touch on close failed");
            }
        }

        match Arc::try_unwrap(state.page) {
            Ok(page) => {
                if let Err(err) = page.close().await {
                    debug!(error = %err, "Page close failed");
                }
            }
            Err(_page) => {
                // Outstanding references; the tab closes with the
                // browser connection drop.
                warn!("Page close skipped: outstanding references");
            }
        }
        Ok(())
    }
}
