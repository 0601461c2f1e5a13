//! Evaluation, assertion and wait-family step handlers.
//!
//! The polling loops here check elapsed wall-clock between iterations
//! and stop promptly at their window's edge; evaluation errors inside a
//! retry window are swallowed until the window closes, then surface as
//! the failure message.

use crate::definition::{Step, TextMatch, VerifyPage, DEFAULT_WAIT_TIMEOUT_MS};
use crate::driver::{glob_match, BrowserDriver};
use crate::errors::StepError;
use crate::steps_page::{is_truthy, js_str};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::debug;

const WAIT_FOR_POLL_MS: u64 = 100;
const TEXT_POLL_MS: u64 = 200;

/// Evaluate a JS expression. A falsy result is an assertion failure; a
/// truthy result is the step's produced value.
pub async fn eval(driver: &dyn BrowserDriver, step: &Step) -> Result<Option<Value>, StepError> {
    let expression = step.eval.as_deref().unwrap_or_default();
    let value = driver.evaluate(expression).await?;
    if is_truthy(&value) {
        Ok(Some(value))
    } else {
        Err(StepError::Assertion(format!(
            "Expression evaluated to a falsy value: {expression}"
        )))
    }
}

/// Poll a JS expression until truthy within the retry window.
/// Evaluation errors are swallowed while polling and reported only when
/// the window closes.
pub async fn assert(driver: &dyn BrowserDriver, step: &Step) -> Result<Option<Value>, StepError> {
    let expression = step.assert.as_deref().unwrap_or_default();
    let retry = step.retry.unwrap_or_default();
    let interval = Duration::from_millis(retry.interval.max(1));
    let window = Duration::from_millis(retry.timeout);

    let start = Instant::now();
    let mut last_error: Option<String> = None;
    loop {
        match driver.evaluate(expression).await {
            Ok(value) if is_truthy(&value) => return Ok(None),
            Ok(value) => {
                last_error = Some(format!("expression returned {value}"));
            }
            Err(err) => {
                debug!(error = %err, "Assertion evaluation error, retrying");
                last_error = Some(err.to_string());
            }
        }

        if start.elapsed() >= window {
            let detail = last_error.unwrap_or_else(|| "expression stayed falsy".to_string());
            return Err(StepError::Assertion(format!(
                "Assertion failed after {}ms: {expression} ({detail})",
                retry.timeout
            )));
        }
        tokio::time::sleep(interval).await;
    }
}

fn match_script(text: &str, scope: Option<&str>, mode: TextMatch) -> String {
    let scope_expr = match scope {
        Some(selector) => format!("document.querySelector({})", js_str(selector)),
        None => "document.body".to_string(),
    };
    let candidate = format!(
        "(() => {{ const s = {scope_expr}; return s ? (s.innerText || s.textContent || '') : null; }})()"
    );
    match mode {
        TextMatch::Contains => format!(
            "(() => {{ const t = {candidate}; return t !== null && t.includes({}); }})()",
            js_str(text)
        ),
        TextMatch::Exact => format!(
            "(() => {{ const t = {candidate}; return t !== null && t.trim() === {}.trim(); }})()",
            js_str(text)
        ),
        TextMatch::Regex => format!(
            "(() => {{ const t = {candidate}; return t !== null && new RegExp({}).test(t); }})()",
            js_str(text)
        ),
    }
}

/// Single text presence check against the page (or a scope selector).
pub async fn assert_text(
    driver: &dyn BrowserDriver,
    step: &Step,
) -> Result<Option<Value>, StepError> {
    let text = step.assert_text.as_deref().unwrap_or_default();
    let mode = step.match_mode.unwrap_or_default();
    let script = match_script(text, step.selector.as_deref(), mode);

    let found = driver.evaluate(&script).await?;
    if is_truthy(&found) {
        Ok(None)
    } else {
        Err(StepError::Assertion(format!(
            "Expected text not found: '{text}'"
        )))
    }
}

/// Sleep for the given milliseconds.
pub async fn wait(_driver: &dyn BrowserDriver, step: &Step) -> Result<Option<Value>, StepError> {
    let ms = step.wait.unwrap_or(0);
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Ok(None)
}

/// Poll for a CSS selector until it appears.
pub async fn wait_for(
    driver: &dyn BrowserDriver,
    step: &Step,
) -> Result<Option<Value>, StepError> {
    let selector = step.wait_for.as_deref().unwrap_or_default();
    let timeout = step.timeout.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS);
    let script = format!("!!document.querySelector({})", js_str(selector));

    poll_until(driver, &script, timeout, WAIT_FOR_POLL_MS, || {
        StepError::Timeout(format!(
            "Timed out waiting for selector '{selector}' after {timeout}ms"
        ))
    })
    .await
}

/// Poll until the text appears (contains/exact/regex match modes).
pub async fn wait_for_text(
    driver: &dyn BrowserDriver,
    step: &Step,
) -> Result<Option<Value>, StepError> {
    let text = step.wait_for_text.as_deref().unwrap_or_default();
    let timeout = step.timeout.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS);
    let mode = step.match_mode.unwrap_or_default();
    let script = match_script(text, step.selector.as_deref(), mode);

    poll_until(driver, &script, timeout, TEXT_POLL_MS, || {
        StepError::Timeout(format!(
            "Timed out waiting for text '{text}' after {timeout}ms"
        ))
    })
    .await
}

/// Poll until the text disappears.
pub async fn wait_for_text_gone(
    driver: &dyn BrowserDriver,
    step: &Step,
) -> Result<Option<Value>, StepError> {
    let text = step.wait_for_text_gone.as_deref().unwrap_or_default();
    let timeout = step.timeout.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS);
    let mode = step.match_mode.unwrap_or_default();
    let inner = match_script(text, step.selector.as_deref(), mode);
    let script = format!("!({inner})");

    poll_until(driver, &script, timeout, TEXT_POLL_MS, || {
        StepError::Timeout(format!(
            "Timed out waiting for text to disappear: '{text}' after {timeout}ms"
        ))
    })
    .await
}

async fn poll_until(
    driver: &dyn BrowserDriver,
    script: &str,
    timeout_ms: u64,
    poll_ms: u64,
    on_timeout: impl Fn() -> StepError,
) -> Result<Option<Value>, StepError> {
    let start = Instant::now();
    let window = Duration::from_millis(timeout_ms);
    loop {
        match driver.evaluate(script).await {
            Ok(value) if is_truthy(&value) => return Ok(None),
            Ok(_) => {}
            Err(err) => {
                // Transient during navigation; the window bounds us.
                debug!(error = %err, "Wait polling evaluation error");
            }
        }
        if start.elapsed() >= window {
            return Err(on_timeout());
        }
        tokio::time::sleep(Duration::from_millis(poll_ms)).await;
    }
}

/// Fail when the console log holds a disallowed message.
pub async fn console_check(
    driver: &dyn BrowserDriver,
    step: &Step,
) -> Result<Option<Value>, StepError> {
    let spec = step.console_check.clone().unwrap_or_default();
    let fail_on: Vec<String> = if spec.fail_on.is_empty() {
        vec!["error".to_string()]
    } else {
        spec.fail_on
    };

    let messages = driver.get_console_messages().await?;
    for entry in &messages {
        if !fail_on.iter().any(|level| level == &entry.level) {
            continue;
        }
        if let Some(pattern) = &spec.pattern {
            if !entry.text.contains(pattern.as_str()) {
                continue;
            }
        }
        return Err(StepError::Assertion(format!(
            "Console check failed: {} message '{}'",
            entry.level, entry.text
        )));
    }
    Ok(None)
}

/// Fail when a captured network response has a 4xx/5xx status.
pub async fn network_check(
    driver: &dyn BrowserDriver,
    step: &Step,
) -> Result<Option<Value>, StepError> {
    let spec = step.network_check.clone().unwrap_or_default();
    let responses = driver.get_network_responses().await?;

    for entry in &responses {
        if let Some(pattern) = &spec.pattern {
            if !glob_match(pattern, &entry.url) {
                continue;
            }
        }
        if entry.status >= 400 && !spec.allow_statuses.contains(&entry.status) {
            return Err(StepError::Assertion(format!(
                "Network check failed: {} {} returned {}",
                entry.method, entry.url, entry.status
            )));
        }
    }
    Ok(None)
}

/// Post-navigation page verification: poll until the configured
/// selector, title substring and URL substring all hold.
pub async fn verify_page(
    driver: &dyn BrowserDriver,
    verify: &VerifyPage,
) -> Result<(), StepError> {
    let start = Instant::now();
    let window = Duration::from_millis(verify.timeout);

    loop {
        match verify_once(driver, verify).await {
            Ok(None) => return Ok(()),
            Ok(Some(pending)) => {
                if start.elapsed() >= window {
                    return Err(StepError::Assertion(format!(
                        "Page verification failed: {pending} (after {}ms)",
                        verify.timeout
                    )));
                }
            }
            Err(err) => {
                if start.elapsed() >= window {
                    return Err(err);
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(WAIT_FOR_POLL_MS)).await;
    }
}

/// One verification pass; Ok(None) when everything holds, otherwise the
/// first failing check's description.
async fn verify_once(
    driver: &dyn BrowserDriver,
    verify: &VerifyPage,
) -> Result<Option<String>, StepError> {
    if let Some(selector) = &verify.selector {
        let script = format!("!!document.querySelector({})", js_str(selector));
        if !is_truthy(&driver.evaluate(&script).await?) {
            return Ok(Some(format!("selector '{selector}' not present")));
        }
    }
    if let Some(title) = &verify.title {
        let script = format!("document.title.includes({})", js_str(title));
        if !is_truthy(&driver.evaluate(&script).await?) {
            return Ok(Some(format!("title does not contain '{title}'")));
        }
    }
    if let Some(fragment) = &verify.url_contains {
        let script = format!("window.location.href.includes({})", js_str(fragment));
        if !is_truthy(&driver.evaluate(&script).await?) {
            return Ok(Some(format!("url does not contain '{fragment}'")));
        }
    }
    Ok(None)
}
