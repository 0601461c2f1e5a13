//! DOM interaction step handlers.
//!
//! Handlers receive the already-interpolated step and compose the driver
//! primitives (`fill`, `click`, `evaluate`, ...) into the higher-level
//! operations test authors write. Selectors and text arguments are
//! JSON-encoded before being spliced into page scripts so arbitrary
//! quoting cannot break out of the script.

use crate::definition::Step;
use crate::driver::BrowserDriver;
use crate::errors::StepError;
use serde_json::Value;

/// Encode an arbitrary string as a JS string literal.
pub(crate) fn js_str(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string())
}

/// True for the JS notion of falsy (including NaN).
pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

fn require<'a>(field: Option<&'a String>, message: &str) -> Result<&'a str, StepError> {
    field
        .map(|s| s.as_str())
        .ok_or_else(|| StepError::Validation(message.to_string()))
}

/// Evaluate a script that reports whether it found its target element;
/// a false result becomes a driver-style "element not found" failure.
async fn eval_element_op(
    driver: &dyn BrowserDriver,
    script: String,
    target: &str,
) -> Result<(), StepError> {
    let found = driver.evaluate(&script).await?;
    if is_truthy(&found) {
        Ok(())
    } else {
        Err(StepError::Driver(format!("element not found: {target}")))
    }
}

pub async fn fill(driver: &dyn BrowserDriver, step: &Step) -> Result<Option<Value>, StepError> {
    let selector = step.fill.as_deref().unwrap_or_default();
    let value = require(step.value.as_ref(), "fill step requires 'value'")?;
    driver.fill(selector, value).await?;
    Ok(None)
}

pub async fn click(driver: &dyn BrowserDriver, step: &Step) -> Result<Option<Value>, StepError> {
    driver.click(step.click.as_deref().unwrap_or_default()).await?;
    Ok(None)
}

pub async fn hover(driver: &dyn BrowserDriver, step: &Step) -> Result<Option<Value>, StepError> {
    driver.hover(step.hover.as_deref().unwrap_or_default()).await?;
    Ok(None)
}

pub async fn select(driver: &dyn BrowserDriver, step: &Step) -> Result<Option<Value>, StepError> {
    let selector = step.select.as_deref().unwrap_or_default();
    let value = require(step.value.as_ref(), "select step requires 'value'")?;
    driver.select(selector, value).await?;
    Ok(None)
}

pub async fn press_key(
    driver: &dyn BrowserDriver,
    step: &Step,
) -> Result<Option<Value>, StepError> {
    let key = step.press_key.as_deref().unwrap_or_default();
    let modifiers = step.modifiers.clone().unwrap_or_default();
    driver.press_key(key, &modifiers).await?;
    Ok(None)
}

/// Click the first element whose visible text matches. Scope with the
/// companion `selector`; `match: exact` compares trimmed text.
pub async fn click_text(
    driver: &dyn BrowserDriver,
    step: &Step,
) -> Result<Option<Value>, StepError> {
    let text = step.click_text.as_deref().unwrap_or_default();
    let scope = step.selector.as_deref().unwrap_or("body");
    let exact = matches!(step.match_mode, Some(crate::definition::TextMatch::Exact));

    let script = format!(
        "(() => {{\n\
           const scope = document.querySelector({scope});\n\
           if (!scope) return false;\n\
           const needle = {text};\n\
           const nodes = scope.querySelectorAll('a, button, [role=\"button\"], input[type=\"submit\"], label, li, td, span, div');\n\
           for (const el of nodes) {{\n\
             const t = (el.innerText || el.textContent || '').trim();\n\
             const hit = {exact} ? t === needle.trim() : t.includes(needle);\n\
             if (hit && el.children.length === 0) {{ el.click(); return true; }}\n\
           }}\n\
           for (const el of nodes) {{\n\
             const t = (el.innerText || el.textContent || '').trim();\n\
             if ({exact} ? t === needle.trim() : t.includes(needle)) {{ el.click(); return true; }}\n\
           }}\n\
           return false;\n\
         }})()",
        scope = js_str(scope),
        text = js_str(text),
        exact = exact,
    );
    eval_element_op(driver, script, &format!("text '{text}'")).await
        .map(|_| None)
}

/// Click the n-th element matching a selector (companion `index`).
pub async fn click_nth(
    driver: &dyn BrowserDriver,
    step: &Step,
) -> Result<Option<Value>, StepError> {
    let selector = step.click_nth.as_deref().unwrap_or_default();
    let index = step
        .index
        .ok_or_else(|| StepError::Validation("click_nth step requires 'index'".to_string()))?;

    let script = format!(
        "(() => {{ const el = document.querySelectorAll({})[{}]; if (!el) return false; el.click(); return true; }})()",
        js_str(selector),
        index,
    );
    eval_element_op(driver, script, &format!("{selector}[{index}]")).await
        .map(|_| None)
}

/// Type text into the focused element, or focus `selector` first.
pub async fn type_text(
    driver: &dyn BrowserDriver,
    step: &Step,
) -> Result<Option<Value>, StepError> {
    let text = step.type_text.as_deref().unwrap_or_default();

    if let Some(selector) = step.selector.as_deref() {
        let focus = format!(
            "(() => {{ const el = document.querySelector({}); if (!el) return false; el.focus(); return true; }})()",
            js_str(selector),
        );
        eval_element_op(driver, focus, selector).await?;
    }

    let script = format!(
        "(() => {{\n\
           const el = document.activeElement;\n\
           if (!el || !('value' in el)) return false;\n\
           el.value = (el.value || '') + {text};\n\
           el.dispatchEvent(new Event('input', {{ bubbles: true }}));\n\
           el.dispatchEvent(new Event('change', {{ bubbles: true }}));\n\
           return true;\n\
         }})()",
        text = js_str(text),
    );
    eval_element_op(driver, script, "focused input").await.map(|_| None)
}

pub async fn scroll_to(
    driver: &dyn BrowserDriver,
    step: &Step,
) -> Result<Option<Value>, StepError> {
    let selector = step.scroll_to.as_deref().unwrap_or_default();
    let script = format!(
        "(() => {{ const el = document.querySelector({}); if (!el) return false; el.scrollIntoView({{ block: 'center' }}); return true; }})()",
        js_str(selector),
    );
    eval_element_op(driver, script, selector).await.map(|_| None)
}

pub async fn clear_input(
    driver: &dyn BrowserDriver,
    step: &Step,
) -> Result<Option<Value>, StepError> {
    let selector = step.clear_input.as_deref().unwrap_or_default();
    let script = format!(
        "(() => {{\n\
           const el = document.querySelector({});\n\
           if (!el) return false;\n\
           el.value = '';\n\
           el.dispatchEvent(new Event('input', {{ bubbles: true }}));\n\
           el.dispatchEvent(new Event('change', {{ bubbles: true }}));\n\
           return true;\n\
         }})()",
        js_str(selector),
    );
    eval_element_op(driver, script, selector).await.map(|_| None)
}

/// Enumerate form controls under the scope selector. Produces the
/// descriptor array front-ends use to propose fills.
pub async fn scan_input(
    driver: &dyn BrowserDriver,
    step: &Step,
) -> Result<Option<Value>, StepError> {
    let scope = step.scan_input.as_deref().unwrap_or("body");
    let script = format!(
        "(() => {{\n\
           const scope = document.querySelector({});\n\
           if (!scope) return null;\n\
           return Array.from(scope.querySelectorAll('input, textarea, select')).map(el => ({{\n\
             tag: el.tagName.toLowerCase(),\n\
             type: el.type || null,\n\
             name: el.name || null,\n\
             id: el.id || null,\n\
             placeholder: el.placeholder || null,\n\
             value: el.value || null,\n\
           }}));\n\
         }})()",
        js_str(scope),
    );
    let value = driver.evaluate(&script).await?;
    if value.is_null() {
        return Err(StepError::Driver(format!("element not found: {scope}")));
    }
    Ok(Some(value))
}

/// Fill several fields in one step (selector → value map).
pub async fn fill_form(
    driver: &dyn BrowserDriver,
    step: &Step,
) -> Result<Option<Value>, StepError> {
    let fields = step
        .fill_form
        .as_ref()
        .ok_or_else(|| StepError::Validation("fill_form step requires fields".to_string()))?;

    let mut ordered: Vec<_> = fields.iter().collect();
    ordered.sort_by(|a, b| a.0.cmp(b.0));
    for (selector, value) in ordered {
        driver.fill(selector, value).await?;
    }
    Ok(None)
}

pub async fn screenshot(
    driver: &dyn BrowserDriver,
    _step: &Step,
) -> Result<Option<Value>, StepError> {
    let png = driver.capture_screenshot().await?;
    Ok(Some(Value::String(png)))
}

/// Scope subsequent selector operations to an iframe. Empty string or
/// "top" returns to the main frame.
pub async fn switch_frame(
    driver: &dyn BrowserDriver,
    step: &Step,
) -> Result<Option<Value>, StepError> {
    let target = step.switch_frame.as_deref().unwrap_or_default();
    let selector = match target {
        "" | "top" | "main" => None,
        other => Some(other),
    };
    driver.switch_frame(selector).await?;
    Ok(None)
}

pub async fn handle_dialog(
    driver: &dyn BrowserDriver,
    step: &Step,
) -> Result<Option<Value>, StepError> {
    let spec = step
        .handle_dialog
        .as_ref()
        .ok_or_else(|| StepError::Validation("handle_dialog step requires an action".to_string()))?;
    driver.handle_dialog(spec.action, spec.text.as_deref()).await?;
    Ok(None)
}

/// Click the control that dismisses a modal.
pub async fn close_modal(
    driver: &dyn BrowserDriver,
    step: &Step,
) -> Result<Option<Value>, StepError> {
    let selector = step.close_modal.as_deref().unwrap_or_default();
    driver.click(selector).await?;
    Ok(None)
}

/// Select a dropdown option by its visible label (companion `option`).
pub async fn choose_dropdown(
    driver: &dyn BrowserDriver,
    step: &Step,
) -> Result<Option<Value>, StepError> {
    let selector = step.choose_dropdown.as_deref().unwrap_or_default();
    let label = require(
        step.option_label.as_ref(),
        "choose_dropdown step requires 'option'",
    )?;

    let script = format!(
        "(() => {{\n\
           const el = document.querySelector({selector});\n\
           if (!el) return false;\n\
           const wanted = {label}.trim();\n\
           for (const opt of el.options || []) {{\n\
             if (opt.label.trim() === wanted || opt.text.trim() === wanted) {{\n\
               el.value = opt.value;\n\
               el.dispatchEvent(new Event('change', {{ bubbles: true }}));\n\
               return true;\n\
             }}\n\
           }}\n\
           return false;\n\
         }})()",
        selector = js_str(selector),
        label = js_str(label),
    );
    eval_element_op(driver, script, &format!("{selector} option '{label}'"))
        .await
        .map(|_| None)
}

/// Click a collapsed menu trigger; a no-op when already expanded.
pub async fn expand_menu(
    driver: &dyn BrowserDriver,
    step: &Step,
) -> Result<Option<Value>, StepError> {
    let selector = step.expand_menu.as_deref().unwrap_or_default();
    let script = format!(
        "(() => {{\n\
           const el = document.querySelector({});\n\
           if (!el) return false;\n\
           if (el.getAttribute('aria-expanded') !== 'true') el.click();\n\
           return true;\n\
         }})()",
        js_str(selector),
    );
    eval_element_op(driver, script, selector).await.map(|_| None)
}

/// Toggle a checkbox/switch, or force it via the companion `state`.
pub async fn toggle(driver: &dyn BrowserDriver, step: &Step) -> Result<Option<Value>, StepError> {
    let selector = step.toggle.as_deref().unwrap_or_default();
    let script = match step.state {
        Some(state) => format!(
            "(() => {{\n\
               const el = document.querySelector({});\n\
               if (!el) return false;\n\
               if (el.checked !== {state}) {{\n\
                 el.checked = {state};\n\
                 el.dispatchEvent(new Event('change', {{ bubbles: true }}));\n\
               }}\n\
               return true;\n\
             }})()",
            js_str(selector),
            state = state,
        ),
        None => format!(
            "(() => {{\n\
               const el = document.querySelector({});\n\
               if (!el) return false;\n\
               el.checked = !el.checked;\n\
               el.dispatchEvent(new Event('change', {{ bubbles: true }}));\n\
               return true;\n\
             }})()",
            js_str(selector),
        ),
    };
    eval_element_op(driver, script, selector).await.map(|_| None)
}
