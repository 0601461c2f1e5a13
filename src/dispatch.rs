//! Step dispatcher: recognizes the operation a step carries and routes
//! it to the matching handler.
//!
//! The dispatcher owns the cross-cutting pieces of step execution:
//! interpolation of the raw step, `if` gating, handler routing and the
//! `as` variable capture. Control-flow steps (`loop`, `run_test`) route
//! into the runner, which re-enters this dispatcher for their inner
//! steps.

use crate::debug_control::DebugController;
use crate::definition::{Step, StepKind};
use crate::driver::BrowserDriver;
use crate::errors::StepError;
use crate::events::{Emitter, RunEvent};
use crate::results::LoopFrame;
use crate::variables::{is_valid_name, VarEnv};
use crate::{runner, steps_net, steps_page, steps_wait};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Successful handler outcome.
#[derive(Debug, Default)]
pub struct StepOutcome {
    /// Value produced by the step, stored under `as` when present.
    pub value: Option<Value>,

    /// The step was skipped by its `if` condition.
    pub skipped: bool,
}

/// Failed handler outcome, with loop breadcrumbs when the failure
/// happened inside `loop` iterations (outermost frame first).
#[derive(Debug)]
pub struct StepFailure {
    pub error: StepError,
    pub loop_context: Vec<LoopFrame>,
}

impl From<StepError> for StepFailure {
    fn from(error: StepError) -> Self {
        Self {
            error,
            loop_context: Vec::new(),
        }
    }
}

/// Everything a step execution can reach: the driver, the variable
/// environment shared with nested tests, the nested-call stack, and the
/// event/debug plumbing.
pub struct ExecCtx {
    pub driver: Arc<dyn BrowserDriver>,
    pub vars: VarEnv,

    /// Test ids currently on the `run_test` call stack.
    pub visited: Vec<String>,

    /// Storage root for resolving `run_test` ids.
    pub storage_dir: Option<PathBuf>,

    pub emitter: Emitter<RunEvent>,
    pub controller: Arc<DebugController>,

    /// Step index → DOM snapshot, filled for steps with `captureDom`.
    pub dom_snapshots: BTreeMap<i64, String>,
}

/// Execute one step end to end: interpolate, gate on `if`, run the
/// handler, capture the produced value.
pub async fn execute_step(ctx: &mut ExecCtx, raw: &Step) -> Result<StepOutcome, StepFailure> {
    let kind = raw
        .kind()
        .ok_or_else(|| StepError::Validation("unknown step type".to_string()))?;

    let step = raw.interpolated(&ctx.vars);

    if let Some(condition) = step.condition.as_deref() {
        if !condition_holds(ctx.driver.as_ref(), kind, condition).await? {
            return Ok(StepOutcome {
                value: None,
                skipped: true,
            });
        }
    }

    let driver = ctx.driver.clone();
    let value = match kind {
        StepKind::Eval => steps_wait::eval(driver.as_ref(), &step).await?,
        StepKind::Fill => steps_page::fill(driver.as_ref(), &step).await?,
        StepKind::Click => steps_page::click(driver.as_ref(), &step).await?,
        StepKind::Assert => steps_wait::assert(driver.as_ref(), &step).await?,
        StepKind::Wait => steps_wait::wait(driver.as_ref(), &step).await?,
        StepKind::WaitFor => steps_wait::wait_for(driver.as_ref(), &step).await?,
        StepKind::WaitForText => steps_wait::wait_for_text(driver.as_ref(), &step).await?,
        StepKind::WaitForTextGone => {
            steps_wait::wait_for_text_gone(driver.as_ref(), &step).await?
        }
        StepKind::AssertText => steps_wait::assert_text(driver.as_ref(), &step).await?,
        StepKind::ClickText => steps_page::click_text(driver.as_ref(), &step).await?,
        StepKind::ClickNth => steps_page::click_nth(driver.as_ref(), &step).await?,
        StepKind::Type => steps_page::type_text(driver.as_ref(), &step).await?,
        StepKind::Select => steps_page::select(driver.as_ref(), &step).await?,
        StepKind::PressKey => steps_page::press_key(driver.as_ref(), &step).await?,
        StepKind::Hover => steps_page::hover(driver.as_ref(), &step).await?,
        StepKind::ScrollTo => steps_page::scroll_to(driver.as_ref(), &step).await?,
        StepKind::ClearInput => steps_page::clear_input(driver.as_ref(), &step).await?,
        StepKind::ScanInput => steps_page::scan_input(driver.as_ref(), &step).await?,
        StepKind::FillForm => steps_page::fill_form(driver.as_ref(), &step).await?,
        StepKind::ConsoleCheck => steps_wait::console_check(driver.as_ref(), &step).await?,
        StepKind::NetworkCheck => steps_wait::network_check(driver.as_ref(), &step).await?,
        StepKind::MockNetwork => steps_net::mock_network(driver.as_ref(), &step).await?,
        StepKind::HttpRequest => steps_net::http_request(&step).await?,
        StepKind::Screenshot => steps_page::screenshot(driver.as_ref(), &step).await?,
        StepKind::SwitchFrame => steps_page::switch_frame(driver.as_ref(), &step).await?,
        StepKind::HandleDialog => steps_page::handle_dialog(driver.as_ref(), &step).await?,
        StepKind::CloseModal => steps_page::close_modal(driver.as_ref(), &step).await?,
        StepKind::ChooseDropdown => steps_page::choose_dropdown(driver.as_ref(), &step).await?,
        StepKind::ExpandMenu => steps_page::expand_menu(driver.as_ref(), &step).await?,
        StepKind::Toggle => steps_page::toggle(driver.as_ref(), &step).await?,
        StepKind::Loop => runner::execute_loop(ctx, raw).await.map(|_| None)?,
        StepKind::RunTest => runner::execute_nested_test(ctx, &step).await.map(|_| None)?,
    };

    if let Some(value) = &value {
        store_value(ctx, &step, kind, value)?;
    }

    Ok(StepOutcome {
        value,
        skipped: false,
    })
}

fn store_value(
    ctx: &mut ExecCtx,
    step: &Step,
    kind: StepKind,
    value: &Value,
) -> Result<(), StepError> {
    if let Some(name) = step.store_as.as_deref() {
        if !is_valid_name(name) {
            return Err(StepError::Validation(format!(
                "Invalid variable name '{name}'"
            )));
        }
        ctx.vars.set(name, value.clone());
    }

    // http_request carries its own `as` inside the request spec.
    if kind == StepKind::HttpRequest {
        if let Some(name) = step
            .http_request
            .as_ref()
            .and_then(|spec| spec.store_as.as_deref())
        {
            if !is_valid_name(name) {
                return Err(StepError::Validation(format!(
                    "Invalid variable name '{name}'"
                )));
            }
            ctx.vars.set(name, value.clone());
        }
    }
    Ok(())
}

/// Decide whether an interpolated `if` expression holds.
///
/// Browser-facing steps ask the page (`!!(<expr>)` through the driver);
/// `http_request` steps run server-side, so their condition is a local
/// textual truthiness check on the interpolated expression instead:
/// empty, `false`, `0`, `null` and `undefined` are falsy. A throwing
/// condition fails the step.
pub async fn condition_holds(
    driver: &dyn BrowserDriver,
    kind: StepKind,
    condition: &str,
) -> Result<bool, StepError> {
    let trimmed = condition.trim();
    if trimmed.is_empty() {
        return Ok(false);
    }

    if kind == StepKind::HttpRequest {
        return Ok(!matches!(
            trimmed,
            "false" | "0" | "null" | "undefined"
        ));
    }

    let wrapped = format!("!!({trimmed})");
    let value = driver
        .evaluate(&wrapped)
        .await
        .map_err(|err| StepError::Validation(format!("Condition failed to evaluate: {err}")))?;
    Ok(crate::steps_page::is_truthy(&value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_step_type_message() {
        let failure: StepFailure =
            StepError::Validation("unknown step type".to_string()).into();
        assert_eq!(failure.error.to_string(), "unknown step type");
        assert!(failure.loop_context.is_empty());
    }

    #[test]
    fn test_local_truthiness_table() {
        // The http_request condition path is a plain text check.
        for falsy in ["false", "0", "null", "undefined", "  ", ""] {
            assert!(
                matches!(falsy.trim(), "" | "false" | "0" | "null" | "undefined"),
                "{falsy:?} should be falsy"
            );
        }
    }
}
