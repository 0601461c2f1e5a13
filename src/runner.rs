//! The step runner: drives one test definition from connect to result.
//!
//! Lifecycle for one execution:
//!
//! 1. connect to the browser driver (bounded by the test timeout)
//! 2. before-hooks, phase A: every `http_request` hook, pre-navigation
//! 3. before-hooks, phase B: every `mock_network` hook, pre-navigation
//!    (mocks must be armed before the page's initial requests fire)
//! 4. navigate to the definition's url
//! 5. page verification, when configured
//! 6. before-hooks, phase C: everything not already executed
//! 7. main steps, each behind the debug gate, with events and optional
//!    DOM capture
//! 8. after-hooks, always, errors absorbed
//! 9. disconnect, errors absorbed
//!
//! Hook step indices in events use negative numbering: before-hook i is
//! `-(i+1)`, after-hook i is `-(100+i)`.

use crate::debug_control::DebugController;
use crate::definition::{Step, StepKind, TestDefinition};
use crate::diagnostics;
use crate::dispatch::{self, ExecCtx, StepFailure};
use crate::driver::{BrowserDriver, ConnectOptions};
use crate::errors::StepError;
use crate::events::{Emitter, RunEvent};
use crate::results::{LoopFrame, TestResult};
use crate::storage;
use crate::variables::{is_valid_name, VarEnv};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Diagnostics capture gets its own small budget so a wedged driver
/// cannot stall a test that already failed.
const DIAGNOSTICS_BUDGET: Duration = Duration::from_secs(5);

/// How a single run is wired: where the browser lives, which session
/// and tab policy to use, and the event/debug plumbing.
#[derive(Clone)]
pub struct RunOptions {
    /// Browser endpoint handed to `BrowserDriver::connect`.
    pub browser_url: String,

    /// Logical session the target tab is registered under.
    pub session_id: Option<String>,

    /// Open an isolated tab for this run.
    pub create_tab: bool,

    /// Storage root used to resolve `run_test` ids.
    pub storage_dir: Option<PathBuf>,

    /// Caller-provided input values, checked against the definition's
    /// `inputs`.
    pub inputs: HashMap<String, Value>,

    pub emitter: Emitter<RunEvent>,
    pub controller: Arc<DebugController>,
}

impl RunOptions {
    pub fn new(browser_url: impl Into<String>) -> Self {
        Self {
            browser_url: browser_url.into(),
            session_id: None,
            create_tab: false,
            storage_dir: None,
            inputs: HashMap::new(),
            emitter: Emitter::disabled(),
            controller: DebugController::disabled(),
        }
    }
}

/// Failure context assembled while unwinding out of step execution.
struct FailureInfo {
    failed_step: i64,
    failed_label: Option<String>,
    step_definition: Option<Step>,
    error: StepError,
    loop_context: Vec<LoopFrame>,
}

impl FailureInfo {
    fn bare(error: StepError) -> Self {
        Self {
            failed_step: -1,
            failed_label: None,
            step_definition: None,
            error,
            loop_context: Vec::new(),
        }
    }
}

/// Executes one test definition against one driver connection.
pub struct TestRunner {
    driver: Arc<dyn BrowserDriver>,
    options: RunOptions,
}

impl TestRunner {
    pub fn new(driver: Arc<dyn BrowserDriver>, options: RunOptions) -> Self {
        Self { driver, options }
    }

    /// Run the definition to a terminal result. Never returns an error:
    /// every failure mode is folded into a Failed result.
    pub async fn run(&self, definition: &TestDefinition) -> TestResult {
        let started = Instant::now();

        info!(
            url = %definition.url,
            steps = definition.steps.len(),
            timeout_ms = definition.timeout,
            "Starting test execution"
        );

        let mut ctx = ExecCtx {
            driver: self.driver.clone(),
            vars: VarEnv::new(definition.env.clone()),
            visited: Vec::new(),
            storage_dir: self.options.storage_dir.clone(),
            emitter: self.options.emitter.clone(),
            controller: self.options.controller.clone(),
            dom_snapshots: BTreeMap::new(),
        };

        let seeded = ctx
            .vars
            .seed_inputs(&definition.inputs, &self.options.inputs)
            .map_err(StepError::Validation);

        let outcome = match seeded {
            Err(err) => Err(FailureInfo::bare(err)),
            Ok(()) => {
                let budget = Duration::from_millis(definition.timeout);
                match tokio::time::timeout(budget, self.run_phases(&mut ctx, definition)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(FailureInfo::bare(StepError::Timeout(format!(
                        "Test timed out after {}ms",
                        definition.timeout
                    )))),
                }
            }
        };

        let result = match outcome {
            Ok(steps_completed) => {
                self.build_passed(&mut ctx, steps_completed, started).await
            }
            Err(info) => self.build_failed(info, started).await,
        };

        // After-hooks run on every exit path, exactly once.
        self.run_after_hooks(&mut ctx, definition).await;

        if let Err(err) = self.driver.close().await {
            debug!(error = %err, "Driver close failed (absorbed)");
        }

        match &result {
            TestResult::Passed { duration_ms, .. } => {
                info!(duration_ms, "Test passed");
            }
            TestResult::Failed {
                failed_step,
                error,
                duration_ms,
                ..
            } => {
                warn!(failed_step, error = %error, duration_ms, "Test failed");
            }
        }
        result
    }

    /// Connect, hooks, navigation, verification and main steps.
    /// Returns the number of main steps executed.
    async fn run_phases(
        &self,
        ctx: &mut ExecCtx,
        definition: &TestDefinition,
    ) -> Result<usize, FailureInfo> {
        self.driver
            .connect(
                &self.options.browser_url,
                ConnectOptions {
                    create_tab: self.options.create_tab,
                    session_id: self.options.session_id.clone(),
                },
            )
            .await
            .map_err(|err| FailureInfo::bare(err.into()))?;

        // Phases A and B run before navigation, in declaration order
        // within each phase.
        self.run_before_phase(ctx, definition, |kind| kind == Some(StepKind::HttpRequest))
            .await?;
        self.run_before_phase(ctx, definition, |kind| kind == Some(StepKind::MockNetwork))
            .await?;

        self.driver
            .navigate(&definition.url)
            .await
            .map_err(|err| FailureInfo::bare(err.into()))?;

        if let Some(verify) = &definition.verify_page {
            crate::steps_wait::verify_page(self.driver.as_ref(), verify)
                .await
                .map_err(FailureInfo::bare)?;
        }

        // Phase C: everything not already executed, unknown hooks
        // included so the dispatcher can report them.
        self.run_before_phase(ctx, definition, |kind| {
            kind != Some(StepKind::HttpRequest) && kind != Some(StepKind::MockNetwork)
        })
        .await?;

        self.run_main_steps(ctx, definition).await
    }

    /// Run the subset of before-hooks selected by `matches`, preserving
    /// declaration order and original hook indices.
    async fn run_before_phase(
        &self,
        ctx: &mut ExecCtx,
        definition: &TestDefinition,
        matches: impl Fn(Option<StepKind>) -> bool,
    ) -> Result<(), FailureInfo> {
        for (i, step) in definition.before.iter().enumerate() {
            if !matches(step.kind()) {
                continue;
            }
            let index = -(i as i64 + 1);
            self.run_hook_step(ctx, step, index).await.map_err(|err| {
                FailureInfo {
                    failed_step: index,
                    failed_label: Some(step.display_label()),
                    step_definition: Some(step.clone()),
                    error: err.error,
                    loop_context: err.loop_context,
                }
            })?;
        }
        Ok(())
    }

    async fn run_hook_step(
        &self,
        ctx: &mut ExecCtx,
        step: &Step,
        index: i64,
    ) -> Result<(), StepFailure> {
        let label = step.display_label();
        ctx.emitter.emit(RunEvent::StepStart {
            step_index: index,
            label: label.clone(),
            nested: false,
        });

        let started = Instant::now();
        match dispatch::execute_step(ctx, step).await {
            Ok(outcome) => {
                ctx.emitter.emit(RunEvent::StepPass {
                    step_index: index,
                    label,
                    duration_ms: started.elapsed().as_millis() as u64,
                    skipped: outcome.skipped,
                });
                Ok(())
            }
            Err(failure) => {
                ctx.emitter.emit(RunEvent::StepFail {
                    step_index: index,
                    label,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: failure.error.to_string(),
                });
                Err(failure)
            }
        }
    }

    async fn run_main_steps(
        &self,
        ctx: &mut ExecCtx,
        definition: &TestDefinition,
    ) -> Result<usize, FailureInfo> {
        let total = definition.steps.len();
        let start_index = self.resolve_resume(ctx, definition)?;

        let mut executed = 0usize;
        for i in start_index..total {
            self.options
                .controller
                .gate(i, total)
                .await
                .map_err(|err| FailureInfo {
                    failed_step: i as i64,
                    failed_label: Some(definition.steps[i].display_label()),
                    step_definition: Some(definition.steps[i].clone()),
                    error: err,
                    loop_context: Vec::new(),
                })?;

            let step = &definition.steps[i];
            let label = step.display_label();
            ctx.emitter.emit(RunEvent::StepStart {
                step_index: i as i64,
                label: label.clone(),
                nested: false,
            });

            let started = Instant::now();
            match dispatch::execute_step(ctx, step).await {
                Ok(outcome) => {
                    if step.capture_dom && !outcome.skipped {
                        match self.driver.get_dom_snapshot().await {
                            Ok(html) => {
                                ctx.dom_snapshots.insert(i as i64, html);
                            }
                            Err(err) => {
                                warn!(step = i, error = %err, "DOM capture failed (absorbed)");
                            }
                        }
                    }
                    ctx.emitter.emit(RunEvent::StepPass {
                        step_index: i as i64,
                        label,
                        duration_ms: started.elapsed().as_millis() as u64,
                        skipped: outcome.skipped,
                    });
                    executed += 1;
                }
                Err(failure) => {
                    error!(step = i, error = %failure.error, "Step failed");
                    ctx.emitter.emit(RunEvent::StepFail {
                        step_index: i as i64,
                        label: label.clone(),
                        duration_ms: started.elapsed().as_millis() as u64,
                        error: failure.error.to_string(),
                    });
                    return Err(FailureInfo {
                        failed_step: i as i64,
                        failed_label: Some(label),
                        step_definition: Some(step.clone()),
                        error: failure.error,
                        loop_context: failure.loop_context,
                    });
                }
            }
        }
        Ok(executed)
    }

    /// Apply `resumeFrom`: out-of-bounds values fail the run, and a
    /// skipped prefix that stores variables forces a restart from 0
    /// (correctness over efficiency — the variable dependency cannot be
    /// satisfied by skipping).
    fn resolve_resume(
        &self,
        ctx: &ExecCtx,
        definition: &TestDefinition,
    ) -> Result<usize, FailureInfo> {
        let Some(resume) = definition.resume_from else {
            return Ok(0);
        };

        let total = definition.steps.len() as i64;
        if resume < 0 || resume > total {
            return Err(FailureInfo::bare(StepError::Validation(format!(
                "resumeFrom {resume} is out of bounds (0..={total})"
            ))));
        }

        let skipped = &definition.steps[..resume as usize];
        let stores_variables = skipped.iter().any(|step| {
            step.store_as.is_some()
                || step
                    .http_request
                    .as_ref()
                    .map_or(false, |spec| spec.store_as.is_some())
        });

        if stores_variables {
            let message =
                "Skipped steps contain variable storage; re-running from start".to_string();
            warn!("{message}");
            ctx.emitter.emit(RunEvent::Warning { message });
            return Ok(0);
        }

        debug!(resume_from = resume, "Resuming mid-test");
        Ok(resume as usize)
    }

    /// After-hooks in declaration order, every failure absorbed.
    async fn run_after_hooks(&self, ctx: &mut ExecCtx, definition: &TestDefinition) {
        for (i, step) in definition.after.iter().enumerate() {
            let index = -(100 + i as i64);
            if let Err(failure) = self.run_hook_step(ctx, step, index).await {
                warn!(
                    hook = i,
                    error = %failure.error,
                    "After-hook failed (absorbed)"
                );
            }
        }
    }

    async fn build_passed(
        &self,
        ctx: &mut ExecCtx,
        steps_completed: usize,
        started: Instant,
    ) -> TestResult {
        // Logs ride along on success too; failures here are not
        // interesting enough to fail a passed test.
        let console_log = self.driver.get_console_messages().await.unwrap_or_default();
        let network_log = self.driver.get_network_responses().await.unwrap_or_default();

        TestResult::Passed {
            steps_completed,
            duration_ms: started.elapsed().as_millis() as u64,
            console_log,
            network_log,
            dom_snapshots: std::mem::take(&mut ctx.dom_snapshots),
        }
    }

    async fn build_failed(&self, info: FailureInfo, started: Instant) -> TestResult {
        let captured = tokio::time::timeout(
            DIAGNOSTICS_BUDGET,
            diagnostics::capture(self.driver.as_ref()),
        )
        .await
        .unwrap_or_default();

        TestResult::Failed {
            failed_step: info.failed_step,
            failed_label: info.failed_label,
            step_definition: info.step_definition,
            error: info.error.to_string(),
            error_kind: info.error.kind().label().to_string(),
            console_log: captured.console_log,
            network_log: captured.network_log,
            dom_snapshot: captured.dom_snapshot,
            screenshot: captured.screenshot,
            duration_ms: started.elapsed().as_millis() as u64,
            loop_context: info.loop_context,
        }
    }
}

/// Run a list of steps sequentially (nested-test bodies). Emits step
/// events flagged `nested`; the debug gate applies only at the parent's
/// granularity, so it is not consulted here.
pub(crate) fn run_step_sequence<'a>(
    ctx: &'a mut ExecCtx,
    steps: &'a [Step],
    nested: bool,
) -> BoxFuture<'a, Result<(), StepFailure>> {
    async move {
        for (k, step) in steps.iter().enumerate() {
            let label = step.display_label();
            if nested {
                ctx.emitter.emit(RunEvent::StepStart {
                    step_index: k as i64,
                    label: label.clone(),
                    nested: true,
                });
            }

            let started = Instant::now();
            match dispatch::execute_step(ctx, step).await {
                Ok(outcome) => {
                    if nested {
                        ctx.emitter.emit(RunEvent::StepPass {
                            step_index: k as i64,
                            label,
                            duration_ms: started.elapsed().as_millis() as u64,
                            skipped: outcome.skipped,
                        });
                    }
                }
                Err(mut failure) => {
                    if nested {
                        ctx.emitter.emit(RunEvent::StepFail {
                            step_index: k as i64,
                            label: label.clone(),
                            duration_ms: started.elapsed().as_millis() as u64,
                            error: failure.error.to_string(),
                        });
                    }
                    failure.error = rewrap(
                        failure.error,
                        |message| format!("step {k} ({label}): {message}"),
                    );
                    return Err(failure);
                }
            }
        }
        Ok(())
    }
    .boxed()
}

/// Rebuild an error with a transformed message, preserving its kind.
/// `Stopped` carries no message and `Cycle` already names the whole
/// chain; both pass through untouched.
fn rewrap(error: StepError, transform: impl Fn(String) -> String) -> StepError {
    match error {
        StepError::Validation(msg) => StepError::Validation(transform(msg)),
        StepError::Assertion(msg) => StepError::Assertion(transform(msg)),
        StepError::Timeout(msg) => StepError::Timeout(transform(msg)),
        StepError::Driver(msg) => StepError::Driver(transform(msg)),
        StepError::Http(msg) => StepError::Http(transform(msg)),
        StepError::Cycle(msg) => StepError::Cycle(msg),
        StepError::Stopped => StepError::Stopped,
    }
}

/// Execute a `loop` step. Receives the raw (un-interpolated) step so
/// `while` can be re-interpolated before every iteration.
pub(crate) async fn execute_loop(ctx: &mut ExecCtx, raw: &Step) -> Result<(), StepFailure> {
    let spec = raw
        .loop_spec
        .as_ref()
        .ok_or_else(|| StepError::Validation("loop step requires a body".to_string()))?;

    match (&spec.over, &spec.while_expr) {
        (Some(_), Some(_)) | (None, None) => {
            return Err(StepError::Validation(
                "loop requires exactly one of 'over' or 'while'".to_string(),
            )
            .into());
        }
        (None, Some(_)) if spec.max.is_none() => {
            return Err(StepError::Validation(
                "loop 'while' requires 'max'".to_string(),
            )
            .into());
        }
        _ => {}
    }

    for name in [&spec.item_as, &spec.index_as] {
        if !is_valid_name(name) {
            return Err(
                StepError::Validation(format!("Invalid variable name '{name}'")).into(),
            );
        }
    }

    if let Some(over) = &spec.over {
        let expression = ctx.vars.interpolate(over);
        let value = ctx
            .driver
            .evaluate(&expression)
            .await
            .map_err(StepError::from)?;
        let items = match value {
            Value::Array(items) => items,
            other => {
                return Err(StepError::Validation(format!(
                    "loop 'over' expression must produce an array, got {other}"
                ))
                .into());
            }
        };

        let bound = spec
            .max
            .map(|max| max as usize)
            .unwrap_or(items.len())
            .min(items.len());

        for (i, item) in items.into_iter().take(bound).enumerate() {
            ctx.vars.set(spec.item_as.clone(), item);
            ctx.vars.set(spec.index_as.clone(), json!(i));
            run_loop_body(ctx, &spec.steps, i as u64).await?;
        }
        return Ok(());
    }

    // while loop, max-bounded by validation above
    let while_expr = spec.while_expr.as_deref().unwrap_or_default();
    let max = spec.max.unwrap_or(0);
    for i in 0..max {
        let condition = ctx.vars.interpolate(while_expr);
        let wrapped = format!("!!({condition})");
        let value = ctx
            .driver
            .evaluate(&wrapped)
            .await
            .map_err(|err| StepError::Validation(format!("loop 'while' failed to evaluate: {err}")))?;
        if !crate::steps_page::is_truthy(&value) {
            break;
        }

        ctx.vars.set(spec.index_as.clone(), json!(i));
        run_loop_body(ctx, &spec.steps, i).await?;
    }
    Ok(())
}

/// Run one loop iteration's body, wrapping any failure with iteration
/// context and prepending the breadcrumb frame (outermost first).
/// Boxed: loop bodies can hold further loops.
fn run_loop_body<'a>(
    ctx: &'a mut ExecCtx,
    steps: &'a [Step],
    iteration: u64,
) -> BoxFuture<'a, Result<(), StepFailure>> {
    async move {
        for (k, step) in steps.iter().enumerate() {
            if let Err(mut failure) = dispatch::execute_step(ctx, step).await {
                let label = step.display_label();
                failure.loop_context.insert(
                    0,
                    LoopFrame {
                        iteration,
                        step: k,
                        label: Some(label.clone()),
                    },
                );
                failure.error = rewrap(failure.error, |message| {
                    format!("Loop iteration {iteration} at {label}: {message}")
                });
                return Err(failure);
            }
        }
        Ok(())
    }
    .boxed()
}

/// Execute a `run_test` step: load the referenced test and run its main
/// steps inline, sharing the caller's variables and driver. The nested
/// test's `before`/`after`/`env` do not apply; the caller's env drives
/// interpolation.
pub(crate) async fn execute_nested_test(
    ctx: &mut ExecCtx,
    step: &Step,
) -> Result<(), StepFailure> {
    let id = step.run_test.as_deref().unwrap_or_default().trim().to_string();
    if id.is_empty() {
        return Err(
            StepError::Validation("run_test requires a non-empty test id".to_string()).into(),
        );
    }

    if ctx.visited.iter().any(|seen| *seen == id) {
        let mut chain = ctx.visited.clone();
        chain.push(id);
        return Err(StepError::Cycle(chain.join(" -> ")).into());
    }

    let Some(dir) = ctx.storage_dir.clone() else {
        return Err(StepError::Validation(
            "run_test requires a storage directory".to_string(),
        )
        .into());
    };

    ctx.visited.push(id.clone());
    let result = run_nested_inner(ctx, &dir, &id).await;
    ctx.visited.pop();

    result.map_err(|mut failure| {
        failure.error = rewrap(failure.error, |message| {
            format!("Sub-test {id} failed at {message}")
        });
        failure
    })
}

async fn run_nested_inner(
    ctx: &mut ExecCtx,
    dir: &std::path::Path,
    id: &str,
) -> Result<(), StepFailure> {
    let saved = storage::get_test(dir, id)
        .await
        .map_err(|err| StepError::Validation(format!("Failed to load test '{id}': {err}")))?
        .ok_or_else(|| StepError::Validation(format!("Test '{id}' not found")))?;

    debug!(test_id = id, "Running nested test");
    ctx.driver
        .navigate(&saved.definition.url)
        .await
        .map_err(StepError::from)?;

    run_step_sequence(ctx, &saved.definition.steps, true).await
}
