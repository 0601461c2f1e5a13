//! Suite runner: execute a set of tests with bounded concurrency.
//!
//! Scheduling is a counting semaphore with `concurrency` permits and one
//! spawned task per test. The results vector is pre-sized and each task
//! writes exactly its own index, so input order is preserved
//! structurally no matter how completions interleave. A single stop flag
//! implements stop-on-failure: tasks observing it (before or after
//! waiting for a permit) mark themselves skipped.

use crate::debug_control::DebugController;
use crate::driver::BrowserDriver;
use crate::events::{Emitter, SuiteEvent};
use crate::results::{SuiteResult, SuiteTestResult, SuiteTestStatus};
use crate::runner::{RunOptions, TestRunner};
use crate::storage::{self, SavedTest, StorageError};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Produces one driver per test task. Construction is cheap; all I/O
/// starts when the runner calls `connect`.
pub type DriverFactory = Arc<dyn Fn() -> Arc<dyn BrowserDriver> + Send + Sync>;

/// Errors that prevent a suite from starting at all. Per-test failures
/// are data, not errors.
#[derive(Debug, Error)]
pub enum SuiteError {
    #[error("Invalid suite configuration: {0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Suite configuration.
#[derive(Clone)]
pub struct SuiteOptions {
    /// Run every stored test carrying this tag.
    pub tag: Option<String>,

    /// Run exactly these test ids, in this order. Ids that do not
    /// resolve are silently dropped.
    pub test_ids: Option<Vec<String>>,

    /// Browser endpoint handed to every per-test driver.
    pub browser_url: String,

    /// Set the stop flag after the first failed test.
    pub stop_on_failure: bool,

    pub storage_dir: PathBuf,

    /// Maximum simultaneously-running tests; must be at least 1.
    pub concurrency: usize,

    pub emitter: Emitter<SuiteEvent>,
}

impl SuiteOptions {
    pub fn new(browser_url: impl Into<String>, storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            tag: None,
            test_ids: None,
            browser_url: browser_url.into(),
            stop_on_failure: false,
            storage_dir: storage_dir.into(),
            concurrency: 1,
            emitter: Emitter::disabled(),
        }
    }
}

/// Runs a resolved set of tests with bounded concurrency.
pub struct SuiteRunner {
    options: SuiteOptions,
    driver_factory: DriverFactory,
}

impl SuiteRunner {
    pub fn new(options: SuiteOptions, driver_factory: DriverFactory) -> Self {
        Self {
            options,
            driver_factory,
        }
    }

    /// Resolve the test set and run it to an aggregate result.
    pub async fn run(&self) -> Result<SuiteResult, SuiteError> {
        let options = &self.options;
        if options.tag.is_some() == options.test_ids.is_some() {
            return Err(SuiteError::Validation(
                "exactly one of 'tag' or 'testIds' must be provided".to_string(),
            ));
        }
        if options.concurrency == 0 {
            return Err(SuiteError::Validation(
                "concurrency must be at least 1".to_string(),
            ));
        }

        let tests = self.resolve_tests().await?;
        let total = tests.len();
        info!(total, concurrency = options.concurrency, "Starting suite");
        options.emitter.emit(SuiteEvent::SuiteStart { total });

        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(options.concurrency));
        let stopped = Arc::new(AtomicBool::new(false));
        let parallel = options.concurrency > 1;

        let mut handles = Vec::with_capacity(total);
        for (index, test) in tests.into_iter().enumerate() {
            handles.push(tokio::spawn(run_suite_test(SuiteTask {
                test,
                index,
                parallel,
                stop_on_failure: options.stop_on_failure,
                browser_url: options.browser_url.clone(),
                storage_dir: options.storage_dir.clone(),
                semaphore: semaphore.clone(),
                stopped: stopped.clone(),
                emitter: options.emitter.clone(),
                driver_factory: self.driver_factory.clone(),
            })));
        }

        // results[i] is written exactly once, from task i.
        let mut results: Vec<Option<SuiteTestResult>> = Vec::with_capacity(total);
        results.resize_with(total, || None);
        for (index, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(result) => results[index] = Some(result),
                Err(err) => {
                    warn!(index, error = %err, "Suite task aborted");
                }
            }
        }

        let results: Vec<SuiteTestResult> = results
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| SuiteTestResult {
                    test_id: format!("#{index}"),
                    test_name: None,
                    status: SuiteTestStatus::Failed,
                    duration_ms: 0,
                    error: Some("suite task aborted".to_string()),
                    run_id: None,
                })
            })
            .collect();

        let passed = count(&results, SuiteTestStatus::Passed);
        let failed = count(&results, SuiteTestStatus::Failed);
        let skipped = count(&results, SuiteTestStatus::Skipped);
        let result = SuiteResult {
            status: if failed > 0 { "failed" } else { "passed" }.to_string(),
            total,
            passed,
            failed,
            skipped,
            duration_ms: started.elapsed().as_millis() as u64,
            results,
        };

        info!(passed, failed, skipped, duration_ms = result.duration_ms, "Suite complete");
        options
            .emitter
            .emit(SuiteEvent::SuiteComplete {
                result: result.clone(),
            });
        Ok(result)
    }

    /// Fix the ordered test list `T` that also fixes result ordering.
    async fn resolve_tests(&self) -> Result<Vec<SavedTest>, SuiteError> {
        if let Some(ids) = &self.options.test_ids {
            let mut tests = Vec::with_capacity(ids.len());
            for id in ids {
                match storage::get_test(&self.options.storage_dir, id).await? {
                    Some(test) => tests.push(test),
                    None => {
                        debug!(test_id = %id, "Dropping unknown test id");
                    }
                }
            }
            return Ok(tests);
        }

        let tag = self.options.tag.as_deref();
        Ok(storage::list_tests(&self.options.storage_dir, tag).await?)
    }
}

fn count(results: &[SuiteTestResult], status: SuiteTestStatus) -> usize {
    results.iter().filter(|r| r.status == status).count()
}

struct SuiteTask {
    test: SavedTest,
    index: usize,
    parallel: bool,
    stop_on_failure: bool,
    browser_url: String,
    storage_dir: PathBuf,
    semaphore: Arc<Semaphore>,
    stopped: Arc<AtomicBool>,
    emitter: Emitter<SuiteEvent>,
    driver_factory: DriverFactory,
}

async fn run_suite_test(task: SuiteTask) -> SuiteTestResult {
    let skipped = |task: &SuiteTask| SuiteTestResult {
        test_id: task.test.id.clone(),
        test_name: Some(task.test.name.clone()),
        status: SuiteTestStatus::Skipped,
        duration_ms: 0,
        error: None,
        run_id: None,
    };

    if task.stopped.load(Ordering::SeqCst) {
        return skipped(&task);
    }

    let permit = match task.semaphore.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return skipped(&task),
    };

    // The stop flag may have been set while we waited for a permit.
    if task.stopped.load(Ordering::SeqCst) {
        drop(permit);
        return skipped(&task);
    }

    task.emitter.emit(SuiteEvent::TestStart {
        test_id: task.test.id.clone(),
        test_name: task.test.name.clone(),
        index: task.index,
    });

    // Parallel runs get per-test sessions so their tabs stay isolated;
    // a serial suite shares one session/tab across tests.
    let session_id = if task.parallel {
        format!(
            "suite-{}-{}",
            task.test.id,
            chrono::Utc::now().timestamp_millis()
        )
    } else {
        "suite-shared".to_string()
    };

    let mut run_options = RunOptions::new(task.browser_url.clone());
    run_options.session_id = Some(session_id);
    run_options.create_tab = task.parallel;
    run_options.storage_dir = Some(task.storage_dir.clone());
    run_options.controller = DebugController::disabled();

    let driver = (task.driver_factory)();
    let runner = TestRunner::new(driver, run_options);
    let result = runner.run(&task.test.definition).await;

    let run_id = match storage::save_run(&task.storage_dir, &task.test.id, &result).await {
        Ok(run) => Some(run.id),
        Err(err) => {
            warn!(test_id = %task.test.id, error = %err, "Failed to persist run");
            None
        }
    };

    let status = if result.is_passed() {
        SuiteTestStatus::Passed
    } else {
        SuiteTestStatus::Failed
    };
    let error = result.error().map(|e| e.to_string());

    task.emitter.emit(SuiteEvent::TestComplete {
        test_id: task.test.id.clone(),
        index: task.index,
        status: if result.is_passed() { "passed" } else { "failed" }.to_string(),
        duration_ms: result.duration_ms(),
        error: error.clone(),
    });

    if status == SuiteTestStatus::Failed && task.stop_on_failure {
        task.stopped.store(true, Ordering::SeqCst);
    }

    drop(permit);
    SuiteTestResult {
        test_id: task.test.id.clone(),
        test_name: Some(task.test.name.clone()),
        status,
        duration_ms: result.duration_ms(),
        error,
        run_id,
    }
}
