//! Environment-driven entry point.
//!
//! Configuration comes from environment variables:
//!
//! - `CHROME_URL` — browser debug endpoint (default `http://127.0.0.1:9222`)
//! - `DIRECTOR_STORAGE_DIR` — storage root (default `./director-data`)
//! - exactly one of:
//!   - `TEST_FILE` — run a standalone YAML/JSON definition file
//!   - `TEST_ID` — run one stored test
//!   - `TEST_IDS` — comma-separated stored test ids, run as a suite
//!   - `SUITE_TAG` — run every stored test with this tag
//! - `CONCURRENCY` — parallel tests for suites (default 1)
//! - `STOP_ON_FAILURE` — `true` to stop a suite at the first failure
//! - `STEP_DELAY_MS` — pacing delay between steps of a single run
//!
//! The result prints to stdout as pretty JSON; the exit code is
//! non-zero when the test or suite failed.

use cdp_director::chrome::ChromeDriver;
use cdp_director::debug_control::{DebugConfig, DebugController};
use cdp_director::driver::BrowserDriver;
use cdp_director::events::Emitter;
use cdp_director::runner::{RunOptions, TestRunner};
use cdp_director::session::SessionManager;
use cdp_director::suite::{SuiteOptions, SuiteRunner};
use cdp_director::{storage, TestResult};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let chrome_url =
        env::var("CHROME_URL").unwrap_or_else(|_| "http://127.0.0.1:9222".to_string());
    let storage_dir = PathBuf::from(
        env::var("DIRECTOR_STORAGE_DIR").unwrap_or_else(|_| "./director-data".to_string()),
    );

    let test_file = env::var("TEST_FILE").ok();
    let test_id = env::var("TEST_ID").ok();
    let test_ids = env::var("TEST_IDS").ok();
    let suite_tag = env::var("SUITE_TAG").ok();

    let selectors = [&test_file, &test_id, &test_ids, &suite_tag]
        .iter()
        .filter(|v| v.is_some())
        .count();
    if selectors != 1 {
        return Err(
            "Set exactly one of TEST_FILE, TEST_ID, TEST_IDS or SUITE_TAG".into()
        );
    }

    let sessions = Arc::new(SessionManager::load(&storage_dir).await);

    // Suite modes.
    if test_ids.is_some() || suite_tag.is_some() {
        let concurrency: usize = env::var("CONCURRENCY")
            .unwrap_or_else(|_| "1".to_string())
            .parse()
            .map_err(|_| "CONCURRENCY must be a valid number")?;
        let stop_on_failure = env::var("STOP_ON_FAILURE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let mut options = SuiteOptions::new(chrome_url, storage_dir);
        options.concurrency = concurrency.max(1);
        options.stop_on_failure = stop_on_failure;
        options.tag = suite_tag;
        options.test_ids = test_ids
            .map(|ids| ids.split(',').map(|id| id.trim().to_string()).collect());
        options.emitter = Emitter::disabled();

        let factory_sessions = sessions.clone();
        let runner = SuiteRunner::new(
            options,
            Arc::new(move || {
                Arc::new(ChromeDriver::new(Some(factory_sessions.clone())))
                    as Arc<dyn BrowserDriver>
            }),
        );

        let result = runner.run().await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        if result.failed > 0 {
            std::process::exit(1);
        }
        return Ok(());
    }

    // Single-test modes.
    let definition = if let Some(path) = test_file {
        storage::load_definition(&PathBuf::from(path)).await?
    } else {
        let id = test_id.unwrap_or_default();
        storage::get_test(&storage_dir, &id)
            .await?
            .ok_or_else(|| format!("Test '{id}' not found"))?
            .definition
    };

    let step_delay_ms: u64 = env::var("STEP_DELAY_MS")
        .unwrap_or_else(|_| "0".to_string())
        .parse()
        .map_err(|_| "STEP_DELAY_MS must be a valid number")?;

    let mut options = RunOptions::new(chrome_url);
    options.storage_dir = Some(storage_dir);
    options.controller = Arc::new(DebugController::new(DebugConfig {
        step_delay: Duration::from_millis(step_delay_ms),
        ..Default::default()
    }));

    let driver = Arc::new(ChromeDriver::new(Some(sessions)));
    let runner = TestRunner::new(driver, options);
    let result = runner.run(&definition).await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !matches!(result, TestResult::Passed { .. }) {
        std::process::exit(1);
    }
    Ok(())
}
