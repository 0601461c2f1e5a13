//! Suite scheduling: ordered results, bounded concurrency, stop on
//! failure, tag resolution, events and run persistence.

mod common;

use cdp_director::driver::BrowserDriver;
use cdp_director::events::{Emitter, SuiteEvent};
use cdp_director::results::SuiteTestStatus;
use cdp_director::storage;
use cdp_director::suite::{SuiteOptions, SuiteRunner};
use common::{definition, MockDriver, MockState};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tempfile::TempDir;

async fn store_wait_test(dir: &TempDir, name: &str, wait_ms: u64, tags: Vec<String>) -> String {
    let def = definition(&format!(
        r#"
url: "http://{name}.local"
steps:
  - wait: {wait_ms}
"#,
    ));
    storage::save_test(dir.path(), name, None, tags, def)
        .await
        .unwrap()
        .id
}

fn suite(
    dir: &TempDir,
    state: Arc<MockState>,
    configure: impl FnOnce(&mut SuiteOptions),
) -> SuiteRunner {
    let mut options = SuiteOptions::new("http://127.0.0.1:9222", dir.path());
    configure(&mut options);
    SuiteRunner::new(
        options,
        Arc::new(move || {
            Arc::new(MockDriver::with_state(state.clone())) as Arc<dyn BrowserDriver>
        }),
    )
}

#[tokio::test]
async fn results_preserve_input_order_under_concurrency() {
    let dir = TempDir::new().unwrap();
    // Different wait times force out-of-order completion.
    let a = store_wait_test(&dir, "slow", 300, vec![]).await;
    let b = store_wait_test(&dir, "medium", 150, vec![]).await;
    let c = store_wait_test(&dir, "fast", 10, vec![]).await;

    let state = MockState::new();
    let runner = suite(&dir, state.clone(), |options| {
        options.test_ids = Some(vec![a.clone(), b.clone(), c.clone()]);
        options.concurrency = 3;
    });

    let started = Instant::now();
    let result = runner.run().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.total, 3);
    assert_eq!(result.passed, 3);
    assert_eq!(result.status, "passed");
    assert_eq!(result.results[0].test_id, a);
    assert_eq!(result.results[1].test_id, b);
    assert_eq!(result.results[2].test_id, c);

    // All three ran in parallel: wall-clock near the slowest test, not
    // the sum.
    assert!(
        elapsed.as_millis() < 600,
        "expected parallel execution, took {elapsed:?}"
    );
    assert!(state.max_active.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn concurrency_one_serializes_tests() {
    let dir = TempDir::new().unwrap();
    let a = store_wait_test(&dir, "one", 100, vec![]).await;
    let b = store_wait_test(&dir, "two", 100, vec![]).await;

    let state = MockState::new();
    let runner = suite(&dir, state.clone(), |options| {
        options.test_ids = Some(vec![a, b]);
        options.concurrency = 1;
    });

    let started = Instant::now();
    let result = runner.run().await.unwrap();

    assert_eq!(result.passed, 2);
    assert!(started.elapsed().as_millis() >= 200);
    assert_eq!(state.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn parallel_tests_get_isolated_tabs() {
    let dir = TempDir::new().unwrap();
    let a = store_wait_test(&dir, "tab-a", 50, vec![]).await;
    let b = store_wait_test(&dir, "tab-b", 50, vec![]).await;

    let state = MockState::new();
    let runner = suite(&dir, state.clone(), |options| {
        options.test_ids = Some(vec![a.clone(), b.clone()]);
        options.concurrency = 2;
    });
    runner.run().await.unwrap();

    let connects: Vec<String> = state
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("connect:"))
        .collect();
    assert_eq!(connects.len(), 2);
    for connect in &connects {
        assert!(connect.contains(":tab=true:"), "{connect}");
        assert!(connect.contains("session=suite-"), "{connect}");
    }
}

#[tokio::test]
async fn serial_suite_shares_one_session() {
    let dir = TempDir::new().unwrap();
    let a = store_wait_test(&dir, "shared-a", 10, vec![]).await;

    let state = MockState::new();
    let runner = suite(&dir, state.clone(), |options| {
        options.test_ids = Some(vec![a]);
        options.concurrency = 1;
    });
    runner.run().await.unwrap();

    let connect = state
        .calls()
        .into_iter()
        .find(|call| call.starts_with("connect:"))
        .unwrap();
    assert!(connect.contains(":tab=false:"), "{connect}");
    assert!(connect.contains("session=suite-shared"), "{connect}");
}

#[tokio::test]
async fn stop_on_failure_skips_remaining_tests() {
    let dir = TempDir::new().unwrap();

    let failing = storage::save_test(
        dir.path(),
        "failing",
        None,
        vec![],
        definition(
            r##"
url: "http://failing.local"
steps:
  - click: "#broken"
"##,
        ),
    )
    .await
    .unwrap()
    .id;
    let second = store_wait_test(&dir, "second", 10, vec![]).await;
    let third = store_wait_test(&dir, "third", 10, vec![]).await;

    let state = MockState::new();
    state.fail("click:#broken");

    let runner = suite(&dir, state, |options| {
        options.test_ids = Some(vec![failing, second, third]);
        options.concurrency = 1;
        options.stop_on_failure = true;
    });
    let result = runner.run().await.unwrap();

    assert_eq!(result.status, "failed");
    assert_eq!(result.failed, 1);
    assert_eq!(result.skipped, 2);
    assert_eq!(result.results[0].status, SuiteTestStatus::Failed);
    assert_eq!(result.results[1].status, SuiteTestStatus::Skipped);
    assert_eq!(result.results[2].status, SuiteTestStatus::Skipped);
    assert_eq!(result.results[1].duration_ms, 0);
}

#[tokio::test]
async fn unknown_ids_are_silently_dropped() {
    let dir = TempDir::new().unwrap();
    let a = store_wait_test(&dir, "known", 10, vec![]).await;

    let runner = suite(&dir, MockState::new(), |options| {
        options.test_ids = Some(vec![a.clone(), "missing".to_string()]);
    });
    let result = runner.run().await.unwrap();

    assert_eq!(result.total, 1);
    assert_eq!(result.results[0].test_id, a);
}

#[tokio::test]
async fn tag_resolution_selects_matching_tests() {
    let dir = TempDir::new().unwrap();
    store_wait_test(&dir, "smoke-login", 10, vec!["smoke".to_string()]).await;
    store_wait_test(&dir, "smoke-search", 10, vec!["smoke".to_string()]).await;
    store_wait_test(&dir, "nightly-audit", 10, vec!["nightly".to_string()]).await;

    let runner = suite(&dir, MockState::new(), |options| {
        options.tag = Some("smoke".to_string());
    });
    let result = runner.run().await.unwrap();

    assert_eq!(result.total, 2);
    assert!(result
        .results
        .iter()
        .all(|r| r.test_id.starts_with("smoke-")));
}

#[tokio::test]
async fn exactly_one_selector_is_required() {
    let dir = TempDir::new().unwrap();

    let both = suite(&dir, MockState::new(), |options| {
        options.tag = Some("x".to_string());
        options.test_ids = Some(vec!["y".to_string()]);
    });
    assert!(both.run().await.is_err());

    let neither = suite(&dir, MockState::new(), |_| {});
    assert!(neither.run().await.is_err());
}

#[tokio::test]
async fn suite_events_are_emitted_in_order() {
    let dir = TempDir::new().unwrap();
    let a = store_wait_test(&dir, "evt-a", 10, vec![]).await;
    let b = store_wait_test(&dir, "evt-b", 10, vec![]).await;

    let events: Arc<Mutex<Vec<SuiteEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();

    let runner = suite(&dir, MockState::new(), |options| {
        options.test_ids = Some(vec![a, b]);
        options.concurrency = 2;
        options.emitter = Emitter::new(move |event| sink.lock().unwrap().push(event));
    });
    runner.run().await.unwrap();

    let events = events.lock().unwrap();
    assert!(matches!(events[0], SuiteEvent::SuiteStart { total: 2 }));
    assert!(matches!(
        events.last().unwrap(),
        SuiteEvent::SuiteComplete { .. }
    ));

    // Per test id, start precedes complete.
    for index in 0..2 {
        let start = events.iter().position(|event| {
            matches!(event, SuiteEvent::TestStart { index: i, .. } if *i == index)
        });
        let complete = events.iter().position(|event| {
            matches!(event, SuiteEvent::TestComplete { index: i, .. } if *i == index)
        });
        assert!(start.unwrap() < complete.unwrap());
    }
}

#[tokio::test]
async fn suite_persists_run_records() {
    let dir = TempDir::new().unwrap();
    let a = store_wait_test(&dir, "persisted", 10, vec![]).await;

    let runner = suite(&dir, MockState::new(), |options| {
        options.test_ids = Some(vec![a.clone()]);
    });
    let result = runner.run().await.unwrap();

    assert!(result.results[0].run_id.is_some());
    let runs = storage::list_runs(dir.path(), &a, None, None).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, "passed");
}
