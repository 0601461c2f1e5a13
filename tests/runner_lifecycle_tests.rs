//! Integration tests for the per-test lifecycle: hook phasing,
//! variable capture, conditional skips, resume semantics, timeouts and
//! after-hook guarantees.

mod common;

use cdp_director::events::{Emitter, RunEvent};
use cdp_director::runner::{RunOptions, TestRunner};
use cdp_director::TestResult;
use common::{definition, MockDriver, MockState};
use serde_json::json;
use std::sync::{Arc, Mutex};

fn runner_with(state: Arc<MockState>, options: RunOptions) -> TestRunner {
    TestRunner::new(Arc::new(MockDriver::with_state(state)), options)
}

fn capture_events() -> (Emitter<RunEvent>, Arc<Mutex<Vec<RunEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    (
        Emitter::new(move |event| sink.lock().unwrap().push(event)),
        events,
    )
}

#[tokio::test]
async fn variable_chain_passes() {
    let state = MockState::new();
    state.set_strict();
    state.script("1+1", json!(2));
    state.script("2*2", json!(4));
    state.script("4===4", json!(true));

    let def = definition(
        r##"
url: "http://app.local"
steps:
  - eval: "1+1"
    as: sum
  - eval: "$vars.sum*2"
    as: d
  - eval: "$vars.d===4"
"##,
    );

    let runner = runner_with(state, RunOptions::new("http://127.0.0.1:9222"));
    let result = runner.run(&def).await;

    match result {
        TestResult::Passed {
            steps_completed, ..
        } => assert_eq!(steps_completed, 3),
        other => panic!("expected pass, got {other:?}"),
    }
}

#[tokio::test]
async fn conditional_skip_leaves_vars_unset() {
    let state = MockState::new();
    state.set_strict();
    state.script("!!(false)", json!(false));
    state.script("true", json!(true));
    // $vars.v stays unset, so it interpolates to the empty string.
    state.script("''===''", json!(true));

    let def = definition(
        r##"
url: "http://app.local"
steps:
  - eval: "'x'"
    as: v
    if: "false"
  - eval: "true"
  - eval: "'$vars.v'===''"
"##,
    );

    let (emitter, events) = capture_events();
    let mut options = RunOptions::new("http://127.0.0.1:9222");
    options.emitter = emitter;
    let result = runner_with(state, options).run(&def).await;

    assert!(result.is_passed(), "{result:?}");

    let events = events.lock().unwrap();
    let skipped = events.iter().any(|event| {
        matches!(
            event,
            RunEvent::StepPass {
                step_index: 0,
                skipped: true,
                ..
            }
        )
    });
    assert!(skipped, "step 0 should report skipped=true");
}

#[tokio::test]
async fn resume_with_variable_hazard_restarts_from_zero() {
    let state = MockState::new();
    state.set_strict();
    state.script("1+1", json!(2));
    state.script("2>1", json!(true));

    let def = definition(
        r##"
url: "http://app.local"
resumeFrom: 1
steps:
  - eval: "1+1"
    as: r
  - eval: "$vars.r>1"
"##,
    );

    let (emitter, events) = capture_events();
    let mut options = RunOptions::new("http://127.0.0.1:9222");
    options.emitter = emitter;
    let result = runner_with(state, options).run(&def).await;

    match result {
        TestResult::Passed {
            steps_completed, ..
        } => assert_eq!(steps_completed, 2),
        other => panic!("expected pass, got {other:?}"),
    }

    let events = events.lock().unwrap();
    let warned = events.iter().any(|event| {
        matches!(event, RunEvent::Warning { message }
            if message.contains("Skipped steps contain variable storage"))
    });
    assert!(warned, "the variable hazard warning should be emitted");
}

#[tokio::test]
async fn resume_skips_clean_prefix() {
    let state = MockState::new();

    let def = definition(
        r##"
url: "http://app.local"
resumeFrom: 1
steps:
  - click: "#skipped"
  - click: "#executed"
"##,
    );

    let result = runner_with(state.clone(), RunOptions::new("http://127.0.0.1:9222"))
        .run(&def)
        .await;

    match result {
        TestResult::Passed {
            steps_completed, ..
        } => assert_eq!(steps_completed, 1),
        other => panic!("expected pass, got {other:?}"),
    }
    assert_eq!(state.call_count("click:#skipped"), 0);
    assert_eq!(state.call_count("click:#executed"), 1);
}

#[tokio::test]
async fn resume_out_of_bounds_fails() {
    let def = definition(
        r##"
url: "http://app.local"
resumeFrom: 5
steps:
  - eval: "true"
"##,
    );

    let result = runner_with(MockState::new(), RunOptions::new("http://127.0.0.1:9222"))
        .run(&def)
        .await;

    match result {
        TestResult::Failed { error, .. } => {
            assert!(error.contains("out of bounds"), "{error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn mock_hooks_arm_before_navigation() {
    let state = MockState::new();

    let def = definition(
        r##"
url: "http://app.local"
before:
  - click: "#late-setup"
  - mock_network:
      pattern: "*/api/*"
      status: 200
      body:
        ok: true
steps:
  - click: "#main"
"##,
    );

    let result = runner_with(state.clone(), RunOptions::new("http://127.0.0.1:9222"))
        .run(&def)
        .await;
    assert!(result.is_passed(), "{result:?}");

    let calls = state.calls();
    let mock_at = calls
        .iter()
        .position(|c| c.starts_with("add_mock_rule:"))
        .expect("mock rule armed");
    let navigate_at = calls
        .iter()
        .position(|c| c.starts_with("navigate:"))
        .expect("navigation happened");
    let late_at = calls
        .iter()
        .position(|c| c == "click:#late-setup")
        .expect("phase C hook ran");
    let main_at = calls
        .iter()
        .position(|c| c == "click:#main")
        .expect("main step ran");

    assert!(mock_at < navigate_at, "mocks must be armed pre-navigation");
    assert!(navigate_at < late_at, "phase C runs after navigation");
    assert!(late_at < main_at, "hooks run before main steps");
}

#[tokio::test]
async fn before_hook_failure_uses_negative_index() {
    let state = MockState::new();
    state.fail("click:#setup");

    let def = definition(
        r##"
url: "http://app.local"
before:
  - click: "#setup"
steps:
  - click: "#never"
"##,
    );

    let result = runner_with(state.clone(), RunOptions::new("http://127.0.0.1:9222"))
        .run(&def)
        .await;

    match result {
        TestResult::Failed { failed_step, .. } => assert_eq!(failed_step, -1),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(state.call_count("click:#never"), 0);
}

#[tokio::test]
async fn after_hooks_run_on_pass_fail_and_timeout() {
    // Pass path.
    let state = MockState::new();
    let def = definition(
        r##"
url: "http://app.local"
steps:
  - click: "#ok"
after:
  - click: "#cleanup"
"##,
    );
    let result = runner_with(state.clone(), RunOptions::new("http://127.0.0.1:9222"))
        .run(&def)
        .await;
    assert!(result.is_passed());
    assert_eq!(state.call_count("click:#cleanup"), 1);

    // Fail path.
    let state = MockState::new();
    state.fail("click:#boom");
    let def = definition(
        r##"
url: "http://app.local"
steps:
  - click: "#boom"
after:
  - click: "#cleanup"
"##,
    );
    let result = runner_with(state.clone(), RunOptions::new("http://127.0.0.1:9222"))
        .run(&def)
        .await;
    assert!(!result.is_passed());
    assert_eq!(state.call_count("click:#cleanup"), 1);

    // Timeout path.
    let state = MockState::new();
    let def = definition(
        r##"
url: "http://app.local"
timeout: 200
steps:
  - wait: 10000
after:
  - click: "#cleanup"
"##,
    );
    let result = runner_with(state.clone(), RunOptions::new("http://127.0.0.1:9222"))
        .run(&def)
        .await;
    match result {
        TestResult::Failed {
            failed_step, error, ..
        } => {
            assert_eq!(failed_step, -1);
            assert_eq!(error, "Test timed out after 200ms");
        }
        other => panic!("expected timeout failure, got {other:?}"),
    }
    assert_eq!(state.call_count("click:#cleanup"), 1);
}

#[tokio::test]
async fn after_hook_failure_never_changes_result() {
    let state = MockState::new();
    state.fail("click:#flaky-cleanup");

    let def = definition(
        r##"
url: "http://app.local"
steps:
  - click: "#ok"
after:
  - click: "#flaky-cleanup"
"##,
    );

    let result = runner_with(state, RunOptions::new("http://127.0.0.1:9222"))
        .run(&def)
        .await;
    assert!(result.is_passed(), "{result:?}");
}

#[tokio::test]
async fn failure_collects_diagnostics() {
    let state = MockState::new();
    state.fail("click:#broken");
    state.console.lock().unwrap().push(cdp_director::driver::ConsoleEntry {
        level: "error".to_string(),
        text: "boom".to_string(),
        timestamp: 10,
    });
    state.console.lock().unwrap().push(cdp_director::driver::ConsoleEntry {
        level: "log".to_string(),
        text: "later".to_string(),
        timestamp: 20,
    });

    let def = definition(
        r##"
url: "http://app.local"
steps:
  - click: "#broken"
    label: "Click broken"
"##,
    );

    let result = runner_with(state, RunOptions::new("http://127.0.0.1:9222"))
        .run(&def)
        .await;

    match result {
        TestResult::Failed {
            failed_step,
            failed_label,
            console_log,
            dom_snapshot,
            screenshot,
            ..
        } => {
            assert_eq!(failed_step, 0);
            assert_eq!(failed_label.as_deref(), Some("Click broken"));
            // Newest first.
            assert_eq!(console_log[0].timestamp, 20);
            assert_eq!(console_log[1].timestamp, 10);
            assert!(dom_snapshot.is_some());
            assert!(screenshot.is_some());
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn diagnostic_capture_failure_keeps_primary_error() {
    let state = MockState::new();
    state.fail("click:#broken");
    state.fail("screenshot:");
    state.fail("dom_snapshot:");

    let def = definition(
        r##"
url: "http://app.local"
steps:
  - click: "#broken"
"##,
    );

    let result = runner_with(state, RunOptions::new("http://127.0.0.1:9222"))
        .run(&def)
        .await;

    match result {
        TestResult::Failed {
            error,
            screenshot,
            dom_snapshot,
            ..
        } => {
            assert!(error.contains("scripted failure for click:#broken"));
            assert!(screenshot.is_none());
            assert!(dom_snapshot.is_none());
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn capture_dom_fills_snapshots() {
    let state = MockState::new();

    let def = definition(
        r##"
url: "http://app.local"
steps:
  - click: "#ok"
    captureDom: true
"##,
    );

    let result = runner_with(state, RunOptions::new("http://127.0.0.1:9222"))
        .run(&def)
        .await;

    match result {
        TestResult::Passed { dom_snapshots, .. } => {
            assert!(dom_snapshots.contains_key(&0));
        }
        other => panic!("expected pass, got {other:?}"),
    }
}

#[tokio::test]
async fn verify_page_reports_failing_check() {
    let state = MockState::new();
    state.set_strict();
    state.script("!!document.querySelector(\"#app\")", json!(false));

    let def = definition(
        r##"
url: "http://app.local"
verifyPage:
  selector: "#app"
  timeout: 250
steps:
  - eval: "true"
"##,
    );

    let result = runner_with(state, RunOptions::new("http://127.0.0.1:9222"))
        .run(&def)
        .await;

    match result {
        TestResult::Failed { error, .. } => {
            assert!(error.contains("selector '#app' not present"), "{error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_step_type_fails() {
    let state = MockState::new();

    let def = definition(
        r##"
url: "http://app.local"
steps:
  - frobnicate: "yes"
"##,
    );

    let result = runner_with(state, RunOptions::new("http://127.0.0.1:9222"))
        .run(&def)
        .await;

    match result {
        TestResult::Failed {
            error, error_kind, ..
        } => {
            assert_eq!(error, "unknown step type");
            assert_eq!(error_kind, "validation_error");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn required_input_missing_fails() {
    let def = definition(
        r##"
url: "http://app.local"
inputs:
  - name: token
    required: true
steps:
  - eval: "true"
"##,
    );

    let result = runner_with(MockState::new(), RunOptions::new("http://127.0.0.1:9222"))
        .run(&def)
        .await;

    match result {
        TestResult::Failed { error, .. } => {
            assert!(error.contains("token"), "{error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn inputs_seed_variables() {
    let state = MockState::new();
    state.set_strict();
    state.script("'guest'==='guest'", json!(true));

    let def = definition(
        r##"
url: "http://app.local"
inputs:
  - name: user
    default: "guest"
steps:
  - eval: "'$vars.user'==='guest'"
"##,
    );

    let result = runner_with(state, RunOptions::new("http://127.0.0.1:9222"))
        .run(&def)
        .await;
    assert!(result.is_passed(), "{result:?}");
}

#[tokio::test]
async fn step_value_from_screenshot_is_stored() {
    let state = MockState::new();
    state.set_strict();
    state.script("'iVBORw0KGgo='.length > 0", json!(true));

    let def = definition(
        r##"
url: "http://app.local"
steps:
  - screenshot: true
    as: shot
  - eval: "'$vars.shot'.length > 0"
"##,
    );

    let result = runner_with(state, RunOptions::new("http://127.0.0.1:9222"))
        .run(&def)
        .await;
    assert!(result.is_passed(), "{result:?}");
}

#[tokio::test]
async fn event_ordering_per_step() {
    let state = MockState::new();

    let def = definition(
        r##"
url: "http://app.local"
steps:
  - click: "#a"
  - click: "#b"
"##,
    );

    let (emitter, events) = capture_events();
    let mut options = RunOptions::new("http://127.0.0.1:9222");
    options.emitter = emitter;
    let result = runner_with(state, options).run(&def).await;
    assert!(result.is_passed());

    // step:start(i) < step:pass(i) < step:start(i+1) for main steps.
    let sequence: Vec<(String, i64)> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            RunEvent::StepStart { step_index, .. } if *step_index >= 0 => {
                Some(("start".to_string(), *step_index))
            }
            RunEvent::StepPass { step_index, .. } if *step_index >= 0 => {
                Some(("pass".to_string(), *step_index))
            }
            _ => None,
        })
        .collect();

    assert_eq!(
        sequence,
        vec![
            ("start".to_string(), 0),
            ("pass".to_string(), 0),
            ("start".to_string(), 1),
            ("pass".to_string(), 1),
        ]
    );
}
