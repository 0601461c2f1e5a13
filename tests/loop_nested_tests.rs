//! Loop iteration semantics, failure breadcrumbs and nested test
//! execution (shared variables, cycle detection).

mod common;

use cdp_director::results::LoopFrame;
use cdp_director::runner::{RunOptions, TestRunner};
use cdp_director::{storage, TestResult};
use common::{definition, MockDriver, MockState};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn runner_with(state: Arc<MockState>, options: RunOptions) -> TestRunner {
    TestRunner::new(Arc::new(MockDriver::with_state(state)), options)
}

#[tokio::test]
async fn loop_failure_carries_iteration_context() {
    let state = MockState::new();
    state.set_strict();
    state.script("['x','y']", json!(["x", "y"]));
    state.script("true", json!(true));
    state.fail_on_occurrence("click:.btn", 2);

    let def = definition(
        r#"
url: "http://app.local"
steps:
  - loop:
      over: "['x','y']"
      steps:
        - eval: "true"
        - click: ".btn"
          label: "Click submit"
"#,
    );

    let result = runner_with(state, RunOptions::new("http://127.0.0.1:9222"))
        .run(&def)
        .await;

    match result {
        TestResult::Failed {
            error,
            loop_context,
            failed_step,
            ..
        } => {
            assert!(error.contains("Loop iteration 1"), "{error}");
            assert!(error.contains("Click submit"), "{error}");
            assert!(error.contains("scripted failure"), "{error}");
            assert_eq!(failed_step, 0);
            assert_eq!(
                loop_context,
                vec![LoopFrame {
                    iteration: 1,
                    step: 1,
                    label: Some("Click submit".to_string()),
                }]
            );
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn loop_over_empty_array_passes() {
    let state = MockState::new();
    state.set_strict();
    state.script("[]", json!([]));

    let def = definition(
        r##"
url: "http://app.local"
steps:
  - loop:
      over: "[]"
      steps:
        - click: "#never"
"##,
    );

    let result = runner_with(state.clone(), RunOptions::new("http://127.0.0.1:9222"))
        .run(&def)
        .await;
    assert!(result.is_passed(), "{result:?}");
    assert_eq!(state.call_count("click:#never"), 0);
}

#[tokio::test]
async fn loop_seeds_item_and_index_each_iteration() {
    let state = MockState::new();
    state.set_strict();
    state.script("[10,20]", json!([10, 20]));
    state.script("10+0", json!(10));
    state.script("20+1", json!(21));

    let def = definition(
        r#"
url: "http://app.local"
steps:
  - loop:
      over: "[10,20]"
      steps:
        - eval: "$vars.item+$vars.index"
"#,
    );

    let result = runner_with(state, RunOptions::new("http://127.0.0.1:9222"))
        .run(&def)
        .await;
    assert!(result.is_passed(), "{result:?}");
}

#[tokio::test]
async fn loop_body_variables_propagate_to_outer_scope() {
    let state = MockState::new();
    state.set_strict();
    state.script("[1,2]", json!([1, 2]));
    state.script("1", json!(1));
    state.script("1===1", json!(true));

    let def = definition(
        r#"
url: "http://app.local"
steps:
  - loop:
      over: "[1,2]"
      steps:
        - eval: "1"
          as: last
  - eval: "$vars.last===1"
"#,
    );

    let result = runner_with(state, RunOptions::new("http://127.0.0.1:9222"))
        .run(&def)
        .await;
    assert!(result.is_passed(), "{result:?}");
}

#[tokio::test]
async fn loop_over_respects_max() {
    let state = MockState::new();
    state.set_strict();
    state.script("[1,2,3,4]", json!([1, 2, 3, 4]));

    let def = definition(
        r##"
url: "http://app.local"
steps:
  - loop:
      over: "[1,2,3,4]"
      max: 2
      steps:
        - click: "#each"
"##,
    );

    let result = runner_with(state.clone(), RunOptions::new("http://127.0.0.1:9222"))
        .run(&def)
        .await;
    assert!(result.is_passed(), "{result:?}");
    assert_eq!(state.call_count("click:#each"), 2);
}

#[tokio::test]
async fn loop_while_is_bounded_by_max() {
    let state = MockState::new();

    let def = definition(
        r##"
url: "http://app.local"
steps:
  - loop:
      while: "true"
      max: 3
      steps:
        - click: "#spin"
"##,
    );

    let result = runner_with(state.clone(), RunOptions::new("http://127.0.0.1:9222"))
        .run(&def)
        .await;
    assert!(result.is_passed(), "{result:?}");
    assert_eq!(state.call_count("click:#spin"), 3);
}

#[tokio::test]
async fn loop_while_without_max_fails() {
    let def = definition(
        r##"
url: "http://app.local"
steps:
  - loop:
      while: "true"
      steps:
        - click: "#never"
"##,
    );

    let result = runner_with(MockState::new(), RunOptions::new("http://127.0.0.1:9222"))
        .run(&def)
        .await;

    match result {
        TestResult::Failed { error, .. } => {
            assert!(error.contains("'while' requires 'max'"), "{error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn loop_requires_exactly_one_source() {
    let def = definition(
        r##"
url: "http://app.local"
steps:
  - loop:
      steps:
        - click: "#never"
"##,
    );

    let result = runner_with(MockState::new(), RunOptions::new("http://127.0.0.1:9222"))
        .run(&def)
        .await;

    match result {
        TestResult::Failed { error, .. } => {
            assert!(error.contains("exactly one of 'over' or 'while'"), "{error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

fn options_with_store(dir: &TempDir) -> RunOptions {
    let mut options = RunOptions::new("http://127.0.0.1:9222");
    options.storage_dir = Some(dir.path().to_path_buf());
    options
}

#[tokio::test]
async fn nested_test_shares_variables_both_ways() {
    let dir = TempDir::new().unwrap();
    storage::save_test(
        dir.path(),
        "child",
        None,
        vec![],
        definition(
            r#"
url: "http://child.local"
steps:
  - eval: "'abc'"
  - eval: "42"
    as: answer
"#,
        ),
    )
    .await
    .unwrap();

    let state = MockState::new();
    state.set_strict();
    state.script("'abc'", json!("abc"));
    state.script("42", json!(42));
    state.script("42===42", json!(true));

    let def = definition(
        r#"
url: "http://parent.local"
steps:
  - run_test: "child"
  - eval: "$vars.answer===42"
"#,
    );

    let result = runner_with(state.clone(), options_with_store(&dir))
        .run(&def)
        .await;
    assert!(result.is_passed(), "{result:?}");
    assert_eq!(state.call_count("navigate:http://child.local"), 1);
}

#[tokio::test]
async fn nested_failure_is_wrapped_with_location() {
    let dir = TempDir::new().unwrap();
    storage::save_test(
        dir.path(),
        "child",
        None,
        vec![],
        definition(
            r##"
url: "http://child.local"
steps:
  - click: "#missing"
    label: "Press the thing"
"##,
        ),
    )
    .await
    .unwrap();

    let state = MockState::new();
    state.fail("click:#missing");

    let def = definition(
        r#"
url: "http://parent.local"
steps:
  - run_test: "child"
"#,
    );

    let result = runner_with(state, options_with_store(&dir))
        .run(&def)
        .await;

    match result {
        TestResult::Failed { error, .. } => {
            assert!(error.contains("Sub-test child failed at"), "{error}");
            assert!(error.contains("step 0"), "{error}");
            assert!(error.contains("Press the thing"), "{error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn nested_cycle_is_detected() {
    let dir = TempDir::new().unwrap();
    storage::save_test(
        dir.path(),
        "alpha",
        None,
        vec![],
        definition(
            r#"
url: "http://alpha.local"
steps:
  - run_test: "beta"
"#,
        ),
    )
    .await
    .unwrap();
    storage::save_test(
        dir.path(),
        "beta",
        None,
        vec![],
        definition(
            r#"
url: "http://beta.local"
steps:
  - run_test: "alpha"
"#,
        ),
    )
    .await
    .unwrap();

    let def = definition(
        r#"
url: "http://root.local"
steps:
  - run_test: "alpha"
"#,
    );

    let result = runner_with(MockState::new(), options_with_store(&dir))
        .run(&def)
        .await;

    match result {
        TestResult::Failed {
            error, error_kind, ..
        } => {
            assert!(error.contains("Cycle detected"), "{error}");
            assert!(error.contains("alpha -> beta -> alpha"), "{error}");
            assert_eq!(error_kind, "cycle_error");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn nested_unknown_test_fails() {
    let dir = TempDir::new().unwrap();

    let def = definition(
        r#"
url: "http://parent.local"
steps:
  - run_test: "ghost"
"#,
    );

    let result = runner_with(MockState::new(), options_with_store(&dir))
        .run(&def)
        .await;

    match result {
        TestResult::Failed { error, .. } => {
            assert!(error.contains("'ghost' not found"), "{error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn nested_empty_id_fails() {
    let def = definition(
        r#"
url: "http://parent.local"
steps:
  - run_test: "  "
"#,
    );

    let result = runner_with(MockState::new(), RunOptions::new("http://127.0.0.1:9222"))
        .run(&def)
        .await;

    match result {
        TestResult::Failed { error, .. } => {
            assert!(error.contains("non-empty test id"), "{error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}
