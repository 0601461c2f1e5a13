//! Execution result shapes: per-test results, persisted runs, suite
//! aggregates.
//!
//! These are wire types: they serialize as camelCase JSON and are
//! consumed verbatim by front-ends, so field names are part of the
//! compatibility surface.

use crate::definition::Step;
use crate::driver::{ConsoleEntry, NetworkEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where inside a nested loop a failure occurred; outermost frame first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoopFrame {
    /// 0-based iteration of the loop.
    pub iteration: u64,

    /// 0-based body-step index.
    pub step: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Outcome of a single test execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TestResult {
    #[serde(rename_all = "camelCase")]
    Passed {
        steps_completed: usize,
        duration_ms: u64,

        #[serde(default)]
        console_log: Vec<ConsoleEntry>,

        #[serde(default)]
        network_log: Vec<NetworkEntry>,

        /// Step index → captured DOM, for steps with `captureDom`.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        dom_snapshots: BTreeMap<i64, String>,
    },

    #[serde(rename_all = "camelCase")]
    Failed {
        /// Failing step index. Main steps are 0-based; before-hook i is
        /// `-(i+1)`, after-hook i is `-(100+i)`, a test-wide timeout is
        /// `-1` with no hook attribution.
        failed_step: i64,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        failed_label: Option<String>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_definition: Option<Step>,

        error: String,

        /// Stable category label, see [`crate::errors::ErrorKind`].
        error_kind: String,

        #[serde(default)]
        console_log: Vec<ConsoleEntry>,

        #[serde(default)]
        network_log: Vec<NetworkEntry>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        dom_snapshot: Option<String>,

        /// Base64 PNG captured at the moment of failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        screenshot: Option<String>,

        duration_ms: u64,

        /// Loop breadcrumb, outermost frame first.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        loop_context: Vec<LoopFrame>,
    },
}

impl TestResult {
    /// True for a passed result.
    pub fn is_passed(&self) -> bool {
        matches!(self, TestResult::Passed { .. })
    }

    /// The wire status string.
    pub fn status(&self) -> &'static str {
        match self {
            TestResult::Passed { .. } => "passed",
            TestResult::Failed { .. } => "failed",
        }
    }

    /// Total execution time.
    pub fn duration_ms(&self) -> u64 {
        match self {
            TestResult::Passed { duration_ms, .. } => *duration_ms,
            TestResult::Failed { duration_ms, .. } => *duration_ms,
        }
    }

    /// The failure message, when failed.
    pub fn error(&self) -> Option<&str> {
        match self {
            TestResult::Passed { .. } => None,
            TestResult::Failed { error, .. } => Some(error),
        }
    }
}

/// A persisted record of one test execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRun {
    pub id: String,
    pub test_id: String,
    pub status: String,
    pub result: TestResult,
    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Terminal status of one suite member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuiteTestStatus {
    Passed,
    Failed,
    Skipped,
}

/// One entry of a suite result, at the index of the requested test id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteTestResult {
    pub test_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,

    pub status: SuiteTestStatus,
    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Persisted run id, when the run record was saved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

/// Aggregate outcome of a suite execution. `results[i]` corresponds to
/// the i-th resolved test regardless of completion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteResult {
    pub status: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub results: Vec<SuiteTestResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_status_tagging() {
        let result = TestResult::Passed {
            steps_completed: 3,
            duration_ms: 120,
            console_log: vec![],
            network_log: vec![],
            dom_snapshots: BTreeMap::new(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "passed");
        assert_eq!(json["stepsCompleted"], 3);
        assert_eq!(json["durationMs"], 120);
    }

    #[test]
    fn test_failed_result_wire_shape() {
        let result = TestResult::Failed {
            failed_step: 2,
            failed_label: Some("Click submit".into()),
            step_definition: None,
            error: "element not found: .btn".into(),
            error_kind: "driver_error".into(),
            console_log: vec![],
            network_log: vec![],
            dom_snapshot: None,
            screenshot: None,
            duration_ms: 45,
            loop_context: vec![LoopFrame {
                iteration: 1,
                step: 1,
                label: Some("Click submit".into()),
            }],
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["failedStep"], 2);
        assert_eq!(json["failedLabel"], "Click submit");
        assert_eq!(json["loopContext"][0]["iteration"], 1);
    }

    #[test]
    fn test_suite_result_roundtrip() {
        let suite = SuiteResult {
            status: "failed".into(),
            total: 2,
            passed: 1,
            failed: 1,
            skipped: 0,
            duration_ms: 900,
            results: vec![
                SuiteTestResult {
                    test_id: "login".into(),
                    test_name: Some("Login".into()),
                    status: SuiteTestStatus::Passed,
                    duration_ms: 400,
                    error: None,
                    run_id: None,
                },
                SuiteTestResult {
                    test_id: "checkout".into(),
                    test_name: None,
                    status: SuiteTestStatus::Failed,
                    duration_ms: 500,
                    error: Some("boom".into()),
                    run_id: None,
                },
            ],
        };
        let json = serde_json::to_string(&suite).unwrap();
        let back: SuiteResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.results[0].test_id, "login");
        assert_eq!(back.results[1].status, SuiteTestStatus::Failed);
    }
}
