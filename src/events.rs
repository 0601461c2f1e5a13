//! Typed execution events and the isolated listener seam.
//!
//! One listener per run. Events for one test are emitted in
//! happens-before order with the steps they describe; a listener that
//! panics never disturbs execution.

use crate::driver::{ConsoleEntry, NetworkEntry};
use crate::results::SuiteResult;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Per-test events streamed to the GUI/CLI.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum RunEvent {
    #[serde(rename = "step:start")]
    #[serde(rename_all = "camelCase")]
    StepStart {
        /// Main steps are 0-based; before-hook i is `-(i+1)`, after-hook
        /// i is `-(100+i)`.
        step_index: i64,
        label: String,
        nested: bool,
    },

    #[serde(rename = "step:pass")]
    #[serde(rename_all = "camelCase")]
    StepPass {
        step_index: i64,
        label: String,
        duration_ms: u64,

        #[serde(skip_serializing_if = "std::ops::Not::not")]
        skipped: bool,
    },

    #[serde(rename = "step:fail")]
    #[serde(rename_all = "camelCase")]
    StepFail {
        step_index: i64,
        label: String,
        duration_ms: u64,
        error: String,
    },

    #[serde(rename = "console")]
    Console { entry: ConsoleEntry },

    #[serde(rename = "network")]
    Network { entry: NetworkEntry },

    /// A non-fatal notice, e.g. the resumeFrom variable hazard.
    #[serde(rename = "warning")]
    Warning { message: String },
}

/// Suite-level events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SuiteEvent {
    #[serde(rename = "suite:start")]
    SuiteStart { total: usize },

    #[serde(rename = "suite:test_start")]
    #[serde(rename_all = "camelCase")]
    TestStart {
        test_id: String,
        test_name: String,
        index: usize,
    },

    #[serde(rename = "suite:test_complete")]
    #[serde(rename_all = "camelCase")]
    TestComplete {
        test_id: String,
        index: usize,
        status: String,
        duration_ms: u64,

        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "suite:complete")]
    SuiteComplete { result: SuiteResult },
}

/// Delivers events to at most one listener, isolating listener faults.
pub struct Emitter<E> {
    listener: Option<Arc<dyn Fn(E) + Send + Sync>>,
}

impl<E> Clone for Emitter<E> {
    fn clone(&self) -> Self {
        Self {
            listener: self.listener.clone(),
        }
    }
}

impl<E> Default for Emitter<E> {
    fn default() -> Self {
        Self { listener: None }
    }
}

impl<E> Emitter<E> {
    /// An emitter that drops every event.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// An emitter delivering to the given listener.
    pub fn new(listener: impl Fn(E) + Send + Sync + 'static) -> Self {
        Self {
            listener: Some(Arc::new(listener)),
        }
    }

    /// Deliver one event. Listener panics are caught and discarded.
    pub fn emit(&self, event: E) {
        if let Some(listener) = &self.listener {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(event)));
            if outcome.is_err() {
                warn!("Event listener panicked; event discarded");
            }
        }
    }
}
