//! Browser-automation director: drives a running Chrome over the
//! DevTools Protocol and executes declarative YAML/JSON tests composed
//! of small typed steps.
//!
//! The crate is organized around the execution engine:
//!
//! - [`definition`] — the test data model (url, env, inputs, hooks,
//!   steps, timeouts) and the step variant
//! - [`variables`] — `$vars` / `$env` textual interpolation
//! - [`dispatch`] + `steps_*` — the step dispatcher and its handlers
//! - [`runner`] — the per-test lifecycle state machine
//! - [`suite`] — multi-test scheduling with bounded concurrency
//! - [`debug_control`] — the cooperative pause/step/continue gate
//! - [`session`] — the persistent tab-session registry
//! - [`driver`] — the capability contract the runner consumes, with the
//!   chromiumoxide implementation in [`chrome`]
//! - [`storage`] — saved tests and run records on disk
//! - [`events`] — the typed event stream front-ends subscribe to

pub mod chrome;
pub mod debug_control;
pub mod definition;
pub mod diagnostics;
pub mod dispatch;
pub mod driver;
pub mod errors;
pub mod events;
pub mod results;
pub mod runner;
pub mod session;
pub mod steps_net;
pub mod steps_page;
pub mod steps_wait;
pub mod storage;
pub mod suite;
pub mod variables;

pub use definition::{Step, StepKind, TestDefinition};
pub use driver::BrowserDriver;
pub use results::{SuiteResult, TestResult};
pub use runner::{RunOptions, TestRunner};
pub use suite::{SuiteOptions, SuiteRunner};
