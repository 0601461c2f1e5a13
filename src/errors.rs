//! Error categorization for step failures and reporting.
//!
//! This module classifies execution failures into meaningful categories
//! (validation, assertion, timeout, driver, cycle, stopped) so results and
//! event payloads carry a stable machine-readable kind alongside the
//! human-readable message.

use std::fmt;
use thiserror::Error;

/// Categories of failures that can occur while executing a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed step, bad indices, missing required fields
    Validation,

    /// An assertion or page verification did not hold
    Assertion,

    /// Test-wide, per-step polling, or wait exhaustion
    Timeout,

    /// The browser driver reported a failure
    Driver,

    /// A server-side HTTP step failed
    Http,

    /// A nested test revisited an id already on the call stack
    Cycle,

    /// User-initiated stop via the debug controller
    Stopped,
}

impl ErrorKind {
    /// Get the stable label for this error kind.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::Assertion => "assertion_failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Driver => "driver_error",
            ErrorKind::Http => "http_error",
            ErrorKind::Cycle => "cycle_error",
            ErrorKind::Stopped => "stopped",
        }
    }

    /// Get a human-readable description of this error kind.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "Malformed step or invalid arguments",
            ErrorKind::Assertion => "Assertion or page verification failed",
            ErrorKind::Timeout => "Operation timed out",
            ErrorKind::Driver => "Browser driver failure",
            ErrorKind::Http => "Server-side HTTP request failure",
            ErrorKind::Cycle => "Nested test cycle detected",
            ErrorKind::Stopped => "Stopped by user",
        }
    }

    /// Get all error kinds in a consistent order.
    pub fn all() -> Vec<ErrorKind> {
        vec![
            ErrorKind::Validation,
            ErrorKind::Assertion,
            ErrorKind::Timeout,
            ErrorKind::Driver,
            ErrorKind::Http,
            ErrorKind::Cycle,
            ErrorKind::Stopped,
        ]
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// A failure produced by a single step or by the surrounding lifecycle.
///
/// Step handlers never panic; every failure path funnels into one of
/// these variants, which the runner translates into a failed result.
#[derive(Error, Debug, Clone)]
pub enum StepError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Assertion(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Driver(String),

    #[error("{0}")]
    Http(String),

    #[error("Cycle detected: {0}")]
    Cycle(String),

    #[error("Stopped by user")]
    Stopped,
}

impl StepError {
    /// The category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::Validation(_) => ErrorKind::Validation,
            StepError::Assertion(_) => ErrorKind::Assertion,
            StepError::Timeout(_) => ErrorKind::Timeout,
            StepError::Driver(_) => ErrorKind::Driver,
            StepError::Http(_) => ErrorKind::Http,
            StepError::Cycle(_) => ErrorKind::Cycle,
            StepError::Stopped => ErrorKind::Stopped,
        }
    }
}

/// Categorize an HTTP status observed by `network_check` or `http_request`.
///
/// Returns None for success/redirect statuses.
pub fn categorize_status(status: u16) -> Option<ErrorKind> {
    match status {
        200..=399 => None,
        _ => Some(ErrorKind::Http),
    }
}
