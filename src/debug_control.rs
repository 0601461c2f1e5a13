//! Cooperative debug gate between steps.
//!
//! The runner awaits `gate(index, total)` before every step; the
//! controller decides whether that call returns immediately, sleeps for
//! the configured step delay, parks until `step`/`continue_run`/`run_to`
//! releases it, or rejects because the run was stopped.
//!
//! At most one gate call is in flight per controller (one runner per
//! run), so a single oneshot resolver per pause is sufficient.

use crate::errors::StepError;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tracing::debug;

/// Callback invoked when the gate parks: `(current_index, total)`.
pub type PauseHook = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Callback invoked when a parked gate resumes.
pub type ResumeHook = Arc<dyn Fn() + Send + Sync>;

/// Controller configuration.
#[derive(Clone, Default)]
pub struct DebugConfig {
    /// Start in step mode: every gate call parks until released.
    pub debug: bool,

    /// Pacing delay applied before every step except the first.
    pub step_delay: Duration,

    pub on_pause: Option<PauseHook>,
    pub on_resume: Option<ResumeHook>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Running,
    Paused,
    Stopped,
}

struct Inner {
    mode: Mode,

    /// Step mode armed: the next eligible gate call parks.
    debug: bool,

    /// Run freely until this index, then re-engage pause mode.
    run_to: Option<usize>,

    /// Resolver for the currently parked gate call.
    waiter: Option<oneshot::Sender<()>>,
}

/// Per-run pause/step/continue/run-to/stop gate.
pub struct DebugController {
    inner: Mutex<Inner>,
    stop_notify: Notify,
    step_delay: Duration,
    on_pause: Option<PauseHook>,
    on_resume: Option<ResumeHook>,
}

impl DebugController {
    pub fn new(config: DebugConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                mode: Mode::Running,
                debug: config.debug,
                run_to: None,
                waiter: None,
            }),
            stop_notify: Notify::new(),
            step_delay: config.step_delay,
            on_pause: config.on_pause,
            on_resume: config.on_resume,
        }
    }

    /// A controller that never pauses or paces.
    pub fn disabled() -> Arc<Self> {
        Arc::new(Self::new(DebugConfig::default()))
    }

    /// Await permission to execute the step at `current` of `total`.
    ///
    /// Fails with [`StepError::Stopped`] when the run was stopped; the
    /// step-delay sleep is interruptible by `stop`.
    pub async fn gate(&self, current: usize, total: usize) -> Result<(), StepError> {
        if self.is_stopped() {
            return Err(StepError::Stopped);
        }

        // Pacing. The first step is never delayed.
        if self.step_delay > Duration::ZERO && current > 0 {
            tokio::select! {
                _ = tokio::time::sleep(self.step_delay) => {}
                _ = self.stop_notify.notified() => return Err(StepError::Stopped),
            }
            if self.is_stopped() {
                return Err(StepError::Stopped);
            }
        }

        let receiver = {
            let mut inner = self.inner.lock().unwrap();
            match inner.mode {
                Mode::Stopped => return Err(StepError::Stopped),
                _ => {}
            }

            if !inner.debug {
                return Ok(());
            }

            match inner.run_to {
                Some(target) if current < target => return Ok(()),
                Some(_) => {
                    // Reached the target; pause here and from now on.
                    inner.run_to = None;
                }
                None => {}
            }

            let (tx, rx) = oneshot::channel();
            inner.mode = Mode::Paused;
            inner.waiter = Some(tx);
            rx
        };

        debug!(step = current, total, "Debug gate paused");
        if let Some(hook) = &self.on_pause {
            hook(current, total);
        }

        // A dropped sender means the controller went away; treat as stop.
        let released = receiver.await.is_ok();

        let stopped = {
            let mut inner = self.inner.lock().unwrap();
            if inner.mode == Mode::Paused {
                inner.mode = Mode::Running;
            }
            !released || inner.mode == Mode::Stopped
        };

        if stopped {
            return Err(StepError::Stopped);
        }

        debug!(step = current, "Debug gate resumed");
        if let Some(hook) = &self.on_resume {
            hook();
        }
        Ok(())
    }

    /// Release the current pause and re-arm pause mode for the next
    /// gate call. No-op when not paused.
    pub fn step(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.mode == Mode::Paused {
            inner.debug = true;
            if let Some(waiter) = inner.waiter.take() {
                let _ = waiter.send(());
            }
        }
    }

    /// Disable step mode, clear any run-to target and release a parked
    /// gate.
    pub fn continue_run(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.debug = false;
        inner.run_to = None;
        if let Some(waiter) = inner.waiter.take() {
            let _ = waiter.send(());
        }
    }

    /// Run freely until the step at `target`, then pause again.
    pub fn run_to(&self, target: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.run_to = Some(target);
        inner.debug = true;
        if let Some(waiter) = inner.waiter.take() {
            let _ = waiter.send(());
        }
    }

    /// Stop the run: the next (or currently parked) gate call fails
    /// with "Stopped by user".
    pub fn stop(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.mode = Mode::Stopped;
            if let Some(waiter) = inner.waiter.take() {
                let _ = waiter.send(());
            }
        }
        self.stop_notify.notify_waiters();
    }

    /// True once `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.lock().unwrap().mode == Mode::Stopped
    }

    /// True while a gate call is parked.
    pub fn is_paused(&self) -> bool {
        self.inner.lock().unwrap().mode == Mode::Paused
    }
}
