use std::sync::Arc;

use parking_lot::Mutex;
use scry_jdwp::wire::ThreadId;
use scry_jdwp::TargetVm;
use serde::Serialize;

use crate::breakpoints::{Breakpoint, BreakpointRegistry};
use crate::error::Result;
use crate::step::StepDepth;
use crate::suspension::{ResumeCommand, SuspensionCoordinator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Running,
    Terminated,
}

/// State the event loop publishes for controllers.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) state: Mutex<SessionState>,
    pub(crate) suspended: Mutex<Option<ThreadId>>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Idle),
            suspended: Mutex::new(None),
        }
    }
}

/// Drives a session from any task or thread.
///
/// Resume and step commands are fire-and-forget: they take effect when the
/// event loop next waits at a suspension, or immediately if it already does.
/// Breakpoint edits go straight to the breakpoint registry.
pub struct SessionHandle<V> {
    pub(crate) coordinator: Arc<SuspensionCoordinator>,
    pub(crate) breakpoints: Arc<BreakpointRegistry<V>>,
    pub(crate) shared: Arc<Shared>,
}

impl<V> Clone for SessionHandle<V> {
    fn clone(&self) -> Self {
        Self {
            coordinator: Arc::clone(&self.coordinator),
            breakpoints: Arc::clone(&self.breakpoints),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V: TargetVm> SessionHandle<V> {
    pub fn resume(&self) {
        self.coordinator.signal_resume(ResumeCommand::Continue);
    }

    pub fn step_over(&self) {
        self.step(StepDepth::Over);
    }

    pub fn step_into(&self) {
        self.step(StepDepth::Into);
    }

    pub fn step_out(&self) {
        self.step(StepDepth::Out);
    }

    pub fn step(&self, depth: StepDepth) {
        self.coordinator.signal_resume(ResumeCommand::Step(depth));
    }

    /// Creates the breakpoint if absent, otherwise flips it on or off.
    pub async fn toggle_breakpoint(&self, class: &str, line: u32) -> Result<Breakpoint> {
        self.breakpoints.toggle(class, line).await
    }

    pub async fn set_breakpoint(
        &self,
        class: &str,
        line: u32,
        annotation: Option<String>,
    ) -> Result<Breakpoint> {
        self.breakpoints.set(class, line, annotation).await
    }

    pub async fn remove_breakpoint(&self, class: &str, line: u32) -> bool {
        self.breakpoints.remove(class, line).await
    }

    pub async fn set_breakpoint_enabled(
        &self,
        class: &str,
        line: u32,
        enabled: bool,
    ) -> Result<bool> {
        self.breakpoints.set_enabled(class, line, enabled).await
    }

    pub async fn breakpoints(&self) -> Vec<Breakpoint> {
        self.breakpoints.breakpoints().await
    }

    pub fn breakpoint_registry(&self) -> &BreakpointRegistry<V> {
        &self.breakpoints
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    /// The thread the target is suspended on while the observer holds a
    /// suspension.
    pub fn suspended_thread(&self) -> Option<ThreadId> {
        *self.shared.suspended.lock()
    }

    /// Ends the session without resuming the target.
    pub fn shutdown(&self) {
        self.coordinator.cancel();
    }
}
