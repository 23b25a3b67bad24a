use std::fmt;

use scry_jdwp::wire::ThreadId;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::marshal::{LocalValue, Snapshot};

/// A source position in a watched class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SourceLocation {
    pub class: String,
    pub line: u32,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class, self.line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendReason {
    Breakpoint,
    Step,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Suspension {
    pub location: SourceLocation,
    pub reason: SuspendReason,
    pub thread: ThreadId,
}

/// An exception thrown in the target, reported without suspending.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExceptionReport {
    pub value: LocalValue,
    /// Where it was thrown, when that is inside a loaded watched class.
    pub location: Option<SourceLocation>,
    pub caught: bool,
}

/// Receives what the session sees.
///
/// Callbacks run on the event loop task. The snapshot is only lent for the
/// duration of `on_suspension`; the target stays suspended until the session
/// handle resumes it.
pub trait SessionObserver: Send + Sync + 'static {
    fn on_suspension(&self, suspension: &Suspension, snapshot: &Snapshot);

    fn on_resume_completed(&self) {}

    /// Delivered exactly once, with whatever the target wrote.
    fn on_termination(&self, stdout: &str, stderr: &str);

    fn on_out_of_band_exception(&self, _report: &ExceptionReport) {}
}

/// Owned form of the observer callbacks.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Suspended {
        suspension: Suspension,
        snapshot: Snapshot,
    },
    ResumeCompleted,
    Exception(ExceptionReport),
    Terminated {
        stdout: String,
        stderr: String,
    },
}

/// Forwards every callback into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!(target: "scry.engine", "session event receiver dropped");
        }
    }
}

impl SessionObserver for ChannelObserver {
    fn on_suspension(&self, suspension: &Suspension, snapshot: &Snapshot) {
        self.send(SessionEvent::Suspended {
            suspension: suspension.clone(),
            snapshot: snapshot.clone(),
        });
    }

    fn on_resume_completed(&self) {
        self.send(SessionEvent::ResumeCompleted);
    }

    fn on_termination(&self, stdout: &str, stderr: &str) {
        self.send(SessionEvent::Terminated {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        });
    }

    fn on_out_of_band_exception(&self, report: &ExceptionReport) {
        self.send(SessionEvent::Exception(report.clone()));
    }
}
