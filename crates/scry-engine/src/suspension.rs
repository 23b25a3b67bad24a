//! The rendezvous between the event loop and whoever decides when the target
//! may run again.

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::step::StepDepth;

/// What the target does after a suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeCommand {
    Continue,
    Step(StepDepth),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("suspension cancelled")]
pub struct Cancelled;

/// A single-slot rendezvous.
///
/// A signal given while nobody waits is kept for the next wait, and a later
/// signal replaces an earlier one. Waking up is never enough to resume: the
/// waiter returns only once it has taken a command out of the slot.
#[derive(Debug, Default)]
pub struct SuspensionCoordinator {
    slot: Mutex<Option<ResumeCommand>>,
    notify: Notify,
    cancel: CancellationToken,
}

impl SuspensionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal_resume(&self, command: ResumeCommand) {
        *self.slot.lock() = Some(command);
        self.notify.notify_one();
    }

    /// Waits for a command. Cancellation takes priority over a pending one.
    pub async fn await_resume(&self) -> Result<ResumeCommand, Cancelled> {
        loop {
            let notified = self.notify.notified();
            if self.cancel.is_cancelled() {
                return Err(Cancelled);
            }
            if let Some(command) = self.slot.lock().take() {
                return Ok(command);
            }
            tokio::select! {
                _ = notified => {}
                _ = self.cancel.cancelled() => return Err(Cancelled),
            }
        }
    }

    /// Wakes any waiter with [`Cancelled`]; every later wait fails too.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
