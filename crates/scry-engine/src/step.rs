use std::sync::Arc;

use scry_jdwp::wire::{
    EventModifier, ThreadId, EVENT_KIND_SINGLE_STEP, STEP_DEPTH_INTO, STEP_DEPTH_OUT,
    STEP_DEPTH_OVER, STEP_SIZE_LINE, SUSPEND_POLICY_EVENT_THREAD,
};
use scry_jdwp::TargetVm;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepDepth {
    Over,
    Into,
    Out,
}

impl StepDepth {
    fn jdwp(self) -> u32 {
        match self {
            StepDepth::Into => STEP_DEPTH_INTO,
            StepDepth::Over => STEP_DEPTH_OVER,
            StepDepth::Out => STEP_DEPTH_OUT,
        }
    }

    /// Into and out may report the line they started from again (recursion,
    /// leaf calls); over never does.
    pub fn may_repeat_location(self) -> bool {
        matches!(self, StepDepth::Into | StepDepth::Out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ActiveStep {
    depth: StepDepth,
    thread: ThreadId,
    request_id: i32,
}

/// Owns the session's single step request.
pub struct StepController<V> {
    vm: Arc<V>,
    exclusions: Vec<String>,
    active: Mutex<Option<ActiveStep>>,
}

impl<V: TargetVm> StepController<V> {
    /// `exclusions` are class patterns the VM steps through on its own.
    pub fn new(vm: Arc<V>, exclusions: Vec<String>) -> Self {
        Self {
            vm,
            exclusions,
            active: Mutex::new(None),
        }
    }

    /// Installs a line step of `depth` on `thread`, replacing any other step.
    /// Repeating the active depth on the same thread keeps the request.
    pub async fn activate(&self, depth: StepDepth, thread: ThreadId) -> Result<()> {
        let mut active = self.active.lock().await;
        if let Some(current) = *active {
            if current.depth == depth && current.thread == thread {
                return Ok(());
            }
        }
        if let Some(previous) = active.take() {
            self.clear(previous).await;
        }

        let mut modifiers = vec![EventModifier::Step {
            thread,
            size: STEP_SIZE_LINE,
            depth: depth.jdwp(),
        }];
        modifiers.extend(
            self.exclusions
                .iter()
                .map(|pattern| EventModifier::ClassExclude {
                    pattern: pattern.clone(),
                }),
        );
        let request_id = self
            .vm
            .set_event_request(EVENT_KIND_SINGLE_STEP, SUSPEND_POLICY_EVENT_THREAD, &modifiers)
            .await?;
        tracing::debug!(target: "scry.engine", ?depth, thread, request_id, "step activated");
        *active = Some(ActiveStep {
            depth,
            thread,
            request_id,
        });
        Ok(())
    }

    pub async fn deactivate(&self) {
        if let Some(previous) = self.active.lock().await.take() {
            self.clear(previous).await;
        }
    }

    pub async fn current_depth(&self) -> Option<StepDepth> {
        self.active.lock().await.map(|step| step.depth)
    }

    /// Whether a step event belongs to the active request. Events of cleared
    /// requests may still be queued.
    pub async fn is_active_request(&self, request_id: i32) -> bool {
        self.active
            .lock()
            .await
            .is_some_and(|step| step.request_id == request_id)
    }

    async fn clear(&self, step: ActiveStep) {
        if let Err(err) = self
            .vm
            .clear_event_request(EVENT_KIND_SINGLE_STEP, step.request_id)
            .await
        {
            tracing::warn!(
                target: "scry.engine",
                request_id = step.request_id,
                error = %err,
                "failed to clear step request"
            );
        }
    }
}
