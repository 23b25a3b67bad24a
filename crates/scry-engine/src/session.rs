//! The session event loop.
//!
//! One task pulls event sets off the target in arrival order and handles them
//! one at a time. A breakpoint or completed step inside a watched class
//! becomes a suspension: the loop snapshots the top frame, hands it to the
//! observer and waits at the [`SuspensionCoordinator`] until a controller
//! resumes. Every event set that suspended the target is resumed afterwards,
//! whether or not it produced a suspension.

use std::sync::Arc;

use scry_config::SessionConfig;
use scry_jdwp::wire::signature::{class_name_to_signature, signature_to_class_name};
use scry_jdwp::wire::{
    EventModifier, EventSet, JdwpEvent, JdwpValue, Location, ReferenceTypeId, ThreadId,
    EVENT_KIND_CLASS_PREPARE, EVENT_KIND_EXCEPTION, SUSPEND_POLICY_EVENT_THREAD,
};
use scry_jdwp::TargetVm;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::breakpoints::BreakpointRegistry;
use crate::classes::{ClassRegistry, LoadedClass};
use crate::control::{SessionHandle, SessionState, Shared};
use crate::launch::CapturedOutput;
use crate::marshal::{MarshalState, Marshaller, StrategyRegistry};
use crate::observer::{
    ExceptionReport, SessionObserver, SourceLocation, SuspendReason, Suspension,
};
use crate::source::SourceClass;
use crate::step::StepController;
use crate::suspension::{ResumeCommand, SuspensionCoordinator};

/// Exit code requested from the target when a session is cancelled.
const CANCELLED_EXIT_CODE: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The target went away: it exited, died or closed the connection.
    Disconnected,
    /// The session was shut down through its handle.
    Cancelled,
}

/// Where and why the loop is about to suspend.
type Stop = (ThreadId, SourceLocation, SuspendReason);

enum Flow {
    Continue,
    Stop(TerminationReason),
}

pub struct Session<V: TargetVm> {
    vm: Arc<V>,
    config: SessionConfig,
    classes: Arc<ClassRegistry>,
    breakpoints: Arc<BreakpointRegistry<V>>,
    steps: StepController<V>,
    coordinator: Arc<SuspensionCoordinator>,
    shared: Arc<Shared>,
    strategies: StrategyRegistry<V>,
    marshal: MarshalState,
    observer: Arc<dyn SessionObserver>,
    output: CapturedOutput,
    last_stop: Option<SourceLocation>,
}

impl<V: TargetVm> Session<V> {
    pub fn new(
        vm: Arc<V>,
        classes: ClassRegistry,
        config: SessionConfig,
        observer: impl SessionObserver,
    ) -> Self {
        let classes = Arc::new(classes);
        let breakpoints = Arc::new(BreakpointRegistry::new(vm.clone(), classes.clone()));
        let steps = StepController::new(vm.clone(), config.step_class_exclusions.clone());
        Self {
            vm,
            config,
            classes,
            breakpoints,
            steps,
            coordinator: Arc::new(SuspensionCoordinator::new()),
            shared: Arc::new(Shared::new()),
            strategies: StrategyRegistry::new(),
            marshal: MarshalState::default(),
            observer: Arc::new(observer),
            output: CapturedOutput::none(),
            last_stop: None,
        }
    }

    pub fn with_strategies(mut self, strategies: StrategyRegistry<V>) -> Self {
        self.strategies = strategies;
        self
    }

    /// Target output reported on termination.
    pub fn with_output(mut self, output: CapturedOutput) -> Self {
        self.output = output;
        self
    }

    pub fn strategies_mut(&mut self) -> &mut StrategyRegistry<V> {
        &mut self.strategies
    }

    pub fn handle(&self) -> SessionHandle<V> {
        SessionHandle {
            coordinator: self.coordinator.clone(),
            breakpoints: self.breakpoints.clone(),
            shared: self.shared.clone(),
        }
    }

    pub fn spawn(self) -> JoinHandle<TerminationReason> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> TerminationReason {
        self.set_state(SessionState::Connecting);
        self.connect().await;
        self.set_state(SessionState::Running);

        let cancel = self.coordinator.cancellation_token();
        let reason = loop {
            let set = match self.marshal.take_deferred() {
                Some(set) => set,
                None => {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break TerminationReason::Cancelled,
                        set = self.vm.next_event() => set,
                    };
                    match next {
                        Some(set) => set,
                        None => break TerminationReason::Disconnected,
                    }
                }
            };
            if let Flow::Stop(reason) = self.handle_event_set(set).await {
                break reason;
            }
        };

        self.terminate(reason).await
    }

    fn set_state(&self, state: SessionState) {
        *self.shared.state.lock() = state;
        tracing::debug!(target: "scry.engine", ?state, "session state");
    }

    /// Registers the session's own requests. A failure is logged and the
    /// remaining classes are still set up.
    async fn connect(&mut self) {
        for class in self.classes.watched_classes() {
            let modifiers = [EventModifier::ClassMatch {
                pattern: class.clone(),
            }];
            let requested = self
                .vm
                .set_event_request(
                    EVENT_KIND_CLASS_PREPARE,
                    SUSPEND_POLICY_EVENT_THREAD,
                    &modifiers,
                )
                .await;
            match requested {
                Ok(request_id) => {
                    tracing::debug!(
                        target: "scry.engine",
                        class = %class,
                        request_id,
                        "watching class"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        target: "scry.engine",
                        class = %class,
                        error = %err,
                        "failed to watch class"
                    );
                }
            }
        }

        let caught = self.config.report_caught_exceptions;
        let uncaught = self.config.report_uncaught_exceptions;
        if caught || uncaught {
            let mut modifiers = vec![EventModifier::ExceptionOnly {
                exception_or_null: 0,
                caught,
                uncaught,
            }];
            modifiers.extend(self.config.step_class_exclusions.iter().map(|pattern| {
                EventModifier::ClassExclude {
                    pattern: pattern.clone(),
                }
            }));
            if let Err(err) = self
                .vm
                .set_event_request(EVENT_KIND_EXCEPTION, SUSPEND_POLICY_EVENT_THREAD, &modifiers)
                .await
            {
                tracing::warn!(
                    target: "scry.engine",
                    error = %err,
                    "failed to request exception events"
                );
            }
        }

        // Classes the target loaded before we attached get no prepare event.
        for source in self.classes.sources() {
            let signature = class_name_to_signature(source.name());
            match self.vm.classes_by_signature(&signature).await {
                Ok(found) => {
                    if let Some(info) = found.first() {
                        self.load_class(source, info.type_id).await;
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        target: "scry.engine",
                        class = %source.name(),
                        error = %err,
                        "failed to look up loaded class"
                    );
                }
            }
        }
    }

    async fn handle_event_set(&mut self, set: EventSet) -> Flow {
        let mut vm_death = false;

        for event in &set.events {
            match event {
                JdwpEvent::VmStart { thread, .. } => {
                    tracing::debug!(target: "scry.engine", thread, "target started");
                }
                JdwpEvent::ClassPrepare {
                    type_id, signature, ..
                } => self.on_class_prepare(*type_id, signature).await,
                JdwpEvent::Exception {
                    thread,
                    location,
                    exception,
                    catch_location,
                    ..
                } => {
                    self.on_exception(*thread, location, *exception, catch_location.is_some())
                        .await
                }
                JdwpEvent::VmDeath { .. } => {
                    tracing::info!(target: "scry.engine", "target vm died");
                    vm_death = true;
                }
                JdwpEvent::Breakpoint { .. } | JdwpEvent::SingleStep { .. } => {}
            }
        }

        // At most one stop per set. The VM may list a co-located step before
        // the breakpoint; the breakpoint still wins.
        let stop = match self.breakpoint_stop(&set).await {
            Some(stop) => Some(stop),
            None => self.step_stop(&set).await,
        };
        let stopped = stop.is_some();
        if let Some((thread, here, reason)) = stop {
            if let Flow::Stop(reason) = self.suspend(thread, here, reason).await {
                return Flow::Stop(reason);
            }
        }

        self.marshal.release_pins(&*self.vm).await;
        if !set.suspends() || vm_death {
            return Flow::Continue;
        }
        match self.vm.resume().await {
            Ok(()) => {
                if stopped {
                    self.observer.on_resume_completed();
                }
            }
            Err(err) if err.is_disconnect() => {
                tracing::debug!(target: "scry.engine", error = %err, "resume after disconnect");
            }
            Err(err) => {
                tracing::warn!(target: "scry.engine", error = %err, "failed to resume target");
            }
        }
        Flow::Continue
    }

    async fn breakpoint_stop(&mut self, set: &EventSet) -> Option<Stop> {
        for event in &set.events {
            if let JdwpEvent::Breakpoint {
                thread, location, ..
            } = event
            {
                if let Some(here) = self.breakpoint_hit(location).await {
                    return Some((*thread, here, SuspendReason::Breakpoint));
                }
            }
        }
        None
    }

    async fn step_stop(&mut self, set: &EventSet) -> Option<Stop> {
        for event in &set.events {
            if let JdwpEvent::SingleStep {
                request_id,
                thread,
                location,
            } = event
            {
                if let Some(here) = self.step_completed(*request_id, location).await {
                    return Some((*thread, here, SuspendReason::Step));
                }
            }
        }
        None
    }

    fn marshaller(&mut self, thread: ThreadId) -> Marshaller<'_, V> {
        Marshaller::new(
            &*self.vm,
            thread,
            &self.strategies,
            &mut self.marshal,
            self.config.max_marshal_depth,
        )
    }

    fn source_location(&self, location: &Location) -> Option<SourceLocation> {
        let loaded = self.classes.loaded_by_type(location.class_id)?;
        let line = loaded.line_of(location)?;
        Some(SourceLocation {
            class: loaded.name().to_string(),
            line,
        })
    }

    async fn on_class_prepare(&mut self, type_id: ReferenceTypeId, signature: &str) {
        let name = signature_to_class_name(signature);
        match self.classes.source(&name) {
            Some(source) => self.load_class(source, type_id).await,
            None => {
                tracing::trace!(
                    target: "scry.engine",
                    class = %name,
                    "ignoring unwatched class"
                );
            }
        }
    }

    async fn load_class(&self, source: Arc<SourceClass>, type_id: ReferenceTypeId) {
        let name = source.name().to_string();
        if self.classes.loaded(&name).is_some() {
            tracing::debug!(target: "scry.engine", class = %name, "class already loaded; ignoring");
            return;
        }
        match LoadedClass::load(&*self.vm, source, type_id).await {
            Ok(loaded) => {
                if let Some(loaded) = self.classes.insert_loaded(loaded) {
                    let installed = self.breakpoints.materialize(&loaded).await;
                    tracing::info!(target: "scry.engine", class = %name, installed, "class loaded");
                }
            }
            Err(err) => {
                tracing::warn!(
                    target: "scry.engine",
                    class = %name,
                    error = %err,
                    "failed to load class"
                );
            }
        }
    }

    async fn on_exception(
        &mut self,
        thread: ThreadId,
        location: &Location,
        exception: JdwpValue,
        caught: bool,
    ) {
        let value = self.marshaller(thread).marshal(exception).await;
        let report = ExceptionReport {
            value,
            location: self.source_location(location),
            caught,
        };
        tracing::debug!(
            target: "scry.engine",
            location = ?report.location,
            caught,
            "exception reported"
        );
        self.observer.on_out_of_band_exception(&report);
    }

    async fn breakpoint_hit(&mut self, location: &Location) -> Option<SourceLocation> {
        let here = self.source_location(location)?;
        if !self.breakpoints.is_enabled(&here.class, here.line).await {
            tracing::debug!(
                target: "scry.engine",
                location = %here,
                "breakpoint disabled; ignoring"
            );
            return None;
        }
        // A breakpoint supersedes any stepping in progress.
        self.steps.deactivate().await;
        Some(here)
    }

    async fn step_completed(
        &mut self,
        request_id: i32,
        location: &Location,
    ) -> Option<SourceLocation> {
        if !self.steps.is_active_request(request_id).await {
            tracing::trace!(target: "scry.engine", request_id, "stale step event");
            return None;
        }
        let here = self.source_location(location)?;
        let depth = self.steps.current_depth().await;
        if depth.is_some_and(|depth| depth.may_repeat_location())
            && self.last_stop.as_ref() == Some(&here)
        {
            tracing::debug!(
                target: "scry.engine",
                location = %here,
                "step landed on the same line; continuing"
            );
            return None;
        }
        Some(here)
    }

    async fn suspend(
        &mut self,
        thread: ThreadId,
        location: SourceLocation,
        reason: SuspendReason,
    ) -> Flow {
        *self.shared.suspended.lock() = Some(thread);
        let snapshot = self.marshaller(thread).snapshot_frame().await;
        tracing::info!(
            target: "scry.engine",
            location = %location,
            ?reason,
            variables = snapshot.len(),
            "suspended"
        );

        let suspension = Suspension {
            location,
            reason,
            thread,
        };
        self.observer.on_suspension(&suspension, &snapshot);
        drop(snapshot);
        self.last_stop = Some(suspension.location);

        let disconnected = self.vm.disconnect_token();
        let command = tokio::select! {
            biased;
            _ = disconnected.cancelled() => Err(TerminationReason::Disconnected),
            res = self.coordinator.await_resume() => res.map_err(|_| TerminationReason::Cancelled),
        };

        self.marshal.release_pins(&*self.vm).await;
        *self.shared.suspended.lock() = None;

        match command {
            Ok(ResumeCommand::Continue) => {
                self.steps.deactivate().await;
                Flow::Continue
            }
            Ok(ResumeCommand::Step(depth)) => {
                if let Err(err) = self.steps.activate(depth, thread).await {
                    tracing::warn!(
                        target: "scry.engine",
                        ?depth,
                        error = %err,
                        "failed to install step"
                    );
                }
                Flow::Continue
            }
            Err(reason) => Flow::Stop(reason),
        }
    }

    async fn terminate(mut self, reason: TerminationReason) -> TerminationReason {
        self.set_state(SessionState::Terminated);
        *self.shared.suspended.lock() = None;

        if reason == TerminationReason::Cancelled && self.config.exit_target_on_cancel {
            if let Err(err) = self.vm.exit(CANCELLED_EXIT_CODE).await {
                tracing::debug!(target: "scry.engine", error = %err, "failed to stop target");
            }
        }
        // Wake anything still waiting on a resume.
        self.coordinator.cancel();

        let (stdout, stderr) = self.output.collect().await;
        tracing::info!(target: "scry.engine", ?reason, "session terminated");
        self.observer.on_termination(&stdout, &stderr);
        reason
    }
}
