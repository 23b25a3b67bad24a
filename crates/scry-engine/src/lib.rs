//! Debugger engine for JVM targets.
//!
//! A [`Session`] watches a set of source classes in a target reached through
//! [`scry_jdwp::TargetVm`]. Breakpoints declared up front (or added through a
//! [`SessionHandle`]) are installed as each class loads. Every stop snapshots
//! the top frame into [`LocalValue`]s for a [`SessionObserver`], then waits
//! until a controller resumes or steps.

mod breakpoints;
mod classes;
mod control;
mod error;
pub mod launch;
mod marshal;
mod observer;
mod session;
mod source;
mod step;
mod suspension;

pub use breakpoints::{Breakpoint, BreakpointRegistry};
pub use classes::{ClassRegistry, LoadedClass};
pub use control::{SessionHandle, SessionState};
pub use error::{EngineError, Result};
pub use launch::{launch, CapturedOutput, LaunchedTarget};
pub use marshal::{
    BoxFuture, LocalValue, MarshalError, MarshalState, MarshalStrategy, Marshaller, Snapshot,
    StrategyRegistry, Unpack,
};
pub use observer::{
    ChannelObserver, ExceptionReport, SessionEvent, SessionObserver, SourceLocation,
    SuspendReason, Suspension,
};
pub use session::{Session, TerminationReason};
pub use source::{BoxError, InlineSource, SourceClass, SourceError, SourceProvider};
pub use step::{StepController, StepDepth};
pub use suspension::{Cancelled, ResumeCommand, SuspensionCoordinator};
