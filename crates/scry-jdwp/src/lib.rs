//! Java Debug Wire Protocol client for Scry.
//!
//! `scry-engine` drives a target JVM through the [`TargetVm`] trait. The TCP
//! implementation is [`wire::JdwpClient`]; it covers the command subset the
//! engine needs (class discovery, line and variable tables, frames, value
//! reads, remote invocation, event requests and collection pinning).
//!
//! With the `test-support` feature the crate also exports
//! [`scripted::ScriptedVm`], an in-memory VM that replays a scripted trace.

mod target;
pub mod wire;

#[cfg(any(test, feature = "test-support"))]
mod poison;
#[cfg(any(test, feature = "test-support"))]
pub mod scripted;

pub use target::TargetVm;
pub use wire::{JdwpClient, JdwpClientConfig, JdwpError};
