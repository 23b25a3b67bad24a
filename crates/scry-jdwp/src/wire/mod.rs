//! Wire-level JDWP implementation.
//!
//! This module speaks the actual JDWP binary protocol over TCP. It is
//! async (`tokio`) and cancellation-aware.

mod client;
pub mod codec;
pub mod signature;
pub mod types;

pub use client::{parse_event_set, EventModifier, JdwpClient, JdwpClientConfig};
pub use types::*;
