//! Shared vocabulary for the waygate gateway.
//!
//! Identifiers, the per-run event stream model, and the error kinds that
//! cross component boundaries live here so that the builder, runtime,
//! dispatcher, and endpoints agree on one wire format.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

/// Per-run execution events and usage accounting.
pub mod event;
/// Session, run, and capsule identifiers.
pub mod id;
/// Guest language selection.
pub mod lang;

pub use event::{ErrorKind, ExecutionEvent, RunUsage};
pub use id::{CapsuleHash, RunId, SessionId};
pub use lang::Language;
