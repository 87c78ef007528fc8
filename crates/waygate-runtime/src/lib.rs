//! The sandbox runtime.
//!
//! Executes a cached capsule inside a fresh embedded QuickJS engine. The
//! guest sees a narrow injected surface (`console`, `fs`, a guarded
//! `fetch`, and one proxy object per upstream MCP server); the host
//! enforces wall-clock, memory, and output limits and never hands object
//! references across the boundary, only JSON envelopes.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

/// Host-side bridge seams (MCP calls, output sinks).
pub mod bridge;
/// Runtime error types.
pub mod error;
/// The guarded fetch implementation.
pub mod fetch;
/// The executor.
pub mod runtime;

pub use bridge::{McpBridge, OutputSink, RunSinks};
pub use error::{RuntimeError, RuntimeResult};
pub use runtime::{JsRuntime, RunOutcome};
