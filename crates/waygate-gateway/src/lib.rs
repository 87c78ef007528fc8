//! The gateway HTTP surface.
//!
//! One axum application exposes the JSON-RPC `/mcp` endpoint, the session
//! side-channel (SSE out, backchannel in), capsule file serving, and the
//! upstream MCP proxy. A [`GatewayContext`] carries the builder, runtime,
//! dispatcher, and upstream manager into every handler, which keeps the
//! component cycle broken at one explicit seam.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

/// The shared gateway context.
pub mod context;
/// Gateway error types.
pub mod error;
/// JSON-RPC `/mcp` methods and run routing.
pub mod rpc;
/// Route table and HTTP handlers.
pub mod routes;
/// The session dispatcher.
pub mod session;

pub use context::GatewayContext;
pub use error::{GatewayError, GatewayResult};
pub use routes::router;
pub use session::{SessionCommand, SessionDispatcher};
