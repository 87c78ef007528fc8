//! Execution policies for sandboxed runs.
//!
//! A [`Policy`] bounds what a capsule may do: which domains it can fetch,
//! which virtual paths it can read or write, and how much wall clock,
//! memory, and output it may consume. Policies are combined with
//! [`intersect`], which only ever tightens, so a client override can never
//! weaken the server defaults.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

/// Policy error types.
pub mod error;
/// Filesystem access enforcement.
pub mod fs;
/// Monotone policy intersection.
pub mod intersect;
/// Policy records and client overrides.
pub mod model;
/// Network access enforcement.
pub mod net;

pub use error::{PolicyError, PolicyResult};
pub use fs::{AccessKind, FsEnforcer};
pub use intersect::intersect;
pub use model::{
    FsOverride, FsPolicy, Limits, LimitsOverride, MountSpec, MountType, NetworkOverride,
    NetworkPolicy, Policy, PolicyOverride,
};
pub use net::NetworkEnforcer;
