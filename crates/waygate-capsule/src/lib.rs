//! Execution capsules.
//!
//! A capsule is an immutable, signed, content-addressed artifact: a JSON
//! manifest plus one ZIP layer per filesystem overlay. The builder turns a
//! run request into a cached capsule; the store reads capsules back for the
//! runtime and for HTTP serving.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

/// Bundler invocation and memoization.
pub mod bundle;
/// The capsule builder.
pub mod builder;
/// Capsule error types.
pub mod error;
/// Deterministic ZIP layer helpers.
pub mod layer;
/// Capsule manifest model and content hashing.
pub mod manifest;
/// Mount layer construction (directory and git).
pub mod mounts;
/// Read side: loading and serving cached capsules.
pub mod store;

pub use builder::{BuildOutput, CapsuleBuilder, RunRequest};
pub use error::{CapsuleError, CapsuleResult};
pub use manifest::{CapsuleManifest, EntrySpec, LayerDescriptor, RuntimeSpec};
pub use store::CapsuleStore;

/// Identity of the server-side runtime recorded in every manifest.
pub const RUNTIME_ID: &str = "quickjs@2025-10";
