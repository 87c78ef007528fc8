//! Virtual filesystem for sandboxed runs.
//!
//! Guest code sees absolute POSIX paths; every one of them resolves inside
//! a single base directory fixed at construction. The policy enforcer is
//! consulted before any I/O, and symlinks that would escape the base are
//! rejected.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

/// Virtual filesystem error types.
pub mod error;
/// The sandboxed filesystem implementation.
pub mod sandbox;

pub use error::{VfsError, VfsResult};
pub use sandbox::{DirEntry, FileStat, ReadEncoding, ReadOptions, ReadOutput, SandboxFs, WriteMode};
