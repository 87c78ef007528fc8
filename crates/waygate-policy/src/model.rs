//! Policy records and the client override shape.
//!
//! [`Policy`] is the server-side, fully-populated form. [`PolicyOverride`]
//! is what clients may send: every field is optional, and an absent field
//! means "no additional constraint", so [`crate::intersect`] can treat it
//! as the identity for that field.

use serde::{Deserialize, Serialize};

/// Network sub-policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkPolicy {
    /// Domain patterns a request may target. `*.host` matches `host` and
    /// any subdomain.
    pub allowed_domains: Vec<String>,
    /// Domain patterns that are always refused.
    pub denied_domains: Vec<String>,
    /// Refuse URLs whose host is an IP literal.
    pub deny_ip_literals: bool,
    /// Refuse IP hosts in private, loopback, or link-local ranges.
    pub block_private_ranges: bool,
    /// Maximum response body size in bytes.
    pub max_body_bytes: u64,
    /// Maximum number of redirects followed per request.
    pub max_redirects: u32,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self {
            allowed_domains: vec!["api.github.com".to_string(), "*.npmjs.org".to_string()],
            denied_domains: Vec::new(),
            deny_ip_literals: true,
            block_private_ranges: true,
            max_body_bytes: 5_242_880,
            max_redirects: 5,
        }
    }
}

/// Mount declaration: a host directory or git checkout exposed at a
/// virtual path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountSpec {
    /// Host path (directory mounts) or clone URL/path (git mounts).
    pub source: String,
    /// Absolute virtual path where the mount materializes.
    pub target: String,
    /// Mount flavor.
    #[serde(rename = "type")]
    pub mount_type: MountType,
    /// Whether the mount is read-only inside the sandbox.
    #[serde(default = "default_true")]
    pub readonly: bool,
    /// Ref to clone for git mounts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Mount flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MountType {
    /// Plain directory copy.
    Directory,
    /// Git clone at a ref.
    Git,
}

/// Filesystem sub-policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FsPolicy {
    /// Absolute virtual path prefixes the guest may read.
    pub readonly: Vec<String>,
    /// Absolute virtual path prefixes the guest may write (write implies
    /// read).
    pub writable: Vec<String>,
    /// Declared mounts, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mounts: Option<Vec<MountSpec>>,
}

impl Default for FsPolicy {
    fn default() -> Self {
        Self {
            readonly: vec!["/".to_string()],
            writable: vec!["/tmp".to_string(), "/out".to_string()],
            mounts: None,
        }
    }
}

/// Resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Limits {
    /// Wall-clock budget per run, in milliseconds.
    pub timeout_ms: u64,
    /// Guest memory budget, in megabytes.
    pub mem_mb: u64,
    /// Stdout budget, in bytes; stderr gets twice this.
    pub stdout_bytes: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            mem_mb: 256,
            stdout_bytes: 1_048_576,
        }
    }
}

/// A complete policy: what the builder stamps into a capsule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Policy {
    /// Network rules; `None` means the guest gets no `fetch` at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkPolicy>,
    /// Filesystem rules.
    pub filesystem: FsPolicy,
    /// Resource limits.
    pub limits: Limits,
}

impl Policy {
    /// The server default policy from the configuration defaults.
    #[must_use]
    pub fn server_default() -> Self {
        Self {
            network: Some(NetworkPolicy::default()),
            filesystem: FsPolicy::default(),
            limits: Limits::default(),
        }
    }
}

/// Client-supplied partial network policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkOverride {
    /// Narrowed allow-list; intersected with the server's.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_domains: Option<Vec<String>>,
    /// Additional deny-list; unioned with the server's.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denied_domains: Option<Vec<String>>,
    /// Tightened IP-literal flag; OR-ed with the server's.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deny_ip_literals: Option<bool>,
    /// Tightened private-range flag; OR-ed with the server's.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_private_ranges: Option<bool>,
    /// Lowered body cap; min-ed with the server's.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_body_bytes: Option<u64>,
    /// Lowered redirect cap; min-ed with the server's.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_redirects: Option<u32>,
}

/// Client-supplied partial filesystem policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FsOverride {
    /// Narrowed readable prefixes; intersected with the server's.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readonly: Option<Vec<String>>,
    /// Narrowed writable prefixes; intersected with the server's.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writable: Option<Vec<String>>,
    /// Additional mounts; concatenated after the server's.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mounts: Option<Vec<MountSpec>>,
}

/// Client-supplied partial limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitsOverride {
    /// Lowered wall-clock budget.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Lowered memory budget.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_mb: Option<u64>,
    /// Lowered stdout budget.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_bytes: Option<u64>,
}

/// The policy shape clients may attach to a run request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyOverride {
    /// Partial network override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkOverride>,
    /// Partial filesystem override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FsOverride>,
    /// Partial limits override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<LimitsOverride>,
}
