//! Filesystem access enforcement.
//!
//! Decides whether a virtual (guest-visible) path may be read or written,
//! before any I/O happens. Paths are absolute POSIX; escapes are rejected
//! here even though the VFS also guards physically.

use crate::error::{PolicyError, PolicyResult};
use crate::model::FsPolicy;

/// The kind of access being attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// Read-style operations (read, readdir, stat, exists).
    Read,
    /// Write-style operations (write, mkdir, unlink, rmdir).
    Write,
}

impl AccessKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

/// Path-prefix checker over an intersected filesystem policy.
#[derive(Debug, Clone)]
pub struct FsEnforcer {
    policy: FsPolicy,
}

impl FsEnforcer {
    /// Build an enforcer over an intersected filesystem policy.
    #[must_use]
    pub fn new(policy: FsPolicy) -> Self {
        Self { policy }
    }

    /// The policy this enforcer applies.
    #[must_use]
    pub fn policy(&self) -> &FsPolicy {
        &self.policy
    }

    /// Check an access and return the normalized path on allow.
    ///
    /// # Errors
    ///
    /// [`PolicyError::InvalidPath`] for relative or escaping paths,
    /// [`PolicyError::PathDenied`] when no prefix grants the access.
    pub fn check(&self, path: &str, access: AccessKind) -> PolicyResult<String> {
        let normalized = normalize(path)?;

        let granted = match access {
            // Write access implies read access, so writable prefixes also
            // satisfy reads.
            AccessKind::Read => {
                prefix_match(&self.policy.readonly, &normalized)
                    || prefix_match(&self.policy.writable, &normalized)
            },
            AccessKind::Write => prefix_match(&self.policy.writable, &normalized),
        };

        if granted {
            Ok(normalized)
        } else {
            Err(PolicyError::PathDenied {
                path: normalized,
                access: access.as_str(),
            })
        }
    }
}

/// Normalize an absolute POSIX path: collapse `//` and `.`, reject
/// relative paths and any `..` component.
fn normalize(path: &str) -> PolicyResult<String> {
    if !path.starts_with('/') {
        return Err(PolicyError::InvalidPath(format!(
            "path must be absolute: {path}"
        )));
    }

    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {},
            ".." => {
                return Err(PolicyError::InvalidPath(format!(
                    "path escapes are not allowed: {path}"
                )));
            },
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(format!("/{}", parts.join("/")))
    }
}

fn prefix_match(prefixes: &[String], path: &str) -> bool {
    prefixes.iter().any(|prefix| {
        let prefix = prefix.trim_end_matches('/');
        if prefix.is_empty() {
            // "/" grants everything.
            return true;
        }
        path == prefix || path.starts_with(&format!("{prefix}/"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enforcer() -> FsEnforcer {
        FsEnforcer::new(FsPolicy::default())
    }

    #[test]
    fn default_policy_reads_anywhere_writes_tmp_out() {
        assert!(enforcer().check("/etc/hosts", AccessKind::Read).is_ok());
        assert!(enforcer().check("/tmp/x", AccessKind::Write).is_ok());
        assert!(enforcer().check("/out/result", AccessKind::Write).is_ok());
        assert!(enforcer().check("/etc/passwd", AccessKind::Write).is_err());
    }

    #[test]
    fn write_implies_read() {
        let policy = FsPolicy {
            readonly: vec![],
            writable: vec!["/tmp".to_string()],
            mounts: None,
        };
        let enforcer = FsEnforcer::new(policy);
        assert!(enforcer.check("/tmp/x", AccessKind::Read).is_ok());
        assert!(enforcer.check("/elsewhere", AccessKind::Read).is_err());
    }

    #[test]
    fn prefix_must_match_on_component_boundary() {
        let err = enforcer().check("/tmpfoo/x", AccessKind::Write).unwrap_err();
        assert!(matches!(err, PolicyError::PathDenied { .. }));
    }

    #[test]
    fn rejects_relative_and_escaping_paths() {
        assert!(matches!(
            enforcer().check("relative/x", AccessKind::Read),
            Err(PolicyError::InvalidPath(_))
        ));
        assert!(matches!(
            enforcer().check("/tmp/../etc/passwd", AccessKind::Read),
            Err(PolicyError::InvalidPath(_))
        ));
    }

    #[test]
    fn normalizes_dots_and_doubled_separators() {
        let p = enforcer().check("/tmp//./x", AccessKind::Write).unwrap();
        assert_eq!(p, "/tmp/x");
        assert_eq!(normalize("/").unwrap(), "/");
    }
}
