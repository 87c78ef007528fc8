//! The sandboxed filesystem.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use waygate_policy::{AccessKind, FsEnforcer};

use crate::error::{VfsError, VfsResult};

/// Encoding for [`SandboxFs::read_file`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadEncoding {
    /// Decode the bytes as UTF-8 text.
    #[default]
    Utf8,
    /// Return raw bytes.
    Binary,
}

/// Options for [`SandboxFs::read_file`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadOptions {
    /// Requested encoding.
    pub encoding: ReadEncoding,
    /// Upper bound on bytes read; exceeding it fails the read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<u64>,
}

/// Result of a read, shaped by the requested encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutput {
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

/// Write disposition for [`SandboxFs::write_file`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Fail if the target already exists.
    Create,
    /// Append to the target, creating it if absent.
    Append,
    /// Replace the target.
    #[default]
    Overwrite,
}

/// Directory entry returned by [`SandboxFs::read_dir`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    /// Entry name.
    pub name: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// Metadata returned by [`SandboxFs::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    /// Whether the entry is a directory.
    pub is_dir: bool,
    /// Whether the entry is a regular file.
    pub is_file: bool,
    /// Size in bytes.
    pub size: u64,
    /// Modification time, seconds since the UNIX epoch.
    pub mtime: u64,
}

/// A filesystem whose every path resolves under one base directory.
#[derive(Debug)]
pub struct SandboxFs {
    base: PathBuf,
    enforcer: FsEnforcer,
}

impl SandboxFs {
    /// Create a VFS rooted at `base`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the base cannot be created or canonicalized.
    pub fn new(base: impl Into<PathBuf>, enforcer: FsEnforcer) -> VfsResult<Self> {
        let base: PathBuf = base.into();
        std::fs::create_dir_all(&base)?;
        let base = base.canonicalize()?;
        Ok(Self { base, enforcer })
    }

    /// The host path of the sandbox root.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Whether this implementation supports `stat`. Used by the runtime to
    /// feature-gate the guest-visible bridge.
    #[must_use]
    pub fn supports_stat(&self) -> bool {
        true
    }

    /// Read a file.
    ///
    /// # Errors
    ///
    /// Policy denial, missing file, size-limit overflow, or UTF-8 failure.
    pub async fn read_file(&self, path: &str, opts: ReadOptions) -> VfsResult<ReadOutput> {
        let host = self.resolve(path, AccessKind::Read).await?;
        let meta = tokio::fs::metadata(&host)
            .await
            .map_err(|e| not_found(e, path))?;

        if let Some(max) = opts.max_bytes {
            if meta.len() > max {
                return Err(VfsError::SizeLimit {
                    path: path.to_string(),
                    max_bytes: max,
                });
            }
        }

        let mut file = tokio::fs::File::open(&host)
            .await
            .map_err(|e| not_found(e, path))?;
        let mut bytes = Vec::new();
        match opts.max_bytes {
            // Cap the reader one past the limit so growth mid-read is caught.
            Some(max) => {
                let mut capped = (&mut file).take(max.saturating_add(1));
                capped.read_to_end(&mut bytes).await?;
                if bytes.len() as u64 > max {
                    return Err(VfsError::SizeLimit {
                        path: path.to_string(),
                        max_bytes: max,
                    });
                }
            },
            None => {
                file.read_to_end(&mut bytes).await?;
            },
        }

        match opts.encoding {
            ReadEncoding::Utf8 => String::from_utf8(bytes)
                .map(ReadOutput::Text)
                .map_err(|_| VfsError::NotUtf8(path.to_string())),
            ReadEncoding::Binary => Ok(ReadOutput::Bytes(bytes)),
        }
    }

    /// Write a file, materializing parent directories.
    ///
    /// # Errors
    ///
    /// Policy denial, or [`VfsError::AlreadyExists`] for `Create` mode on
    /// an existing target.
    pub async fn write_file(&self, path: &str, bytes: &[u8], mode: WriteMode) -> VfsResult<()> {
        let host = self.resolve(path, AccessKind::Write).await?;

        if mode == WriteMode::Create && tokio::fs::try_exists(&host).await.unwrap_or(false) {
            return Err(VfsError::AlreadyExists(path.to_string()));
        }

        if let Some(parent) = host.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match mode {
            WriteMode::Append => {
                use tokio::io::AsyncWriteExt;
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&host)
                    .await?;
                file.write_all(bytes).await?;
                file.flush().await?;
            },
            WriteMode::Create | WriteMode::Overwrite => {
                tokio::fs::write(&host, bytes).await?;
            },
        }
        Ok(())
    }

    /// Append to a file, creating it if absent.
    ///
    /// # Errors
    ///
    /// Same as [`SandboxFs::write_file`].
    pub async fn append_file(&self, path: &str, bytes: &[u8]) -> VfsResult<()> {
        self.write_file(path, bytes, WriteMode::Append).await
    }

    /// List a directory.
    ///
    /// # Errors
    ///
    /// Policy denial or missing directory.
    pub async fn read_dir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        let host = self.resolve(path, AccessKind::Read).await?;
        let mut read_dir = tokio::fs::read_dir(&host)
            .await
            .map_err(|e| not_found(e, path))?;

        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Create a directory and any missing parents.
    ///
    /// # Errors
    ///
    /// Policy denial or I/O failure.
    pub async fn mkdir(&self, path: &str) -> VfsResult<()> {
        let host = self.resolve(path, AccessKind::Write).await?;
        tokio::fs::create_dir_all(&host).await?;
        Ok(())
    }

    /// Stat a path.
    ///
    /// # Errors
    ///
    /// Policy denial or missing target.
    pub async fn stat(&self, path: &str) -> VfsResult<FileStat> {
        let host = self.resolve(path, AccessKind::Read).await?;
        let meta = tokio::fs::metadata(&host)
            .await
            .map_err(|e| not_found(e, path))?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs());
        Ok(FileStat {
            is_dir: meta.is_dir(),
            is_file: meta.is_file(),
            size: meta.len(),
            mtime,
        })
    }

    /// Whether a path exists.
    ///
    /// # Errors
    ///
    /// Policy denial; a missing target is `Ok(false)`.
    pub async fn exists(&self, path: &str) -> VfsResult<bool> {
        let host = self.resolve(path, AccessKind::Read).await?;
        Ok(tokio::fs::try_exists(&host).await.unwrap_or(false))
    }

    /// Remove a file.
    ///
    /// # Errors
    ///
    /// Policy denial or missing target.
    pub async fn unlink(&self, path: &str) -> VfsResult<()> {
        let host = self.resolve(path, AccessKind::Write).await?;
        tokio::fs::remove_file(&host)
            .await
            .map_err(|e| not_found(e, path))
    }

    /// Remove an empty directory.
    ///
    /// # Errors
    ///
    /// Policy denial, missing target, or non-empty directory.
    pub async fn rmdir(&self, path: &str) -> VfsResult<()> {
        let host = self.resolve(path, AccessKind::Write).await?;
        if host == self.base {
            return Err(VfsError::SandboxViolation(
                "cannot remove the sandbox root".into(),
            ));
        }
        tokio::fs::remove_dir(&host)
            .await
            .map_err(|e| not_found(e, path))
    }

    /// Resolve symlinks and return the virtual form of the real path.
    ///
    /// # Errors
    ///
    /// Policy denial, missing target, or a symlink escaping the base.
    pub async fn realpath(&self, path: &str) -> VfsResult<String> {
        let host = self.resolve(path, AccessKind::Read).await?;
        let real = tokio::fs::canonicalize(&host)
            .await
            .map_err(|e| not_found(e, path))?;
        let rel = real
            .strip_prefix(&self.base)
            .map_err(|_| VfsError::SandboxViolation(format!("{path} escapes the sandbox")))?;
        let rel = rel.to_string_lossy();
        if rel.is_empty() {
            Ok("/".to_string())
        } else {
            Ok(format!("/{rel}"))
        }
    }

    /// Resolve a virtual path to a host path: policy check, lexical join,
    /// and a symlink-containment check on the existing ancestor.
    async fn resolve(&self, path: &str, access: AccessKind) -> VfsResult<PathBuf> {
        let normalized = self.enforcer.check(path, access)?;
        let rel = normalized.trim_start_matches('/');
        let joined = if rel.is_empty() {
            self.base.clone()
        } else {
            self.base.join(rel)
        };

        // Lexical containment: the enforcer already refused `..`, but keep
        // the invariant independent of it.
        if !joined.starts_with(&self.base) {
            return Err(VfsError::SandboxViolation(format!(
                "{path} resolves outside the sandbox"
            )));
        }

        // Canonicalize the deepest existing ancestor and require it to stay
        // under the base, so a symlink planted inside cannot escape.
        let mut existing = joined.clone();
        let mut suffix: Vec<std::ffi::OsString> = Vec::new();
        loop {
            match tokio::fs::symlink_metadata(&existing).await {
                Ok(_) => {
                    let canonical = tokio::fs::canonicalize(&existing).await?;
                    if !canonical.starts_with(&self.base) {
                        return Err(VfsError::SandboxViolation(format!(
                            "{path} escapes the sandbox via a symlink"
                        )));
                    }
                    let mut resolved = canonical;
                    for part in suffix.into_iter().rev() {
                        resolved.push(part);
                    }
                    return Ok(resolved);
                },
                Err(_) => match (existing.parent(), existing.file_name()) {
                    (Some(parent), Some(name)) => {
                        suffix.push(name.to_owned());
                        existing = parent.to_path_buf();
                    },
                    _ => return Ok(joined),
                },
            }
        }
    }
}

fn not_found(err: std::io::Error, path: &str) -> VfsError {
    if err.kind() == std::io::ErrorKind::NotFound {
        VfsError::NotFound(path.to_string())
    } else {
        VfsError::Io(err)
    }
}
