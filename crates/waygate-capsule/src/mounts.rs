//! Mount layer construction.
//!
//! Directory mounts walk the source tree and archive it minus common noise;
//! git mounts clone the requested ref into a temporary checkout first. A
//! failed mount build fails the whole capsule build, never silently.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use walkdir::WalkDir;
use waygate_policy::{MountSpec, MountType};

use crate::error::{CapsuleError, CapsuleResult};
use crate::layer;

/// Build the ZIP bytes for one declared mount.
///
/// # Errors
///
/// Returns [`CapsuleError::DepsResolutionFailed`] when the source is
/// missing or the git clone fails.
pub async fn build_mount_layer(spec: &MountSpec) -> CapsuleResult<Vec<u8>> {
    match spec.mount_type {
        MountType::Directory => archive_directory(Path::new(&spec.source)),
        MountType::Git => {
            // Temp clone lives only for the duration of the archive step;
            // the TempDir guard removes it on every exit path.
            let checkout = tempfile::tempdir()?;
            clone_into(&spec.source, spec.git_ref.as_deref(), checkout.path()).await?;
            archive_directory(checkout.path())
        },
    }
}

/// Entries excluded from directory archives.
fn is_noise(name: &str) -> bool {
    name == ".git" || name == "node_modules" || name.starts_with('.') || name.ends_with(".log")
}

fn archive_directory(source: &Path) -> CapsuleResult<Vec<u8>> {
    if !source.is_dir() {
        return Err(CapsuleError::DepsResolutionFailed(format!(
            "mount source is not a directory: {}",
            source.display()
        )));
    }

    let mut entries = Vec::new();
    let walker = WalkDir::new(source).into_iter().filter_entry(|e| {
        e.file_name()
            .to_str()
            .map_or(true, |name| e.depth() == 0 || !is_noise(name))
    });

    for entry in walker {
        let entry =
            entry.map_err(|e| CapsuleError::DepsResolutionFailed(format!("walk mount: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| CapsuleError::DepsResolutionFailed(format!("mount path: {e}")))?;
        let rel = rel.to_string_lossy().replace('\\', "/");
        let bytes = std::fs::read(entry.path())?;
        entries.push((rel, bytes));
    }

    layer::write_zip(entries)
}

async fn clone_into(source: &str, git_ref: Option<&str>, dest: &Path) -> CapsuleResult<()> {
    let git = which::which("git").map_err(|_| {
        CapsuleError::DepsResolutionFailed("git not found on PATH for a git mount".into())
    })?;

    let mut cmd = Command::new(git);
    cmd.arg("clone").arg("--depth").arg("1");
    if let Some(reference) = git_ref {
        cmd.arg("--branch").arg(reference);
    }
    cmd.arg(source)
        .arg(dest)
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let out = cmd
        .output()
        .await
        .map_err(|e| CapsuleError::DepsResolutionFailed(format!("spawn git: {e}")))?;

    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        return Err(CapsuleError::DepsResolutionFailed(format!(
            "git clone {source} failed: {}",
            stderr.trim()
        )));
    }
    Ok(())
}
