//! Deterministic ZIP layers.
//!
//! Layers are content-addressed, so two builds of the same bytes must
//! produce bit-identical archives: entries are written in sorted order with
//! the epoch timestamp and no per-entry metadata.

use std::io::{Cursor, Read, Write};
use std::path::Path;

use sha2::{Digest, Sha256};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{CapsuleError, CapsuleResult};

/// SHA-256 of a byte slice, lowercase hex.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Build a ZIP from `(path, bytes)` entries. Entries are sorted by path
/// before writing so the archive is deterministic.
///
/// # Errors
///
/// Returns [`CapsuleError::Layer`] if the archive cannot be written.
pub fn write_zip(mut entries: Vec<(String, Vec<u8>)>) -> CapsuleResult<Vec<u8>> {
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());

    for (path, bytes) in entries {
        writer
            .start_file(path.as_str(), options)
            .map_err(|e| CapsuleError::Layer(format!("start {path}: {e}")))?;
        writer
            .write_all(&bytes)
            .map_err(|e| CapsuleError::Layer(format!("write {path}: {e}")))?;
    }

    let cursor = writer
        .finish()
        .map_err(|e| CapsuleError::Layer(format!("finish archive: {e}")))?;
    Ok(cursor.into_inner())
}

/// Read one entry out of a ZIP.
///
/// # Errors
///
/// Returns [`CapsuleError::Layer`] if the archive is malformed or the
/// entry is absent.
pub fn read_zip_entry(zip_bytes: &[u8], name: &str) -> CapsuleResult<Vec<u8>> {
    let mut archive = ZipArchive::new(Cursor::new(zip_bytes))
        .map_err(|e| CapsuleError::Layer(format!("open archive: {e}")))?;
    let mut file = archive
        .by_name(name)
        .map_err(|e| CapsuleError::Layer(format!("entry {name}: {e}")))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .map_err(|e| CapsuleError::Layer(format!("read {name}: {e}")))?;
    Ok(bytes)
}

/// Extract a ZIP under `dest`, refusing entries that would land outside it.
///
/// # Errors
///
/// Returns [`CapsuleError::Layer`] for malformed archives or zip-slip
/// entries, [`CapsuleError::Io`] for filesystem failures.
pub fn extract_zip(zip_bytes: &[u8], dest: &Path) -> CapsuleResult<()> {
    let mut archive = ZipArchive::new(Cursor::new(zip_bytes))
        .map_err(|e| CapsuleError::Layer(format!("open archive: {e}")))?;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| CapsuleError::Layer(format!("entry {i}: {e}")))?;
        let Some(rel) = file.enclosed_name().map(Path::to_path_buf) else {
            return Err(CapsuleError::Layer(format!(
                "entry {:?} escapes the extraction root",
                file.name()
            )));
        };
        let out = dest.join(rel);

        if file.is_dir() {
            std::fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|e| CapsuleError::Layer(format!("read entry {i}: {e}")))?;
        std::fs::write(&out, bytes)?;
    }
    Ok(())
}
