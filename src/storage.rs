//! File Storage Helpers
//!
//! Small wrappers around `std::fs` shared by the model and changeset stores.
//! Every durable write goes through [`write_json_atomic`], which writes a
//! sibling temp file and renames it into place so a crash never leaves a
//! half-written record behind.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ArchError, Result};

/// Suffix for in-flight temp files.
const TEMP_SUFFIX: &str = ".tmp";

/// Create a directory (and parents) if it does not exist yet.
pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path).map_err(|e| ArchError::DirectoryCreateError {
            path: path.to_path_buf(),
            source: e,
        })?;
    }
    Ok(())
}

/// Read a file to a string.
pub fn read_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| ArchError::FileReadError {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Read and parse a JSON file, returning `None` when the file is absent.
///
/// Parse failures are returned as the raw `serde_json::Error` so callers can
/// wrap them in a load error that names the record they were loading.
pub fn read_json_opt<T: DeserializeOwned>(
    path: &Path,
) -> Result<Option<std::result::Result<T, serde_json::Error>>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = read_string(path)?;
    Ok(Some(serde_json::from_str(&content)))
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    write_atomic(path, content.as_bytes())
}

/// Atomically replace `path` with `bytes`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    let temp_path = temp_path_for(path);
    fs::write(&temp_path, bytes).map_err(|e| ArchError::FileWriteError {
        path: temp_path.clone(),
        source: e,
    })?;

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        ArchError::FileWriteError {
            path: path.to_path_buf(),
            source: e,
        }
    })
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ArchError::FileWriteError {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}{}", std::process::id(), TEMP_SUFFIX));
    path.with_file_name(name)
}
