//! File I/O primitives: atomic write, directory ensure, append-only JSON.
//!
//! Generalizes the host's `file_storage::atomic_write`/`ensure_dir`/`read_json`
//! (`examples/dario-valles-Ralph-UI/src-tauri/src/file_storage/mod.rs`), adding
//! the fsync step spec.md §4.3/§8 requires so a crash between write and
//! rename never leaves a torn file on disk.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Common file operations result type, matching the host's `FileResult<T>`.
pub type FileResult<T> = Result<T, String>;

/// Ensure a directory exists, creating all parents as needed.
pub fn ensure_dir(path: &Path) -> FileResult<()> {
    if !path.exists() {
        fs::create_dir_all(path).map_err(|e| format!("failed to create directory {:?}: {}", path, e))?;
    }
    Ok(())
}

/// Write `content` to `path` atomically: write to a sibling `.tmp` file,
/// fsync it, then rename over the destination. A crash at any point
/// leaves either the previous file or the fully-written new one, never a
/// partial write (spec.md §8 property 2).
pub fn atomic_write(path: &Path, content: &[u8]) -> FileResult<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    let tmp_path = path.with_extension(tmp_extension(path));

    {
        let mut file = File::create(&tmp_path)
            .map_err(|e| format!("failed to create temp file {:?}: {}", tmp_path, e))?;
        file.write_all(content)
            .map_err(|e| format!("failed to write temp file {:?}: {}", tmp_path, e))?;
        file.sync_all()
            .map_err(|e| format!("failed to fsync temp file {:?}: {}", tmp_path, e))?;
    }

    fs::rename(&tmp_path, path)
        .map_err(|e| format!("failed to rename {:?} to {:?}: {}", tmp_path, path, e))?;

    Ok(())
}

/// Write serializable `value` as pretty (2-space indent) JSON, atomically.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> FileResult<()> {
    let content = serde_json::to_vec_pretty(value).map_err(|e| format!("failed to serialize JSON: {}", e))?;
    atomic_write(path, &content)
}

/// Read and deserialize a JSON file.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> FileResult<T> {
    let content = fs::read_to_string(path).map_err(|e| format!("failed to read file {:?}: {}", path, e))?;
    serde_json::from_str(&content).map_err(|e| format!("failed to parse JSON from {:?}: {}", path, e))
}

/// Read and deserialize a JSON file if it exists, else `None`.
pub fn read_json_opt<T: serde::de::DeserializeOwned>(path: &Path) -> FileResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    read_json(path).map(Some)
}

/// Zero-pad an iteration number to a 4-digit filename stem, per spec.md §6.
/// Numbers beyond 9999 still serialize (widened, not truncated) so
/// lexicographic sort breaks only where the spec's own Open Question says
/// it may (§9), rather than panicking or losing data.
pub fn zero_padded_iteration(n: u32) -> String {
    format!("{:04}", n)
}

fn tmp_extension(path: &Path) -> std::ffi::OsString {
    let mut ext = path
        .extension()
        .map(|e| e.to_os_string())
        .unwrap_or_default();
    if !ext.is_empty() {
        ext.push(".tmp");
    } else {
        ext.push("tmp");
    }
    ext
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a").join("b.json");
        atomic_write_json(&path, &serde_json::json!({"x": 1})).unwrap();
        let value: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(value, serde_json::json!({"x": 1}));
    }

    #[test]
    fn no_tmp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.json");
        atomic_write_json(&path, &serde_json::json!({})).unwrap();
        assert!(!dir.path().join("session.json.tmp").exists());
        assert!(path.exists());
    }

    #[test]
    fn read_json_opt_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.json");
        let value: Option<serde_json::Value> = read_json_opt(&path).unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn padding_widens_past_nine_thousand_nine_hundred_ninety_nine() {
        assert_eq!(zero_padded_iteration(1), "0001");
        assert_eq!(zero_padded_iteration(9999), "9999");
        assert_eq!(zero_padded_iteration(10000), "10000");
    }
}
