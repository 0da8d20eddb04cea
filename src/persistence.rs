//! Write-temp-then-rename persistence, used by every component that snapshots
//! state to the `database/` directory (client registry, blocklist,
//! performance log, metrics history, archived models).
//!
//! Mirrors the restrictive-permissions-on-write habit the rest of the crate
//! uses for config: any file under `database/` may carry tokens or model
//! weights, so it gets the same `0o600` treatment on Unix.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::error::PersistenceError;

/// Write `bytes` atomically to `path`: stage in a sibling temp file in the
/// same directory (so the final rename is same-filesystem and atomic), then
/// rename over the destination. A reader never observes a partially written
/// file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|source| PersistenceError {
        path: path.display().to_string(),
        source,
    })?;

    let tmp_name = format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("snapshot"),
        std::process::id()
    );
    let tmp_path = dir.join(tmp_name);

    let write_result = (|| -> std::io::Result<()> {
        let mut f = File::create(&tmp_path)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            f.set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    })();

    if let Err(source) = write_result {
        let _ = fs::remove_file(&tmp_path);
        return Err(PersistenceError {
            path: path.display().to_string(),
            source,
        });
    }

    fs::rename(&tmp_path, path).map_err(|source| PersistenceError {
        path: path.display().to_string(),
        source,
    })
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| PersistenceError {
        path: path.display().to_string(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })?;
    write_atomic(path, &bytes)
}

/// Append one JSON value as a line to a JSONL file. Used by the ADRM
/// performance log, which the original treats as an auditable history
/// rather than a latest-pair snapshot (SPEC_FULL §10.7).
pub fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|source| PersistenceError {
        path: path.display().to_string(),
        source,
    })?;
    let line = serde_json::to_string(value).map_err(|e| PersistenceError {
        path: path.display().to_string(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })?;
    let mut f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| PersistenceError {
            path: path.display().to_string(),
            source,
        })?;
    writeln!(f, "{line}").map_err(|source| PersistenceError {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        a: u32,
        b: String,
    }

    #[test]
    fn write_json_atomic_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("snapshot.json");
        let value = Sample {
            a: 7,
            b: "hi".into(),
        };
        write_json_atomic(&path, &value).unwrap();
        let read_back: Sample = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(read_back, value);
    }

    #[test]
    fn no_temp_file_left_behind_on_success() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        write_json_atomic(&path, &Sample { a: 1, b: "x".into() }).unwrap();
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn append_jsonl_accumulates_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        append_jsonl(&path, &Sample { a: 1, b: "x".into() }).unwrap();
        append_jsonl(&path, &Sample { a: 2, b: "y".into() }).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
