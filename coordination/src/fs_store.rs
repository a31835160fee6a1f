//! Small filesystem helpers shared by the file-backed stores.
//!
//! Every whole-document write goes through [`write_atomic`]: write
//! a uniquely named temp file next to the target, then rename over it. Readers
//! never observe a half-written record.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

/// Outcome of reading a single JSON record.
#[derive(Debug)]
pub(crate) enum Record<T> {
    Missing,
    Corrupt(String),
    Present(T),
}

impl<T> Record<T> {
    /// Collapse to `Option`, logging corruption.
    pub(crate) fn ok_or_log(self, path: &Path) -> Option<T> {
        match self {
            Record::Present(value) => Some(value),
            Record::Missing => None,
            Record::Corrupt(reason) => {
                warn!(path = %path.display(), %reason, "Skipping unreadable record");
                None
            }
        }
    }
}

/// Write `value` as pretty JSON to `path` via temp file + rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

/// Replace `path` with `bytes` via temp file + rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = temp_path_for(path);
    fs::write(&temp_path, bytes)?;
    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    Ok(())
}

/// Read and parse one JSON record.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<Record<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Record::Missing),
        Err(e) => return Err(e),
    };
    match serde_json::from_str(&content) {
        Ok(value) => Ok(Record::Present(value)),
        Err(e) => Ok(Record::Corrupt(e.to_string())),
    }
}

/// Parse every `*.json` file in `dir`, skipping unreadable ones.
///
/// A missing directory is an empty result.
pub(crate) fn scan_json_dir<T: DeserializeOwned>(dir: &Path) -> io::Result<Vec<T>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut records = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        match read_json::<T>(&path) {
            Ok(record) => {
                if let Some(value) = record.ok_or_log(&path) {
                    records.push(value);
                }
            }
            // Raced with a rename or a concurrent delete.
            Err(e) => debug!(path = %path.display(), error = %e, "Record vanished during scan"),
        }
    }
    Ok(records)
}

/// Map an id to a file name inside `dir`.
///
/// Bytes outside `[A-Za-z0-9_-]` (and a dot in leading position) are written
/// as `%XX`, so distinct ids always get distinct files.
pub(crate) fn record_path(dir: &Path, id: &str, extension: &str) -> PathBuf {
    let mut name = String::with_capacity(id.len());
    for (i, byte) in id.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric()
            || byte == b'-'
            || byte == b'_'
            || (byte == b'.' && i > 0);
        if keep {
            name.push(byte as char);
        } else {
            name.push_str(&format!("%{byte:02X}"));
        }
    }
    dir.join(format!("{name}.{extension}"))
}

fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(
        ".{file_name}.{}.tmp",
        uuid::Uuid::new_v4().simple()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        id: String,
        n: u32,
    }

    #[test]
    fn test_atomic_write_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("a.json");
        let sample = Sample {
            id: "a".into(),
            n: 1,
        };
        write_json_atomic(&path, &sample).unwrap();

        match read_json::<Sample>(&path).unwrap() {
            Record::Present(read) => assert_eq!(read, sample),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_scan_skips_corrupt_and_temp_files() {
        let dir = tempdir().unwrap();
        write_json_atomic(
            &dir.path().join("good.json"),
            &Sample {
                id: "good".into(),
                n: 2,
            },
        )
        .unwrap();
        fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        fs::write(dir.path().join(".x.json.abc.tmp"), "{}").unwrap();

        let records: Vec<Sample> = scan_json_dir(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "good");
    }

    #[test]
    fn test_scan_missing_dir_is_empty() {
        let dir = tempdir().unwrap();
        let records: Vec<Sample> = scan_json_dir(&dir.path().join("nope")).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_record_path_escapes_unsafe_bytes() {
        let path = record_path(Path::new("/tmp/x"), "RUN_DEBATE:d1/../", "json");
        assert_eq!(path, Path::new("/tmp/x/RUN_DEBATE%3Ad1%2F..%2F.json"));
        let hidden = record_path(Path::new("/tmp/x"), ".env", "json");
        assert_eq!(hidden, Path::new("/tmp/x/%2Eenv.json"));
    }

    #[test]
    fn test_record_path_is_injective() {
        let dir = Path::new("/tmp/x");
        let ids = ["a:b", "a_b", "a%3Ab", "a/b", "a b", "é"];
        let paths: std::collections::HashSet<_> =
            ids.iter().map(|id| record_path(dir, id, "json")).collect();
        assert_eq!(paths.len(), ids.len());
        assert_eq!(record_path(dir, "run-42_x.y", "json"), dir.join("run-42_x.y.json"));
    }
}
