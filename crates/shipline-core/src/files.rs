//! Flat-file persistence helpers.
//!
//! All state is kept in small JSON documents. Writes go to a sibling
//! `.tmp` file that is then renamed over the target, so readers never
//! observe a half-written document.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// Outcome of reading a JSON document that may be absent or damaged.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonLoad {
    /// The file does not exist.
    Missing,
    /// The file exists but is not valid JSON.
    Malformed(String),
    /// The parsed document.
    Loaded(Value),
}

impl JsonLoad {
    /// The parsed document when it is a JSON object.
    pub fn into_object(self) -> Option<serde_json::Map<String, Value>> {
        match self {
            JsonLoad::Loaded(Value::Object(map)) => Some(map),
            _ => None,
        }
    }
}

/// Read and parse a JSON document. Only I/O failures other than
/// not-found are errors; parse failures are reported as [`JsonLoad::Malformed`].
pub fn load_json(path: &Path) -> CoreResult<JsonLoad> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(JsonLoad::Missing),
        Err(e) if e.kind() == ErrorKind::InvalidData => {
            return Ok(JsonLoad::Malformed(format!("invalid utf-8: {e}")));
        }
        Err(e) => return Err(CoreError::io(path, e)),
    };
    match serde_json::from_str(&text) {
        Ok(value) => Ok(JsonLoad::Loaded(value)),
        Err(e) => Ok(JsonLoad::Malformed(e.to_string())),
    }
}

/// Path of the temporary sibling used by [`write_json_atomic`].
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> CoreResult<()> {
    let mut text = serde_json::to_string_pretty(value).map_err(|source| CoreError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    text.push('\n');
    write_text_atomic(path, &text)
}

/// Atomically replace `path` with `text`, creating parent directories.
pub fn write_text_atomic(path: &Path, text: &str) -> CoreResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| CoreError::io(parent, e))?;
    }
    let tmp = tmp_path(path);
    fs::write(&tmp, text).map_err(|e| CoreError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| CoreError::io(path, e))?;
    debug!(path = %path.display(), bytes = text.len(), "document written");
    Ok(())
}

/// Display form of a path with forward slashes.
pub fn posix(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let load = load_json(&dir.path().join("absent.json")).unwrap();
        assert_eq!(load, JsonLoad::Missing);
    }

    #[test]
    fn malformed_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_json(&path).unwrap(), JsonLoad::Malformed(_)));
    }

    #[test]
    fn atomic_write_creates_parents_and_leaves_no_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/state.json");
        write_json_atomic(&path, &json!({"k": 1})).unwrap();

        assert!(!tmp_path(&path).exists());
        let back = load_json(&path).unwrap().into_object().unwrap();
        assert_eq!(back["k"], 1);
    }

    #[test]
    fn tmp_path_appends_suffix() {
        assert_eq!(
            tmp_path(Path::new("a/b/store.json")),
            PathBuf::from("a/b/store.json.tmp")
        );
    }
}
