//! Single-file JSON documents with atomic replace and corruption backup.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::StoreError;

/// Result of loading a document.
#[derive(Debug)]
pub enum LoadOutcome<T> {
    /// No document exists yet.
    Missing,
    /// The document parsed successfully.
    Loaded(T),
    /// The document was malformed. Callers may reinitialize it on disk only
    /// when `backup` is `Ok`; otherwise the file is the only copy.
    Corrupt {
        /// Where the malformed document was copied to, or why it was not.
        backup: Result<PathBuf, StoreError>,
        /// Parser error.
        reason: String,
    },
    /// The document exists but could not be read.
    Unreadable(StoreError),
}

/// A JSON document at a fixed path.
#[derive(Debug, Clone)]
pub struct JsonDocument {
    path: PathBuf,
}

impl JsonDocument {
    /// Creates a handle for the document at `path`. Nothing is touched on disk.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Document path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads and parses the document.
    pub fn load<T: DeserializeOwned>(&self) -> LoadOutcome<T> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return LoadOutcome::Missing,
            Err(e) => return LoadOutcome::Unreadable(StoreError::io(&self.path, e)),
        };

        match serde_json::from_str(&raw) {
            Ok(value) => LoadOutcome::Loaded(value),
            Err(e) => {
                let backup = self.backup();
                if let Err(backup_err) = &backup {
                    tracing::error!(
                        path = %self.path.display(),
                        error = %backup_err,
                        "failed to back up corrupt document"
                    );
                }
                LoadOutcome::Corrupt {
                    backup,
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Atomically replaces the document with `value`.
    ///
    /// Writes to a temporary sibling file, fsyncs it, then renames it over the
    /// document. The parent directory is created if needed.
    pub fn save<T: Serialize>(&self, value: &T) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let temp_path = self.temp_path();
        let result = self.write_temp(&temp_path, value).and_then(|()| {
            fs::rename(&temp_path, &self.path).map_err(|e| StoreError::io(&self.path, e))
        });
        if result.is_err() && temp_path.exists() {
            let _ = fs::remove_file(&temp_path);
        }
        result
    }

    /// Copies the current document to a timestamped `.bak` sibling.
    pub fn backup(&self) -> Result<PathBuf, StoreError> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let backup_path = self.sibling(&format!("corrupt-{stamp}.bak"));
        fs::copy(&self.path, &backup_path).map_err(|e| StoreError::io(&backup_path, e))?;
        Ok(backup_path)
    }

    fn write_temp<T: Serialize>(&self, temp_path: &Path, value: &T) -> Result<(), StoreError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(temp_path)
            .map_err(|e| StoreError::io(temp_path, e))?;

        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, value).map_err(|e| {
            StoreError::Serialization {
                path: self.path.clone(),
                message: e.to_string(),
            }
        })?;
        writer.flush().map_err(|e| StoreError::io(temp_path, e))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| StoreError::io(temp_path, e))
    }

    fn temp_path(&self) -> PathBuf {
        self.sibling(&format!("tmp.{}", Uuid::new_v4()))
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".");
        name.push(suffix);
        self.path.with_file_name(name)
    }
}

/// Where an in-memory structure persists, and whether it still does.
///
/// A slot starts durable (backed by a document) or in-memory. The first read
/// or write failure degrades it to in-memory for the rest of the process.
#[derive(Debug)]
pub struct PersistenceSlot {
    document: Option<JsonDocument>,
    degraded: bool,
}

impl PersistenceSlot {
    /// Slot backed by a document.
    #[must_use]
    pub fn durable(document: JsonDocument) -> Self {
        Self {
            document: Some(document),
            degraded: false,
        }
    }

    /// Slot that never touches disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            document: None,
            degraded: false,
        }
    }

    /// The backing document, if any.
    #[must_use]
    pub fn document(&self) -> Option<&JsonDocument> {
        self.document.as_ref()
    }

    /// Returns true while writes still reach disk.
    #[must_use]
    pub fn is_durable(&self) -> bool {
        self.document.is_some() && !self.degraded
    }

    /// Returns true if a storage failure switched this slot to in-memory.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Stops writing to disk for the rest of the process.
    pub fn degrade(&mut self, what: &'static str, error: &StoreError) {
        if !self.degraded {
            tracing::warn!(
                store = what,
                error = %error,
                "storage failure; continuing in memory only"
            );
        }
        self.degraded = true;
    }

    /// Persists `value` if the slot is durable. Failures degrade the slot.
    pub fn persist<T: Serialize>(&mut self, what: &'static str, value: &T) -> bool {
        if !self.is_durable() {
            return false;
        }
        let Some(document) = self.document.as_ref() else {
            return false;
        };
        match document.save(value) {
            Ok(()) => true,
            Err(e) => {
                self.degrade(what, &e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[test]
    fn missing_document_loads_as_missing() {
        let dir = tempdir().unwrap();
        let doc = JsonDocument::new(dir.path().join("nope.json"));
        assert!(matches!(doc.load::<Vec<String>>(), LoadOutcome::Missing));
    }

    #[test]
    fn save_then_load_replaces_atomically() {
        let dir = tempdir().unwrap();
        let doc = JsonDocument::new(dir.path().join("nested").join("doc.json"));

        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 1u32);
        doc.save(&map).unwrap();
        map.insert("b".to_string(), 2u32);
        doc.save(&map).unwrap();

        let LoadOutcome::Loaded(back) = doc.load::<BTreeMap<String, u32>>() else {
            panic!("expected loaded document");
        };
        assert_eq!(back, map);

        let leftovers: Vec<_> = fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn corrupt_document_is_backed_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        fs::write(&path, "{corrupt_json").unwrap();

        let doc = JsonDocument::new(&path);
        let LoadOutcome::Corrupt { backup, .. } = doc.load::<Vec<String>>() else {
            panic!("expected corrupt outcome");
        };
        let backup = backup.unwrap();
        assert!(backup.exists());
        assert_eq!(fs::read_to_string(backup).unwrap(), "{corrupt_json");
    }

    #[test]
    fn failed_write_degrades_slot() {
        let dir = tempdir().unwrap();
        // A directory where the document should be makes the rename fail.
        let path = dir.path().join("doc.json");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("occupant"), "x").unwrap();

        let mut slot = PersistenceSlot::durable(JsonDocument::new(&path));
        assert!(slot.is_durable());
        assert!(!slot.persist("test", &vec![1, 2, 3]));
        assert!(slot.is_degraded());
        assert!(!slot.is_durable());
    }
}
