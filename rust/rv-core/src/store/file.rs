// rust/rv-core/src/store/file.rs

//! Filesystem-backed record store.
//!
//! Records live as plain UTF-8 files named `<job_id>.<key>` directly under the
//! shared root. Writes go to a hidden temp file in the same directory and are
//! renamed into place, so a reader on any node sees either the old record, the
//! new record, or nothing, never a truncated value.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::traits::{validate_component, validate_job_id, RecordStore};
use crate::config::StoreConfig;
use crate::error::{Result, RvError};

/// Record store rooted at a directory visible to every node.
#[derive(Debug, Clone)]
pub struct FileRecordStore {
    root: PathBuf,
    /// Whether to fsync record files before renaming them into place.
    sync: bool,
}

impl FileRecordStore {
    /// Creates a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();

        if !root.exists() {
            fs::create_dir_all(&root).map_err(|e| {
                RvError::store_with_source(&root, "failed to create shared root", e)
            })?;
        }

        Ok(Self { root, sync: true })
    }

    /// Creates a store from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let mut store = Self::new(&config.root)?;
        store.sync = config.sync_writes;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Full path of the record file for `(job_id, key)`.
    pub fn record_path(&self, job_id: &str, key: &str) -> Result<PathBuf> {
        validate_job_id(job_id)?;
        validate_component(key)?;
        Ok(self.root.join(format!("{job_id}.{key}")))
    }

    /// Writes `value` into a fresh hidden temp file next to the final record.
    fn write_temp(&self, job_id: &str, key: &str, value: &str) -> Result<PathBuf> {
        let temp_path = self
            .root
            .join(format!(".{job_id}.{key}.{}.tmp", Uuid::new_v4().simple()));

        let mut file = File::create(&temp_path).map_err(|e| {
            RvError::store_with_source(&temp_path, "failed to create temp record", e)
        })?;

        let written = file.write_all(value.as_bytes()).and_then(|()| {
            if self.sync {
                file.sync_all()
            } else {
                Ok(())
            }
        });

        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(RvError::store_with_source(
                &temp_path,
                "failed to write temp record",
                e,
            ));
        }

        Ok(temp_path)
    }
}

impl RecordStore for FileRecordStore {
    fn write(&self, job_id: &str, key: &str, value: &str) -> Result<()> {
        let final_path = self.record_path(job_id, key)?;
        let temp_path = self.write_temp(job_id, key, value)?;

        fs::rename(&temp_path, &final_path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            RvError::store_with_source(
                &temp_path,
                format!("failed to rename to {}", final_path.display()),
                e,
            )
        })?;

        tracing::debug!(job_id, key, path = %final_path.display(), "record written");
        Ok(())
    }

    fn create(&self, job_id: &str, key: &str, value: &str) -> Result<bool> {
        let final_path = self.record_path(job_id, key)?;
        let temp_path = self.write_temp(job_id, key, value)?;

        // hard_link refuses to replace an existing file, which makes the
        // publish atomic and exclusive at the same time
        let linked = fs::hard_link(&temp_path, &final_path);
        let _ = fs::remove_file(&temp_path);

        match linked {
            Ok(()) => {
                tracing::debug!(job_id, key, path = %final_path.display(), "record created");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(RvError::store_with_source(
                &final_path,
                "failed to create record",
                e,
            )),
        }
    }

    fn read(&self, job_id: &str, key: &str) -> Result<Option<String>> {
        let path = self.record_path(job_id, key)?;

        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RvError::store_with_source(&path, "failed to read record", e)),
        }
    }

    fn delete(&self, job_id: &str, key: &str) -> bool {
        let path = match self.record_path(job_id, key) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(job_id, key, error = %e, "refusing to delete invalid record");
                return false;
            }
        };

        match fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to delete record");
                false
            }
        }
    }

    fn list(&self, job_id: &str) -> Result<Vec<String>> {
        validate_job_id(job_id)?;

        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let prefix = format!("{job_id}.");
        let mut keys = Vec::new();

        for entry in fs::read_dir(&self.root).map_err(|e| {
            RvError::store_with_source(&self.root, "failed to read shared root", e)
        })? {
            let entry = entry.map_err(|e| {
                RvError::store_with_source(&self.root, "failed to read directory entry", e)
            })?;

            if let Some(name) = entry.file_name().to_str() {
                if let Some(key) = name.strip_prefix(&prefix) {
                    if !key.is_empty() {
                        keys.push(key.to_string());
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}
