// rust/rv-core/src/store/traits.rs

//! Record store trait.

use crate::error::{Result, RvError};

/// Job-scoped key/value records on a shared medium.
///
/// # Object Safety
///
/// This trait is object-safe and is normally used as `Arc<dyn RecordStore>`.
pub trait RecordStore: Send + Sync {
    /// Creates or replaces a record.
    ///
    /// Readers never observe a partially written value.
    ///
    /// # Errors
    ///
    /// Returns an error if the job id or key is invalid or the write fails.
    fn write(&self, job_id: &str, key: &str, value: &str) -> Result<()>;

    /// Creates a record only if it does not exist yet.
    ///
    /// Returns `false` (and leaves the existing value untouched) if a record
    /// was already present.
    ///
    /// # Errors
    ///
    /// Returns an error if the job id or key is invalid or the write fails.
    fn create(&self, job_id: &str, key: &str, value: &str) -> Result<bool>;

    /// Reads a record without blocking.
    ///
    /// `Ok(None)` means the record does not exist; an existing empty record
    /// reads as `Ok(Some(String::new()))`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be read.
    fn read(&self, job_id: &str, key: &str) -> Result<Option<String>>;

    /// Deletes a record, best effort.
    ///
    /// Failures are logged, never returned. Deleting a missing record is a
    /// no-op. Returns `true` if a record was removed.
    fn delete(&self, job_id: &str, key: &str) -> bool;

    /// Lists the keys currently present for a job, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing medium cannot be listed.
    fn list(&self, job_id: &str) -> Result<Vec<String>>;

    /// Deletes every record of a job, best effort. Returns how many were removed.
    fn clear(&self, job_id: &str) -> usize {
        match self.list(job_id) {
            Ok(keys) => keys.iter().filter(|key| self.delete(job_id, key)).count(),
            Err(e) => {
                tracing::warn!(job_id, error = %e, "failed to list records for cleanup");
                0
            }
        }
    }
}

/// Validates a job id or key so it maps onto a single plain file name.
///
/// # Errors
///
/// Returns `InvalidKey` for empty strings, path separators, NUL bytes, a
/// leading `.` (reserved for temp files) or the `..` sequence.
pub fn validate_component(component: &str) -> Result<()> {
    if component.is_empty() {
        return Err(RvError::invalid_key(component, "must not be empty"));
    }
    if component.starts_with('.') {
        return Err(RvError::invalid_key(component, "must not start with '.'"));
    }
    if component.contains(['/', '\\', '\0']) {
        return Err(RvError::invalid_key(
            component,
            "must not contain path separators or NUL",
        ));
    }
    if component.contains("..") {
        return Err(RvError::invalid_key(component, "must not contain '..'"));
    }
    Ok(())
}

/// Validates a job id. Job ids additionally exclude `.`, which separates the
/// job id from the key in record names.
///
/// # Errors
///
/// Returns `InvalidKey` for anything `validate_component` rejects or a `.`.
pub fn validate_job_id(job_id: &str) -> Result<()> {
    validate_component(job_id)?;
    if job_id.contains('.') {
        return Err(RvError::invalid_key(job_id, "job id must not contain '.'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_components() {
        for ok in ["42", "address", "node.3", "gather.0.12", "job-7_a"] {
            assert!(validate_component(ok).is_ok(), "{ok} should be valid");
        }
    }

    #[test]
    fn test_invalid_components() {
        for bad in ["", ".hidden", "a/b", "a\\b", "a..b", "nul\0"] {
            let err = validate_component(bad).unwrap_err();
            assert!(matches!(err, RvError::InvalidKey { .. }), "{bad:?}");
        }
    }

    #[test]
    fn test_job_id_rejects_dot() {
        assert!(validate_job_id("42").is_ok());
        assert!(validate_job_id("123_4").is_ok());
        assert!(validate_job_id("4.node").is_err());
    }
}
