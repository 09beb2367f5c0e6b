// rust/rv-core/src/store/mod.rs

//! Shared record store.
//!
//! A tiny key/value surface namespaced by job id and backed by a directory
//! that every node of the job can see (an NFS or Lustre scratch path, for
//! example). Records are whole values: writers replace them atomically and
//! readers either see the complete value or nothing.
//!
//! Each key has exactly one writer for the lifetime of a job, so the store
//! needs no locking.
//!
//! # Example
//!
//! ```no_run
//! use rv_core::store::{FileRecordStore, RecordStore};
//!
//! let store = FileRecordStore::new("/scratch/.rv/cluster").unwrap();
//!
//! store.write("42", "address", "10.0.0.1:6379").unwrap();
//! assert_eq!(store.read("42", "address").unwrap().as_deref(), Some("10.0.0.1:6379"));
//!
//! store.delete("42", "address");
//! assert!(store.read("42", "address").unwrap().is_none());
//! ```

mod file;
mod traits;

pub mod keys;

pub use file::FileRecordStore;
pub use traits::{validate_component, validate_job_id, RecordStore};
