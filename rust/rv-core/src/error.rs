// rust/rv-core/src/error.rs

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RvError {

    #[error("Store error at '{path}': {message}")]
    Store {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Invalid record key '{key}': {reason}")]
    InvalidKey {
        key: String,
        reason: &'static str,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Rendezvous timed out after {waited:?} waiting for '{key}' of job '{job_id}'")]
    RendezvousTimeout {
        job_id: String,
        key: String,
        waited: Duration,
    },

    #[error("Job '{job_id}' already has a head address '{existing}'")]
    AddressConflict {
        job_id: String,
        existing: String,
    },

    #[error("Collective {operation} (round {round}) timed out after {waited:?}; missing ranks {missing:?}")]
    CollectiveTimeout {
        operation: &'static str,
        round: u64,
        missing: Vec<usize>,
        waited: Duration,
    },

    #[error("Cluster runtime error: {message}")]
    Cluster {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Signal handling error: {message}")]
    Signal {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Workload error: {message}")]
    Workload {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

pub type Result<T> = std::result::Result<T, RvError>;

// Convenience constructors
impl RvError {

    pub fn store(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Store {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn store_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Store {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn invalid_key(key: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn rendezvous_timeout(
        job_id: impl Into<String>,
        key: impl Into<String>,
        waited: Duration,
    ) -> Self {
        Self::RendezvousTimeout {
            job_id: job_id.into(),
            key: key.into(),
            waited,
        }
    }

    pub fn cluster(message: impl Into<String>) -> Self {
        Self::Cluster {
            message: message.into(),
            source: None,
        }
    }

    pub fn cluster_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Cluster {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn signal_with_source(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Signal {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn signal(message: impl Into<String>) -> Self {
        Self::Signal {
            message: message.into(),
            source: None,
        }
    }

    pub fn workload(message: impl Into<String>) -> Self {
        Self::Workload {
            message: message.into(),
            source: None,
        }
    }

    pub fn workload_with_source(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Workload {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Returns true for the one condition that must fail a worker outright.
    pub fn is_rendezvous_timeout(&self) -> bool {
        matches!(self, Self::RendezvousTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = RvError::rendezvous_timeout("7", "address", Duration::from_secs(2));
        let msg = err.to_string();
        assert!(msg.contains("'address'"));
        assert!(msg.contains("job '7'"));
        assert!(err.is_rendezvous_timeout());
    }

    #[test]
    fn test_store_error_keeps_source() {
        use std::error::Error as _;

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err = RvError::store_with_source("/shared/42.address", "failed to write", io);
        assert!(err.source().is_some());
        assert!(!err.is_rendezvous_timeout());
    }
}
