// rust/rv-core/src/lib.rs

//! Rendezvous Core Library
//!
//! Bootstraps a multi-node job on a batch cluster without any coordination
//! service: nodes find each other through records on a shared filesystem,
//! verify where they landed, and run long jobs as resumable segments.

pub mod clock;
pub mod config;
pub mod error;
pub mod node;
pub mod poll;

// Re-export commonly used types for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RvConfig, FAILURE_EXIT_CODE};
pub use error::{Result, RvError};
pub use node::{NodeIdentity, Role};
pub use poll::{poll_until, PollOutcome, PollPolicy};

pub mod store;
pub use store::{FileRecordStore, RecordStore};

pub mod rendezvous;
pub use rendezvous::{ClusterRuntime, Formation, FormationStatus, Rendezvous, StoreCluster};

pub mod topology;
pub use topology::{Collective, StoreCollective, TopologyReport, TopologySnapshot};

pub mod segment;
pub use segment::{SegmentController, SegmentExit, SegmentReport, SignalWatcher};
