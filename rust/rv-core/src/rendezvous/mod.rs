// rust/rv-core/src/rendezvous/mod.rs

//! Head/worker rendezvous over the shared record store.
//!
//! Rank 0 starts the cluster runtime, publishes its attempt and address
//! under `<job_id>.attempt` and `<job_id>.address` and waits for membership.
//! Every other rank polls until the attempt matches its own, reads the
//! address, joins, and later idles until the head publishes `done`.
//!
//! ```text
//!   head (rank 0)                         worker (rank > 0)
//!   clear stale records
//!   start runtime ──► address
//!   write  <job>.attempt  ───────────►   poll <job>.attempt (own attempt)
//!   write  <job>.address  ───────────►   read <job>.address
//!   poll alive_nodes  ◄──────────────    join(address)
//!   ... run ...                           ... run ...
//!   write  <job>.done  ──────────────►   poll <job>.done
//!   poll   <job>.ack.*  ◄────────────    write <job>.ack.<rank>
//!   shutdown, delete <job>.*
//! ```
//!
//! Only a worker failing to find the address is fatal. A short membership
//! (degraded formation) and a missing completion record are logged and the
//! run carries on.

mod cluster;
mod protocol;

pub use cluster::{join_host_port, resolve_advertise_host, split_host_port, ClusterRuntime, StoreCluster};
pub use protocol::{AckSummary, DoneWait, Formation, FormationStatus, HeadShutdown, Rendezvous};
