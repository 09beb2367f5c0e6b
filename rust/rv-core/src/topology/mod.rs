// rust/rv-core/src/topology/mod.rs

//! Verifies where the ranks actually landed once the cluster is up.
//!
//! Every rank reports its hostname through a [`Collective`]; rank 0 counts
//! distinct hosts, flags single-node degeneration and cross-checks the
//! advertised head address. Nothing here fails the run: findings are
//! warnings for the operator.

mod collective;
mod verifier;

pub use collective::{Collective, LocalGroup, StoreCollective};
pub use verifier::{
    rank_line, verify, HeadCheck, TopologyReport, TopologySnapshot, TopologyWarning,
};
