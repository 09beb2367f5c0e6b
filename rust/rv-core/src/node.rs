// rust/rv-core/src/node.rs

//! Identity of the process running on this node.

use std::fmt;

use crate::config::RvConfig;

/// Role in the rendezvous, decided purely by rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Rank 0: starts the runtime and publishes its address.
    Head,
    /// Every other rank: discovers the address and joins.
    Worker,
}

impl Role {
    pub fn from_rank(rank: usize) -> Self {
        if rank == 0 {
            Self::Head
        } else {
            Self::Worker
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Head => f.write_str("head"),
            Self::Worker => f.write_str("worker"),
        }
    }
}

/// One participating process: where it runs and which rank it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub hostname: String,
    pub rank: usize,
    pub local_rank: usize,
    pub world_size: usize,
}

impl NodeIdentity {
    pub fn new(hostname: impl Into<String>, rank: usize, local_rank: usize, world_size: usize) -> Self {
        Self {
            hostname: hostname.into(),
            rank,
            local_rank,
            world_size,
        }
    }

    /// Builds the identity from configuration, falling back to
    /// `detected_hostname` when the config does not pin one.
    pub fn from_config(config: &RvConfig, detected_hostname: &str) -> Self {
        let hostname = config
            .node
            .hostname
            .clone()
            .unwrap_or_else(|| detected_hostname.to_string());
        Self::new(
            hostname,
            config.node.rank,
            config.node.local_rank,
            config.node.world_size,
        )
    }

    pub fn role(&self) -> Role {
        Role::from_rank(self.rank)
    }

    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_from_rank() {
        assert_eq!(Role::from_rank(0), Role::Head);
        assert_eq!(Role::from_rank(1), Role::Worker);
        assert_eq!(Role::from_rank(17), Role::Worker);
        assert_eq!(Role::Head.to_string(), "head");
    }

    #[test]
    fn test_from_config_prefers_override() {
        let mut config = RvConfig::default();
        config.node.rank = 1;
        config.node.world_size = 4;

        let detected = NodeIdentity::from_config(&config, "gpu-a01");
        assert_eq!(detected.hostname, "gpu-a01");
        assert!(!detected.is_coordinator());
        assert_eq!(detected.role(), Role::Worker);

        config.node.hostname = Some("pinned".to_string());
        assert_eq!(NodeIdentity::from_config(&config, "gpu-a01").hostname, "pinned");
    }
}
