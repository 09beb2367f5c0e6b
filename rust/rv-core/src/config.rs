// rust/rv-core/src/config.rs

//! Configuration management for the rendezvous agent.
//!
//! Configuration is assembled once at startup: defaults, then an optional
//! TOML file, then environment overrides supplied by the launcher and the
//! scheduler, then validation. The resulting [`RvConfig`] is passed into each
//! component; nothing else in the crate reads the process environment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, RvError};
use crate::poll::PollPolicy;
use crate::store::validate_job_id;

/// Exit code reserved for genuine failures. The resume code must differ.
pub const FAILURE_EXIT_CODE: u8 = 2;

// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RvConfig {
    pub job: JobConfig,
    pub node: NodeConfig,
    pub store: StoreConfig,
    pub rendezvous: RendezvousConfig,
    pub topology: TopologyConfig,
    pub segment: SegmentConfig,
}

/// Facts about the job, owned by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Scheduler job identifier; namespaces every shared record.
    pub id: String,
    /// Total run time requested across all segments, in seconds.
    pub total_requested_secs: u64,
    /// Run time consumed by earlier segments, in seconds.
    pub prior_elapsed_secs: u64,
    /// Number of distinct nodes the job was allocated, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_nodes: Option<usize>,
    /// Requeue count of the job. A requeued job keeps its id, so records
    /// are matched against the attempt that wrote them.
    pub attempt: u32,
}

/// Facts about this process, owned by the launcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    // Globally unique rank, 0..world_size.
    pub rank: usize,
    // Accelerator index on this host.
    pub local_rank: usize,
    // Number of participating ranks.
    pub world_size: usize,
    /// Hostname override; detected from the OS when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

// Shared record store options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    // Directory visible from every node.
    pub root: PathBuf,
    // Whether to fsync records before publishing them.
    pub sync_writes: bool,
}

/// Rendezvous options. Timeouts are in seconds, intervals in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Port the head's runtime listens on.
    pub port: u16,
    /// Address published to workers; resolved from the hostname when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_host: Option<String>,
    /// How long a worker waits for the head address.
    pub address_timeout_secs: u64,
    /// How long the head waits for all nodes to join.
    pub membership_timeout_secs: u64,
    /// How long a worker idles waiting for the completion record.
    pub done_timeout_secs: u64,
    /// Poll interval for the address and membership waits.
    pub poll_interval_ms: u64,
    /// Poll interval for the completion wait.
    pub done_poll_interval_ms: u64,
    /// How long the head waits for worker acknowledgements before cleanup.
    pub done_grace_secs: u64,
    /// Publish the address with create-if-absent instead of overwrite.
    pub exclusive_head: bool,
}

// Topology verification options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    // Head address the launcher advertised (MASTER_ADDR); cross-checked
    // against the reported hostnames.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_head: Option<String>,
    // Bound on each gather/barrier round.
    pub collective_timeout_secs: u64,
    // Poll interval for store-backed collectives.
    pub poll_interval_ms: u64,
}

// Segment/resume options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    // Exit code meaning "interrupted, resubmit with updated elapsed time".
    pub resume_exit_code: u8,
    // Time the main loop gets to shut down after a signal before the
    // watcher forces the resume exit.
    pub shutdown_grace_secs: u64,
    // Progress log interval of the built-in idle workload.
    pub progress_interval_secs: u64,
    // How often the workload loop checks for interruption.
    pub check_interval_ms: u64,
    // Child exit status that requests resubmission; unset means any
    // non-zero child exit is a failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_resume_code: Option<u8>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            id: "0".to_string(),
            total_requested_secs: 600,
            prior_elapsed_secs: 0,
            expected_nodes: None,
            attempt: 0,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            local_rank: 0,
            world_size: 1,
            hostname: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./.rv/cluster"),
            sync_writes: true,
        }
    }
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            port: 6379,
            advertise_host: None,
            address_timeout_secs: 120,
            membership_timeout_secs: 120,
            done_timeout_secs: 600,
            poll_interval_ms: 2_000,
            done_poll_interval_ms: 5_000,
            done_grace_secs: 10,
            exclusive_head: false,
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            expected_head: None,
            collective_timeout_secs: 300,
            poll_interval_ms: 200,
        }
    }
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            resume_exit_code: 1,
            shutdown_grace_secs: 30,
            progress_interval_secs: 60,
            check_interval_ms: 250,
            child_resume_code: None,
        }
    }
}

impl JobConfig {
    pub fn prior_elapsed(&self) -> Duration {
        Duration::from_secs(self.prior_elapsed_secs)
    }

    pub fn total_requested(&self) -> Duration {
        Duration::from_secs(self.total_requested_secs)
    }
}

impl RendezvousConfig {
    /// Worker wait for the head address.
    pub fn address_policy(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_millis(self.poll_interval_ms),
            Duration::from_secs(self.address_timeout_secs),
        )
    }

    /// Head wait for cluster membership.
    pub fn membership_policy(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_millis(self.poll_interval_ms),
            Duration::from_secs(self.membership_timeout_secs),
        )
    }

    /// Worker wait for the completion record.
    pub fn done_policy(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_millis(self.done_poll_interval_ms),
            Duration::from_secs(self.done_timeout_secs),
        )
    }

    /// Head wait for worker acknowledgements.
    pub fn ack_policy(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_millis(self.poll_interval_ms.min(1_000)),
            Duration::from_secs(self.done_grace_secs),
        )
    }
}

impl TopologyConfig {
    pub fn collective_policy(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_millis(self.poll_interval_ms),
            Duration::from_secs(self.collective_timeout_secs),
        )
    }
}

impl SegmentConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

impl FromStr for RvConfig {
    type Err = RvError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| RvError::config_with_source("failed to parse TOML config", e))
    }
}

impl RvConfig {
    // Load configuration from a TOML file.
    //
    // The file is parsed but not validated: environment overrides usually
    // supply the rank and job id, so validation runs after they are applied.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RvError::store_with_source(path, "failed to read config file", e))?;
        content.parse()
    }

    /// Number of distinct nodes the rendezvous waits for. Without a node
    /// count from the scheduler, one rank per node is assumed.
    pub fn expected_nodes(&self) -> usize {
        self.job.expected_nodes.unwrap_or(self.node.world_size)
    }

    /// Apply overrides from the process environment.
    ///
    /// See [`RvConfig::with_overrides_from`] for the variables consulted.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(std::env::vars())
    }

    // Apply overrides from an explicit set of variables.
    //
    // Launcher variables (`SLURM_*`, torchrun's `RANK`/`LOCAL_RANK`/
    // `WORLD_SIZE`, `MASTER_ADDR`) are applied first; `RV_*` variables
    // override them. Unparseable values are ignored.
    #[must_use]
    pub fn with_overrides_from<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let vars: std::collections::HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
            .collect();
        fn lookup<'a>(
            vars: &'a std::collections::HashMap<String, String>,
            names: &[&str],
        ) -> Option<&'a String> {
            names.iter().rev().find_map(|name| vars.get(*name))
        }
        fn parse<T: FromStr>(val: Option<&String>) -> Option<T> {
            val.and_then(|v| v.trim().parse().ok())
        }

        // Job
        if let Some(val) = lookup(&vars, &["SLURM_JOB_ID", "RV_JOB_ID"]) {
            self.job.id = val.trim().to_string();
        }
        if let Some(v) = parse(lookup(&vars, &["RV_TOTAL_ELAPSED"])) {
            self.job.prior_elapsed_secs = v;
        }
        if let Some(v) = parse(lookup(&vars, &["RV_TOTAL_REQUESTED"])) {
            self.job.total_requested_secs = v;
        }
        if let Some(v) = parse(lookup(&vars, &["SLURM_NNODES", "RV_EXPECTED_NODES"])) {
            self.job.expected_nodes = Some(v);
        }
        if let Some(v) = parse(lookup(&vars, &["SLURM_RESTART_COUNT", "RV_ATTEMPT"])) {
            self.job.attempt = v;
        }

        // Node
        if let Some(v) = parse(lookup(&vars, &["SLURM_PROCID", "RANK", "RV_RANK"])) {
            self.node.rank = v;
        }
        if let Some(v) = parse(lookup(&vars, &["SLURM_LOCALID", "LOCAL_RANK", "RV_LOCAL_RANK"])) {
            self.node.local_rank = v;
        }
        if let Some(v) = parse(lookup(&vars, &["SLURM_NTASKS", "WORLD_SIZE", "RV_WORLD_SIZE"])) {
            self.node.world_size = v;
        }
        if let Some(val) = lookup(&vars, &["RV_HOSTNAME"]) {
            self.node.hostname = Some(val.clone());
        }

        // Store
        if let Some(val) = lookup(&vars, &["RV_SHARED_ROOT"]) {
            self.store.root = PathBuf::from(val);
        }

        // Rendezvous
        if let Some(v) = parse(lookup(&vars, &["RV_HEAD_PORT"])) {
            self.rendezvous.port = v;
        }
        if let Some(val) = lookup(&vars, &["RV_ADVERTISE_HOST"]) {
            self.rendezvous.advertise_host = Some(val.clone());
        }
        if let Some(v) = parse(lookup(&vars, &["RV_ADDRESS_TIMEOUT_SECS"])) {
            self.rendezvous.address_timeout_secs = v;
        }
        if let Some(v) = parse(lookup(&vars, &["RV_MEMBERSHIP_TIMEOUT_SECS"])) {
            self.rendezvous.membership_timeout_secs = v;
        }
        if let Some(v) = parse(lookup(&vars, &["RV_DONE_TIMEOUT_SECS"])) {
            self.rendezvous.done_timeout_secs = v;
        }

        // Topology
        if let Some(val) = lookup(&vars, &["MASTER_ADDR", "RV_EXPECTED_HEAD"]) {
            self.topology.expected_head = Some(val.clone());
        }

        // Segment
        if let Some(v) = parse(lookup(&vars, &["RV_CHILD_RESUME_CODE"])) {
            self.segment.child_resume_code = Some(v);
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        // Job validation
        validate_job_id(&self.job.id)
            .map_err(|e| RvError::config_with_source("job.id is not usable as a record namespace", e))?;
        if self.job.expected_nodes == Some(0) {
            return Err(RvError::config("job.expected_nodes must be greater than 0"));
        }

        // Node validation
        if self.node.world_size == 0 {
            return Err(RvError::config("node.world_size must be greater than 0"));
        }
        if self.node.rank >= self.node.world_size {
            return Err(RvError::config(format!(
                "node.rank {} is out of range for world_size {}",
                self.node.rank, self.node.world_size
            )));
        }

        // Rendezvous validation
        let rv = &self.rendezvous;
        if rv.address_timeout_secs == 0
            || rv.membership_timeout_secs == 0
            || rv.done_timeout_secs == 0
        {
            return Err(RvError::config("rendezvous timeouts must be greater than 0"));
        }
        if rv.poll_interval_ms == 0 || rv.done_poll_interval_ms == 0 {
            return Err(RvError::config(
                "rendezvous poll intervals must be greater than 0",
            ));
        }

        // Topology validation
        if self.topology.collective_timeout_secs == 0 || self.topology.poll_interval_ms == 0 {
            return Err(RvError::config(
                "topology.collective_timeout_secs and topology.poll_interval_ms must be greater than 0",
            ));
        }

        // Segment validation
        let code = self.segment.resume_exit_code;
        if code == 0 || code == FAILURE_EXIT_CODE {
            return Err(RvError::config(format!(
                "segment.resume_exit_code must not be 0 or {FAILURE_EXIT_CODE}"
            )));
        }
        if self.segment.child_resume_code == Some(0) {
            return Err(RvError::config("segment.child_resume_code must not be 0"));
        }
        if self.segment.check_interval_ms == 0 {
            return Err(RvError::config(
                "segment.check_interval_ms must be greater than 0",
            ));
        }

        Ok(())
    }
}
