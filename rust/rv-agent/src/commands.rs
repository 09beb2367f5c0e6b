//! Subcommand handlers.
//!
//! Each handler returns the process exit code on success; errors are mapped
//! to the failure code by [`exit_code`].

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use rv_core::clock::{Clock, SystemClock};
use rv_core::config::{RvConfig, FAILURE_EXIT_CODE};
use rv_core::error::{Result, RvError};
use rv_core::node::{NodeIdentity, Role};
use rv_core::rendezvous::{split_host_port, ClusterRuntime, Rendezvous, StoreCluster};
use rv_core::segment::{ChildWorkload, IdleWorkload, SegmentController, SignalWatcher};
use rv_core::store::{FileRecordStore, RecordStore};
use rv_core::topology::{verify, StoreCollective};

/// Command-line values that take precedence over file and environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub job_id: Option<String>,
    pub rank: Option<usize>,
    pub world_size: Option<usize>,
    pub shared_root: Option<PathBuf>,
}

impl Overrides {
    fn apply(self, mut config: RvConfig) -> RvConfig {
        if let Some(job_id) = self.job_id {
            config.job.id = job_id;
        }
        if let Some(rank) = self.rank {
            config.node.rank = rank;
        }
        if let Some(world_size) = self.world_size {
            config.node.world_size = world_size;
        }
        if let Some(root) = self.shared_root {
            config.store.root = root;
        }
        config
    }
}

/// Builds the configuration: defaults, file, environment, flags, then
/// validation.
pub fn load_config<I, K, V>(path: Option<&Path>, overrides: Overrides, vars: I) -> Result<RvConfig>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let config = match path {
        Some(path) => RvConfig::from_file(path)?,
        None => RvConfig::default(),
    };

    let config = overrides.apply(config.with_overrides_from(vars));
    config.validate()?;
    Ok(config)
}

pub fn detect_hostname() -> String {
    match hostname::get().map(|name| name.into_string()) {
        Ok(Ok(name)) if !name.is_empty() => name,
        other => {
            tracing::warn!(result = ?other, "could not detect hostname, using localhost");
            "localhost".to_string()
        }
    }
}

/// Maps a handler result to the process exit code.
pub fn exit_code(result: Result<u8>) -> u8 {
    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "rv-agent failed");
            FAILURE_EXIT_CODE
        }
    }
}

fn open_store(config: &RvConfig) -> Result<Arc<dyn RecordStore>> {
    Ok(Arc::new(FileRecordStore::from_config(&config.store)?))
}

/// Runs `command` with the head address exported.
///
/// A zero exit maps to 0 and the opted-in `child_resume_code` to the resume
/// code; every other outcome is a failure.
fn run_with_address(command: &[String], address: &str, config: &RvConfig) -> Result<u8> {
    let Some((program, args)) = command.split_first() else {
        return Ok(0);
    };

    let (host, port) = split_host_port(address);
    let mut child = Command::new(program);
    child
        .args(args)
        .env("RV_HEAD_ADDRESS", address)
        .env("MASTER_ADDR", host);
    if let Some(port) = port {
        child.env("MASTER_PORT", port.to_string());
    }

    let status = child
        .status()
        .map_err(|e| RvError::workload_with_source(format!("failed to run '{program}'"), e))?;

    tracing::info!(program = %program, %status, "command finished");
    let child_resume = config.segment.child_resume_code.map(i32::from);
    Ok(match status.code() {
        Some(0) => 0,
        code if code.is_some() && code == child_resume => config.segment.resume_exit_code,
        _ => FAILURE_EXIT_CODE,
    })
}

/// `rendezvous`: form the cluster, run the command, tear down.
pub fn rendezvous(config: &RvConfig, hostname: &str, command: &[String]) -> Result<u8> {
    let store = open_store(config)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let node = NodeIdentity::from_config(config, hostname);
    let rv = Rendezvous::from_config(Arc::clone(&store), clock, config);
    let mut cluster = StoreCluster::new(
        store,
        config.job.id.clone(),
        node.clone(),
        config.rendezvous.advertise_host.clone(),
        config.rendezvous.port,
    );

    match node.role() {
        Role::Head => {
            let formation = rv.form_as_head(&mut cluster, config.expected_nodes())?;
            let result = run_with_address(command, &formation.address, config);

            // always publish completion so workers are not left waiting
            let shutdown = rv.finish_as_head(&mut cluster, node.world_size)?;
            if !shutdown.acks.missing.is_empty() {
                tracing::warn!(missing = ?shutdown.acks.missing, "finished without every worker's acknowledgement");
            }
            result
        }
        Role::Worker => {
            let address = rv.join_as_worker(&mut cluster)?;
            let result = run_with_address(command, &address, config);

            rv.await_done(node.rank)?;
            if let Err(e) = cluster.shutdown() {
                tracing::warn!(error = %e, "failed to leave cluster");
            }
            result
        }
    }
}

/// `topology`: print rank lines and, on rank 0, the summary.
pub fn topology(config: &RvConfig, hostname: &str, out: &mut dyn Write) -> Result<u8> {
    let store = open_store(config)?;
    let node = NodeIdentity::from_config(config, hostname);
    let mut collective = StoreCollective::connect(
        store,
        Arc::new(SystemClock),
        config.job.id.clone(),
        node.rank,
        node.world_size,
        config.topology.collective_policy(),
    )?;

    verify(
        &mut collective,
        &node,
        config.topology.expected_head.as_deref(),
        config.job.expected_nodes,
        out,
    )?;
    Ok(0)
}

/// `segment`: run the command or the idle workload until done or preempted.
pub fn segment(config: &RvConfig, command: &[String], out: Box<dyn Write + Send>) -> Result<u8> {
    let controller = SegmentController::from_config(config, Arc::new(SystemClock), out);
    let grace = config.segment.shutdown_grace();
    let _watcher = SignalWatcher::install(controller.clone(), grace)?;

    let exit = if command.is_empty() {
        IdleWorkload::from_config(&config.segment).run(&controller)
    } else {
        ChildWorkload::new(command)?
            .check_interval(config.segment.check_interval())
            // leaves the watcher time to write the report itself
            .kill_after(grace / 2)
            .resume_status(config.segment.child_resume_code)
            .run(&controller)?
    };

    if let Some(report) = &exit.report {
        tracing::info!(
            total_elapsed_secs = report.total_elapsed.as_secs(),
            exit_code = exit.code,
            "segment interrupted, requesting resubmission"
        );
    }
    Ok(exit.code)
}

/// `cleanup`: delete every record of the job.
pub fn cleanup(config: &RvConfig) -> Result<u8> {
    let store = open_store(config)?;
    let removed = store.clear(&config.job.id);
    tracing::info!(job_id = %config.job.id, removed, "cleanup finished");
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::{NamedTempFile, TempDir};

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn config(root: &Path, rank: usize, world_size: usize) -> RvConfig {
        let mut config = RvConfig::default();
        config.job.id = "42".to_string();
        config.node.rank = rank;
        config.node.world_size = world_size;
        config.store.root = root.to_path_buf();
        config.store.sync_writes = false;
        config.rendezvous.advertise_host = Some("127.0.0.1".to_string());
        config.rendezvous.poll_interval_ms = 10;
        config.rendezvous.done_poll_interval_ms = 10;
        config.rendezvous.address_timeout_secs = 1;
        config.rendezvous.done_grace_secs = 1;
        config.topology.poll_interval_ms = 10;
        config
    }

    #[test]
    fn test_flags_override_environment() {
        let overrides = Overrides {
            job_id: Some("flag".to_string()),
            rank: Some(1),
            world_size: None,
            shared_root: Some(PathBuf::from("/shared")),
        };
        let vars = [("SLURM_JOB_ID", "42"), ("SLURM_PROCID", "0"), ("SLURM_NTASKS", "2")];

        let config = load_config(None, overrides, vars).unwrap();

        assert_eq!(config.job.id, "flag");
        assert_eq!(config.node.rank, 1);
        assert_eq!(config.node.world_size, 2);
        assert_eq!(config.store.root, PathBuf::from("/shared"));
    }

    #[test]
    fn test_load_config_from_file_then_validate() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[node]\nrank = 3\nworld_size = 2").unwrap();

        let vars: [(&str, &str); 0] = [];
        let err = load_config(Some(file.path()), Overrides::default(), vars).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(exit_code(Ok(0)), 0);
        assert_eq!(exit_code(Ok(1)), 1);
        assert_eq!(exit_code(Err(RvError::config("bad"))), FAILURE_EXIT_CODE);
    }

    #[test]
    fn test_single_node_rendezvous_exports_address() {
        let temp = TempDir::new().unwrap();
        let config = config(temp.path(), 0, 1);

        let code = rendezvous(
            &config,
            "gpu-a01",
            &sh(r#"test "$MASTER_ADDR" = 127.0.0.1 && test "$MASTER_PORT" = 6379 && test "$RV_HEAD_ADDRESS" = 127.0.0.1:6379"#),
        )
        .unwrap();

        assert_eq!(code, 0);
        let store = FileRecordStore::new(temp.path()).unwrap();
        assert!(store.list("42").unwrap().is_empty());
    }

    #[test]
    fn test_head_command_failure_still_cleans_up() {
        let temp = TempDir::new().unwrap();
        let config = config(temp.path(), 0, 1);

        assert_eq!(rendezvous(&config, "gpu-a01", &sh("exit 3")).unwrap(), FAILURE_EXIT_CODE);

        let store = FileRecordStore::new(temp.path()).unwrap();
        assert!(store.list("42").unwrap().is_empty());
    }

    #[test]
    fn test_command_crash_is_not_a_resume_request() {
        let temp = TempDir::new().unwrap();
        let mut config = config(temp.path(), 0, 1);

        assert_eq!(rendezvous(&config, "gpu-a01", &sh("exit 1")).unwrap(), FAILURE_EXIT_CODE);

        config.segment.child_resume_code = Some(75);
        assert_eq!(rendezvous(&config, "gpu-a01", &sh("exit 75")).unwrap(), 1);
        assert_eq!(rendezvous(&config, "gpu-a01", &sh("exit 1")).unwrap(), FAILURE_EXIT_CODE);
    }

    #[test]
    fn test_worker_without_head_fails() {
        let temp = TempDir::new().unwrap();
        let config = config(temp.path(), 1, 2);

        let err = rendezvous(&config, "gpu-a02", &[]).unwrap_err();
        assert!(err.is_rendezvous_timeout());
        assert_eq!(exit_code(Err(err)), FAILURE_EXIT_CODE);
    }

    #[test]
    fn test_two_node_rendezvous() {
        let temp = TempDir::new().unwrap();
        let mut head_config = config(temp.path(), 0, 2);
        head_config.rendezvous.address_timeout_secs = 10;
        let mut worker_config = config(temp.path(), 1, 2);
        worker_config.rendezvous.address_timeout_secs = 10;

        let worker = std::thread::spawn(move || {
            rendezvous(&worker_config, "gpu-a02", &sh(r#"test "$MASTER_ADDR" = 127.0.0.1"#))
        });
        let head = rendezvous(&head_config, "gpu-a01", &[]).unwrap();

        assert_eq!(head, 0);
        assert_eq!(worker.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn test_single_rank_topology() {
        let temp = TempDir::new().unwrap();
        let config = config(temp.path(), 0, 1);
        let mut out: Vec<u8> = Vec::new();

        assert_eq!(topology(&config, "laptop", &mut out).unwrap(), 0);

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("[Rank 0/1] host=laptop local_rank=0\n"));
        assert!(text.contains("host_count=1\n"));
        assert!(text.contains("multi_node=false\n"));
    }

    #[test]
    fn test_repeated_topology_runs_start_fresh() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();

        for hosts in [["gpu-a01", "gpu-a02"], ["gpu-b01", "gpu-b02"]] {
            let worker = {
                let config = config(&root, 1, 2);
                let host = hosts[1];
                std::thread::spawn(move || topology(&config, host, &mut std::io::sink()))
            };
            let mut out: Vec<u8> = Vec::new();
            assert_eq!(topology(&config(&root, 0, 2), hosts[0], &mut out).unwrap(), 0);
            assert_eq!(worker.join().unwrap().unwrap(), 0);

            let text = String::from_utf8(out).unwrap();
            assert!(text.contains(&format!("hosts=[{}, {}]\n", hosts[0], hosts[1])));
        }
    }

    #[test]
    fn test_segment_runs_command() {
        let temp = TempDir::new().unwrap();
        let config = config(temp.path(), 0, 1);

        assert_eq!(segment(&config, &sh("exit 0"), Box::new(std::io::sink())).unwrap(), 0);
        assert!(segment(&config, &sh("exit 3"), Box::new(std::io::sink())).is_err());
        assert!(segment(&config, &sh("exit 1"), Box::new(std::io::sink())).is_err());
    }

    #[test]
    fn test_cleanup_removes_only_this_job() {
        let temp = TempDir::new().unwrap();
        let config = config(temp.path(), 0, 1);
        let store = FileRecordStore::new(temp.path()).unwrap();
        store.write("42", "address", "h:1").unwrap();
        store.write("42", "gather.0.0", "h").unwrap();
        store.write("7", "address", "h:2").unwrap();

        assert_eq!(cleanup(&config).unwrap(), 0);

        assert!(store.list("42").unwrap().is_empty());
        assert_eq!(store.list("7").unwrap(), vec!["address"]);
    }
}
