//! Rendezvous Agent
//!
//! Per-node entry point invoked by the launcher on every node of a job. It
//! forms the cluster through the shared record store, audits the resulting
//! topology, and runs work as resumable segments.
//!
//! # Usage
//!
//! ```bash
//! # Form the cluster and run the training command on every node
//! srun rv-agent --shared-root /scratch/.rv/cluster rendezvous -- python train.py
//!
//! # Check which hosts the ranks landed on
//! srun rv-agent topology
//!
//! # Run a resumable segment; exits 1 when preempted
//! RV_TOTAL_ELAPSED=300 RV_TOTAL_REQUESTED=600 rv-agent segment -- ./long_job.sh
//!
//! # Remove the job's records from the shared root
//! rv-agent --job-id 42 cleanup
//! ```

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use commands::Overrides;

/// Shared-filesystem rendezvous agent
#[derive(Parser, Debug)]
#[command(name = "rv-agent")]
#[command(about = "Cluster rendezvous, topology audit and resumable segments over a shared filesystem")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Job identifier (defaults to SLURM_JOB_ID)
    #[arg(long)]
    job_id: Option<String>,

    /// Rank of this process (defaults to SLURM_PROCID / RANK)
    #[arg(long)]
    rank: Option<usize>,

    /// Number of participating ranks (defaults to SLURM_NTASKS / WORLD_SIZE)
    #[arg(long)]
    world_size: Option<usize>,

    /// Directory shared by every node of the job
    #[arg(long)]
    shared_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Form the cluster, then run CMD with the head address in its environment
    Rendezvous {
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Report every rank's host and check the cluster spans multiple nodes
    Topology,
    /// Run CMD (or an idle workload) as a resumable segment
    Segment {
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Delete every record of the job from the shared root
    Cleanup,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let overrides = Overrides {
        job_id: args.job_id,
        rank: args.rank,
        world_size: args.world_size,
        shared_root: args.shared_root,
    };

    let result = commands::load_config(args.config.as_deref(), overrides, std::env::vars())
        .and_then(|config| {
            let hostname = commands::detect_hostname();
            tracing::info!(
                job_id = %config.job.id,
                rank = config.node.rank,
                world_size = config.node.world_size,
                host = %hostname,
                "rv-agent starting"
            );

            match args.command {
                Command::Rendezvous { command } => {
                    commands::rendezvous(&config, &hostname, &command)
                }
                Command::Topology => {
                    commands::topology(&config, &hostname, &mut std::io::stdout())
                }
                Command::Segment { command } => {
                    commands::segment(&config, &command, Box::new(std::io::stdout()))
                }
                Command::Cleanup => commands::cleanup(&config),
            }
        });

    ExitCode::from(commands::exit_code(result))
}
