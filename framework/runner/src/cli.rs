use std::path::PathBuf;

use clap::Parser;

use crate::schedule::IsolationMode;

/// Measure how a bandwidth oriented workload and an IOPS oriented workload interfere with each
/// other on a shared storage target.
///
/// Every option that is not given here falls back to the `campaign` section of the configuration
/// document, and then to a built-in default.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "iopup", version, about, long_about = None)]
pub struct IopupCli {
    /// The storage path under test. Each workload performs its I/O on a file below this path.
    pub target: PathBuf,

    /// The configuration document describing how to invoke each benchmark tool
    #[clap(short, long, default_value = "config.yml")]
    pub config: PathBuf,

    /// Resolve and log every command without running anything
    #[clap(short = 't', long, default_value = "false")]
    pub dry_run: bool,

    /// The default processes per node for both workloads.
    ///
    /// When neither this nor a per-workload value is configured, it is derived from the
    /// `SLURM_NTASKS` and `SLURM_JOB_NUM_NODES` environment variables.
    #[clap(short, long, allow_negative_numbers = true)]
    pub ppn: Option<i64>,

    /// The base processes per node for the primary workload
    #[clap(long, allow_negative_numbers = true)]
    pub primary_ppn: Option<i64>,

    /// The base processes per node for the secondary workload
    #[clap(long, allow_negative_numbers = true)]
    pub secondary_ppn: Option<i64>,

    /// The multiplier applied to the processes per node of both workloads at each step
    #[clap(short, long, allow_negative_numbers = true)]
    pub step: Option<i64>,

    /// The number of steps to run
    #[clap(long)]
    pub step_count: Option<usize>,

    /// Run each workload alone before running both together
    #[clap(long, default_value = "false", conflicts_with = "isolate")]
    pub isolate_both: bool,

    /// Which workloads to also run alone before running both together
    #[clap(long, value_enum)]
    pub isolate: Option<IsolationMode>,

    /// The benchmark tool used by the primary workload
    #[clap(long)]
    pub primary_workload: Option<String>,

    /// The benchmark tool used by the secondary workload
    #[clap(long)]
    pub secondary_workload: Option<String>,

    /// The access mode of the primary workload, for example `write` or `read`
    #[clap(long)]
    pub primary_access: Option<String>,

    /// The access mode of the secondary workload
    #[clap(long)]
    pub secondary_access: Option<String>,

    /// The I/O pattern of the primary workload, for example `bw` or `iops`
    #[clap(long)]
    pub primary_pattern: Option<String>,

    /// The I/O pattern of the secondary workload
    #[clap(long)]
    pub secondary_pattern: Option<String>,

    /// The transfer size of the primary workload, passed through to the tool
    #[clap(long)]
    pub primary_transfer_size: Option<String>,

    /// The transfer size of the secondary workload
    #[clap(long)]
    pub secondary_transfer_size: Option<String>,

    /// The number of seconds the primary workload may run for
    #[clap(long)]
    pub primary_timelimit: Option<u64>,

    /// The number of seconds the secondary workload may run for
    #[clap(long)]
    pub secondary_timelimit: Option<u64>,

    /// The number of seconds to pause between phases
    #[clap(long)]
    pub delay: Option<u64>,

    /// The directory in which the per-job output directory is created
    #[clap(long)]
    pub output_dir: Option<PathBuf>,

    /// The job identifier. Defaults to `SLURM_JOBID`, or the current time when that is not set.
    #[clap(long)]
    pub job_id: Option<String>,

    /// Do not show a progress bar on the CLI.
    ///
    /// This is recommended for batch jobs where the progress bar isn't being looked at by anyone and is just adding noise to the logs.
    #[clap(long, default_value = "false")]
    pub no_progress: bool,
}
