use std::env;
use std::path::PathBuf;
use std::time::Duration;

use iopup_core::prelude::CampaignError;
use iopup_summary_model::{CampaignParameters, Role, WorkloadParameters};

use crate::cli::IopupCli;
use crate::config::{IopupConfig, WorkloadDefaults};
use crate::resolver::{Resolver, Tool};
use crate::schedule::{phases_for, steps_for, IsolationMode, Phase, Step};

/// Environment variable providing the job identifier when running under Slurm.
pub const SLURM_JOBID_ENV: &str = "SLURM_JOBID";
/// Environment variables used to derive a default ppn when running under Slurm.
pub const SLURM_NTASKS_ENV: &str = "SLURM_NTASKS";
pub const SLURM_JOB_NUM_NODES_ENV: &str = "SLURM_JOB_NUM_NODES";

pub const DEFAULT_PRIMARY_TIMELIMIT_S: u64 = 90;
pub const DEFAULT_SECONDARY_TIMELIMIT_S: u64 = 45;
pub const DEFAULT_DELAY_S: u64 = 15;
pub const DEFAULT_TIMEOUT_GRACE_S: u64 = 0;

/// One of the two workloads of a campaign.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadSpec {
    pub role: Role,
    pub tool: Tool,
    pub access: String,
    pub pattern: String,
    pub transfer_size: Option<String>,
    /// The processes per node at the first step.
    pub base_ppn: u32,
    pub time_limit: Duration,
    /// The path this workload performs its I/O on.
    pub target: PathBuf,
    pub hosts: Vec<String>,
    pub random_data: bool,
}

impl WorkloadSpec {
    fn parameters(&self) -> WorkloadParameters {
        WorkloadParameters {
            tool: self.tool.to_string(),
            access: self.access.clone(),
            pattern: self.pattern.clone(),
            transfer_size: self.transfer_size.clone(),
            base_ppn: self.base_ppn,
            time_limit_s: self.time_limit.as_secs(),
            target: self.target.clone(),
            hosts: self.hosts.clone(),
        }
    }
}

/// A validated campaign, ready to run. Nothing has been written to disk yet.
#[derive(Debug, Clone)]
pub struct Campaign {
    pub job_id: String,
    /// The storage path under test.
    pub target: PathBuf,
    /// The per-job output directory. Created when the campaign starts.
    pub job_dir: PathBuf,
    pub primary: WorkloadSpec,
    pub secondary: WorkloadSpec,
    pub step_multiplier: u32,
    pub step_count: usize,
    pub isolation: IsolationMode,
    pub delay: Duration,
    /// Added to a role's time limit to get the deadline after which it is terminated.
    pub timeout_grace: Duration,
    pub dry_run: bool,
    pub no_progress: bool,
    pub resolver: Resolver,
}

impl Campaign {
    pub fn spec(&self, role: Role) -> &WorkloadSpec {
        match role {
            Role::Primary => &self.primary,
            Role::Secondary => &self.secondary,
        }
    }

    pub fn steps(&self) -> Result<Vec<Step>, CampaignError> {
        steps_for(
            self.primary.base_ppn,
            self.secondary.base_ppn,
            self.step_multiplier,
            self.step_count,
        )
    }

    /// Every phase of the campaign, in the order they run.
    pub fn phases(&self) -> Result<Vec<Phase>, CampaignError> {
        Ok(self
            .steps()?
            .into_iter()
            .flat_map(|step| phases_for(step, self.isolation))
            .collect())
    }

    pub fn parameters(&self) -> CampaignParameters {
        CampaignParameters {
            target: self.target.clone(),
            primary: self.primary.parameters(),
            secondary: self.secondary.parameters(),
            step_multiplier: self.step_multiplier,
            step_count: self.step_count,
            isolation: self.isolation.as_str().to_string(),
            delay_s: self.delay.as_secs(),
            timeout_grace_s: self.timeout_grace.as_secs(),
            dry_run: self.dry_run,
        }
    }

    /// Resolve every command and hook of every phase, returning the number of phases.
    fn validate(&self) -> Result<usize, CampaignError> {
        let phases = self.phases()?;
        for phase in &phases {
            for &role in phase.kind.roles() {
                let spec = self.spec(role);
                let ppn = phase.step.ppn(role);
                self.resolver.resolve(spec, ppn, spec.time_limit, phase)?;
                self.resolver.preflight(spec, ppn)?;
                self.resolver.teardown(spec, ppn, spec.time_limit)?;
            }
        }
        Ok(phases.len())
    }
}

/// The builder for a campaign definition.
///
/// Merges the command line with the configuration document and validates the result. Values
/// given on the command line take precedence over the `campaign` section of the configuration
/// document, which takes precedence over the built-in defaults.
pub struct CampaignDefinitionBuilder {
    cli: IopupCli,
    /// Loaded from the path given on the command line unless provided up front.
    config: Option<IopupConfig>,
}

impl CampaignDefinitionBuilder {
    pub fn new(cli: IopupCli) -> Self {
        Self { cli, config: None }
    }

    /// Use an already loaded configuration document instead of reading the configured path.
    pub fn with_config(mut self, config: IopupConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build and validate the campaign.
    ///
    /// Every command the campaign will run is resolved here, so an invalid workload is reported
    /// before anything is launched or written.
    pub fn build(self) -> Result<Campaign, CampaignError> {
        let config = match self.config {
            Some(config) => config,
            None => IopupConfig::load(&self.cli.config)?,
        };
        let cli = self.cli;
        let defaults = &config.campaign;

        let job_id = job_id(cli.job_id.clone())?;
        let output_dir = cli
            .output_dir
            .clone()
            .or_else(|| defaults.output_dir.clone())
            .unwrap_or_else(|| PathBuf::from("."));
        let job_dir = output_dir.join(&job_id);

        let fallback_ppn = defaults.ppn.or_else(slurm_ppn);
        let primary = WorkloadOverrides {
            role: Role::Primary,
            tool: cli.primary_workload.clone(),
            access: cli.primary_access.clone(),
            pattern: cli.primary_pattern.clone(),
            transfer_size: cli.primary_transfer_size.clone(),
            ppn: cli.primary_ppn,
            timelimit: cli.primary_timelimit,
        }
        .merge(&defaults.primary, cli.ppn, fallback_ppn, &cli.target, &job_id)?;
        let secondary = WorkloadOverrides {
            role: Role::Secondary,
            tool: cli.secondary_workload.clone(),
            access: cli.secondary_access.clone(),
            pattern: cli.secondary_pattern.clone(),
            transfer_size: cli.secondary_transfer_size.clone(),
            ppn: cli.secondary_ppn,
            timelimit: cli.secondary_timelimit,
        }
        .merge(&defaults.secondary, cli.ppn, fallback_ppn, &cli.target, &job_id)?;

        let step_multiplier =
            positive_u32("step multiplier", cli.step.or(defaults.step).unwrap_or(1))?;
        let step_count = cli.step_count.or(defaults.step_count).unwrap_or(1);
        if step_count == 0 {
            return Err(CampaignError::invalid_spec("The step count must be at least 1"));
        }

        let isolation = if cli.isolate_both {
            IsolationMode::Both
        } else {
            cli.isolate.or(defaults.isolate).unwrap_or_default()
        };

        let resolver = Resolver::new(&config, job_dir.clone(), job_id.clone());
        let campaign = Campaign {
            job_id,
            target: cli.target.clone(),
            job_dir,
            primary,
            secondary,
            step_multiplier,
            step_count,
            isolation,
            delay: Duration::from_secs(cli.delay.or(defaults.delay).unwrap_or(DEFAULT_DELAY_S)),
            timeout_grace: Duration::from_secs(
                defaults.timeout_grace.unwrap_or(DEFAULT_TIMEOUT_GRACE_S),
            ),
            dry_run: cli.dry_run,
            no_progress: cli.no_progress,
            resolver,
        };

        let phase_count = campaign.validate()?;
        log::info!(
            "Campaign {} has {} steps with {} phases in total, isolation '{}'",
            campaign.job_id,
            campaign.step_count,
            phase_count,
            campaign.isolation.as_str()
        );

        Ok(campaign)
    }
}

/// The command line values for one role.
///
/// The ppn of a role comes from, in order: its own flag, `--ppn`, its entry in the configuration
/// document, the document's shared `ppn`, and finally the Slurm allocation.
struct WorkloadOverrides {
    role: Role,
    tool: Option<String>,
    access: Option<String>,
    pattern: Option<String>,
    transfer_size: Option<String>,
    ppn: Option<i64>,
    timelimit: Option<u64>,
}

impl WorkloadOverrides {
    fn merge(
        self,
        defaults: &WorkloadDefaults,
        shared_ppn: Option<i64>,
        fallback_ppn: Option<i64>,
        target: &std::path::Path,
        job_id: &str,
    ) -> Result<WorkloadSpec, CampaignError> {
        let role = self.role;
        let (default_pattern, default_timelimit) = match role {
            Role::Primary => ("bw", DEFAULT_PRIMARY_TIMELIMIT_S),
            Role::Secondary => ("iops", DEFAULT_SECONDARY_TIMELIMIT_S),
        };

        let tool = self
            .tool
            .or_else(|| defaults.tool.clone())
            .unwrap_or_else(|| Tool::Ior.name().to_string())
            .parse::<Tool>()?;

        let ppn = self
            .ppn
            .or(shared_ppn)
            .or(defaults.ppn)
            .or(fallback_ppn)
            .ok_or_else(|| {
                CampaignError::invalid_spec(format!(
                    "No ppn configured for the {role} workload, use --{role}-ppn or --ppn"
                ))
            })?;

        let time_limit = self
            .timelimit
            .or(defaults.timelimit)
            .unwrap_or(default_timelimit);
        if time_limit == 0 {
            return Err(CampaignError::invalid_spec(format!(
                "The {role} time limit must be positive"
            )));
        }

        let target = if target.as_os_str().is_empty() {
            PathBuf::new()
        } else {
            target.join(format!("data-{role}.{job_id}.out"))
        };

        Ok(WorkloadSpec {
            role,
            tool,
            access: self
                .access
                .or_else(|| defaults.access.clone())
                .unwrap_or_else(|| "write".to_string()),
            pattern: self
                .pattern
                .or_else(|| defaults.pattern.clone())
                .unwrap_or_else(|| default_pattern.to_string()),
            transfer_size: self.transfer_size.or_else(|| defaults.transfer_size.clone()),
            base_ppn: positive_u32(&format!("{role} ppn"), ppn)?,
            time_limit: Duration::from_secs(time_limit),
            target,
            hosts: defaults.hosts.clone().unwrap_or_default(),
            random_data: true,
        })
    }
}

fn positive_u32(what: &str, value: i64) -> Result<u32, CampaignError> {
    match u32::try_from(value) {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(CampaignError::invalid_spec(format!(
            "The {what} must be a positive integer, got {value}"
        ))),
    }
}

fn job_id(from_cli: Option<String>) -> Result<String, CampaignError> {
    let job_id = from_cli
        .or_else(|| env::var(SLURM_JOBID_ENV).ok().filter(|id| !id.is_empty()))
        .unwrap_or_else(|| chrono::Utc::now().timestamp().to_string());

    if job_id.is_empty()
        || job_id == "."
        || job_id == ".."
        || job_id.contains(std::path::is_separator)
    {
        return Err(CampaignError::invalid_spec(format!(
            "The job id '{job_id}' cannot be used as a directory name"
        )));
    }
    Ok(job_id)
}

/// The tasks per node of the surrounding Slurm allocation, if there is one.
fn slurm_ppn() -> Option<i64> {
    let tasks = env::var(SLURM_NTASKS_ENV).ok()?.parse::<i64>().ok()?;
    let nodes = env::var(SLURM_JOB_NUM_NODES_ENV).ok()?.parse::<i64>().ok()?;
    if nodes <= 0 {
        return None;
    }
    Some(tasks / nodes)
}
