use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use iopup_core::prelude::CampaignError;
use iopup_summary_model::Role;

use crate::config::{split_args, IopupConfig, ToolConfig};
use crate::definition::WorkloadSpec;
use crate::schedule::Phase;

/// How long to wait after a hook before moving on, giving services time to come up or go away.
pub const HOOK_SETTLE: Duration = Duration::from_secs(5);

/// A supported benchmark tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tool {
    Ior,
    Elbencho,
    MdWorkbench,
}

impl Tool {
    pub fn name(&self) -> &'static str {
        match self {
            Tool::Ior => "ior",
            Tool::Elbencho => "elbencho",
            Tool::MdWorkbench => "md-workbench",
        }
    }

    /// MPI tools are started through the parallel launcher. Other tools manage their own threads.
    pub fn is_mpi(&self) -> bool {
        matches!(self, Tool::Ior | Tool::MdWorkbench)
    }
}

impl FromStr for Tool {
    type Err = CampaignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ior" => Ok(Tool::Ior),
            "elbencho" => Ok(Tool::Elbencho),
            "md-workbench" => Ok(Tool::MdWorkbench),
            other => Err(CampaignError::invalid_spec(format!(
                "Unknown benchmark tool '{other}', expected one of: ior, elbencho, md-workbench"
            ))),
        }
    }
}

impl Display for Tool {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A fully formed benchmark invocation for one role of one phase.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkCommand {
    pub role: Role,
    pub phase: Phase,
    pub tool: Tool,
    pub access: String,
    pub pattern: String,
    /// The effective processes per node of the role.
    pub ppn: u32,
    /// The program followed by its arguments, launcher prefix included.
    pub argv: Vec<String>,
    pub working_dir: PathBuf,
    /// Receives both stdout and stderr.
    pub output_path: PathBuf,
    pub time_limit: Duration,
}

impl BenchmarkCommand {
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

/// A command run before or after the benchmarks of a phase to prepare or clean up the target.
#[derive(Debug, Clone, PartialEq)]
pub struct HookCommand {
    pub label: String,
    pub argv: Vec<String>,
    /// Left running while the phase executes. It is stopped once the phase's teardowns are done.
    pub background: bool,
    /// Pause after starting the command, or after it exits for a foreground hook.
    pub settle: Duration,
}

/// Turns workload specifications into benchmark commands, following the configuration document.
#[derive(Debug, Clone)]
pub struct Resolver {
    mpirun: Vec<String>,
    tools: BTreeMap<Tool, ToolConfig>,
    job_dir: PathBuf,
    job_id: String,
}

impl Resolver {
    pub fn new(config: &IopupConfig, job_dir: PathBuf, job_id: String) -> Self {
        let tools = [Tool::Ior, Tool::Elbencho, Tool::MdWorkbench]
            .into_iter()
            .filter_map(|tool| config.tool(tool).map(|c| (tool, c.clone())))
            .collect();

        Self {
            mpirun: split_args(&config.mpirun).collect(),
            tools,
            job_dir,
            job_id,
        }
    }

    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    /// The file capturing the output of a role in a phase, named after the role, its contention
    /// and the ppn of both roles at the phase's step.
    pub fn output_path(&self, role: Role, phase: &Phase) -> PathBuf {
        self.job_dir.join(format!(
            "{role}_{contention}.{pppn}p-{sppn}s.{job_id}.out",
            contention = phase.kind.contention(),
            pppn = phase.step.primary_ppn,
            sppn = phase.step.secondary_ppn,
            job_id = self.job_id,
        ))
    }

    /// Build the command that runs a workload with the given effective ppn and time limit.
    pub fn resolve(
        &self,
        spec: &WorkloadSpec,
        effective_ppn: u32,
        time_limit: Duration,
        phase: &Phase,
    ) -> Result<BenchmarkCommand, CampaignError> {
        let output_path = self.output_path(spec.role, phase);
        let argv = self.benchmark_argv(
            spec,
            &spec.access,
            effective_ppn,
            time_limit,
            Some(&output_path),
        )?;

        Ok(BenchmarkCommand {
            role: spec.role,
            phase: *phase,
            tool: spec.tool,
            access: spec.access.clone(),
            pattern: spec.pattern.clone(),
            ppn: effective_ppn,
            argv,
            working_dir: self.job_dir.clone(),
            output_path,
            time_limit,
        })
    }

    /// Commands to run before a workload is launched.
    pub fn preflight(
        &self,
        spec: &WorkloadSpec,
        effective_ppn: u32,
    ) -> Result<Vec<HookCommand>, CampaignError> {
        self.check_workload(spec, effective_ppn)?;
        let tool_config = self.tool_config(spec.tool)?;

        let hooks = match spec.tool {
            Tool::Ior => vec![],
            Tool::Elbencho if spec.hosts.is_empty() => vec![],
            Tool::Elbencho => {
                let mut argv = self.launcher(&spec.hosts, 1)?;
                argv.push(binary(tool_config));
                argv.extend(["--service".to_string(), "--foreground".to_string()]);
                vec![HookCommand {
                    label: format!("{} service for {}", spec.tool, spec.role),
                    argv,
                    background: true,
                    settle: HOOK_SETTLE,
                }]
            }
            Tool::MdWorkbench => vec![HookCommand {
                label: format!("{} precreate for {}", spec.tool, spec.role),
                argv: self.md_workbench_phase_argv(spec, tool_config, "-1")?,
                background: false,
                settle: Duration::ZERO,
            }],
        };

        Ok(hooks)
    }

    /// Commands to run after every benchmark of a phase has finished.
    pub fn teardown(
        &self,
        spec: &WorkloadSpec,
        effective_ppn: u32,
        time_limit: Duration,
    ) -> Result<Vec<HookCommand>, CampaignError> {
        self.check_workload(spec, effective_ppn)?;
        let tool_config = self.tool_config(spec.tool)?;

        let mut hooks = Vec::new();
        match spec.tool {
            Tool::Ior => {}
            Tool::Elbencho => {
                if tool_config.access_args.contains_key("clean") {
                    hooks.push(HookCommand {
                        label: format!("{} cleanup for {}", spec.tool, spec.role),
                        argv: self.benchmark_argv(spec, "clean", effective_ppn, time_limit, None)?,
                        background: false,
                        settle: Duration::ZERO,
                    });
                }
                if !spec.hosts.is_empty() {
                    hooks.push(HookCommand {
                        label: format!("{} service shutdown for {}", spec.tool, spec.role),
                        argv: vec![
                            binary(tool_config),
                            "--quit".to_string(),
                            "--hosts".to_string(),
                            spec.hosts.join(","),
                        ],
                        background: false,
                        settle: HOOK_SETTLE,
                    });
                }
            }
            Tool::MdWorkbench => hooks.push(HookCommand {
                label: format!("{} cleanup for {}", spec.tool, spec.role),
                argv: self.md_workbench_phase_argv(spec, tool_config, "-3")?,
                background: false,
                settle: HOOK_SETTLE,
            }),
        }

        Ok(hooks)
    }

    fn tool_config(&self, tool: Tool) -> Result<&ToolConfig, CampaignError> {
        self.tools.get(&tool).ok_or_else(|| {
            CampaignError::invalid_spec(format!("The configuration has no section for '{tool}'"))
        })
    }

    fn check_workload(&self, spec: &WorkloadSpec, effective_ppn: u32) -> Result<(), CampaignError> {
        if effective_ppn == 0 {
            return Err(CampaignError::invalid_spec(format!(
                "The {} ppn must be positive",
                spec.role
            )));
        }
        if spec.target.as_os_str().is_empty() {
            return Err(CampaignError::invalid_spec(format!(
                "No target path configured for the {} workload",
                spec.role
            )));
        }
        Ok(())
    }

    /// The parallel launcher prefix for an MPI tool.
    fn launcher(&self, hosts: &[String], procs_per_node: u32) -> Result<Vec<String>, CampaignError> {
        let nodes = u32::try_from(hosts.len().max(1))
            .map_err(|_| CampaignError::invalid_spec("Too many hosts"))?;
        let procs = nodes.checked_mul(procs_per_node).ok_or_else(|| {
            CampaignError::invalid_spec(format!(
                "{nodes} nodes with {procs_per_node} processes each is too many processes"
            ))
        })?;

        let mut argv = self.mpirun.clone();
        argv.extend([
            "-N".to_string(),
            nodes.to_string(),
            "-n".to_string(),
            procs.to_string(),
        ]);
        if !hosts.is_empty() {
            argv.extend(["--nodelist".to_string(), hosts.join(",")]);
        }
        Ok(argv)
    }

    fn benchmark_argv(
        &self,
        spec: &WorkloadSpec,
        access: &str,
        effective_ppn: u32,
        time_limit: Duration,
        output_path: Option<&Path>,
    ) -> Result<Vec<String>, CampaignError> {
        self.check_workload(spec, effective_ppn)?;
        let tool_config = self.tool_config(spec.tool)?;

        let access_args = tool_config.access_args.get(access).ok_or_else(|| {
            CampaignError::invalid_spec(format!(
                "Access '{access}' is not configured for '{}'",
                spec.tool
            ))
        })?;
        let pattern_args = tool_config.pattern_args.get(&spec.pattern).ok_or_else(|| {
            CampaignError::invalid_spec(format!(
                "Pattern '{}' is not configured for '{}'",
                spec.pattern, spec.tool
            ))
        })?;

        let mut argv = if spec.tool.is_mpi() {
            self.launcher(&spec.hosts, effective_ppn)?
        } else {
            Vec::new()
        };
        argv.push(binary(tool_config));

        if !spec.tool.is_mpi() && !spec.hosts.is_empty() {
            argv.extend(["--hosts".to_string(), spec.hosts.join(",")]);
        }

        if !tool_config.timelimit_args.is_empty() {
            argv.extend(split_args(&tool_config.timelimit_args));
            argv.push(time_limit.as_secs().to_string());
        }

        if spec.random_data {
            argv.extend(split_args(&tool_config.random_data_args));
        }

        if let (Tool::Elbencho, Some(output_path)) = (spec.tool, output_path) {
            argv.extend([
                "--resfile".to_string(),
                with_suffix(output_path, "results"),
                "--csvfile".to_string(),
                with_suffix(output_path, "csv"),
            ]);
        }

        let common_args = split_args(&tool_config.common_args).collect::<Vec<_>>();
        if spec.tool == Tool::Elbencho {
            argv.extend(with_thread_count(common_args, effective_ppn));
        } else {
            argv.extend(common_args);
        }

        argv.extend(split_args(access_args));
        argv.extend(split_args(pattern_args));
        if let Some(extra) = tool_config
            .access_pattern_args
            .get(access)
            .and_then(|patterns| patterns.get(&spec.pattern))
        {
            argv.extend(split_args(extra));
        }

        if let Some(transfer_size) = &spec.transfer_size {
            if tool_config.transfer_size_args.is_empty() {
                return Err(CampaignError::invalid_spec(format!(
                    "The {} workload sets a transfer size but '{}' has no transfer_size_args",
                    spec.role, spec.tool
                )));
            }
            argv.extend(split_args(&tool_config.transfer_size_args));
            argv.push(transfer_size.clone());
        }

        let target = spec.target.display().to_string();
        if spec.tool.is_mpi() {
            argv.extend(["-o".to_string(), target]);
        } else {
            argv.push(target);
        }

        Ok(argv)
    }

    fn md_workbench_phase_argv(
        &self,
        spec: &WorkloadSpec,
        tool_config: &ToolConfig,
        phase_flag: &str,
    ) -> Result<Vec<String>, CampaignError> {
        let mut argv = self.launcher(&spec.hosts, 1)?;
        argv.push(binary(tool_config));
        argv.push(phase_flag.to_string());
        argv.extend(split_args(&tool_config.common_args));
        argv.extend(["-o".to_string(), spec.target.display().to_string()]);
        Ok(argv)
    }
}

fn binary(tool_config: &ToolConfig) -> String {
    tool_config.binary.display().to_string()
}

fn with_suffix(path: &Path, suffix: &str) -> String {
    format!("{}.{suffix}", path.display())
}

/// Set elbencho's thread count to the effective ppn, adding the option if it is not present.
fn with_thread_count(mut args: Vec<String>, ppn: u32) -> Vec<String> {
    match args.iter().position(|a| a == "-t" || a == "--threads") {
        Some(idx) if idx + 1 < args.len() => args[idx + 1] = ppn.to_string(),
        Some(_) => args.push(ppn.to_string()),
        None => args.extend(["--threads".to_string(), ppn.to_string()]),
    }
    args
}
