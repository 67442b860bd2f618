use std::fs::OpenOptions;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use iopup_core::prelude::ShutdownHandle;
use iopup_summary_model::{RunOutcome, RunResult};
use tokio::process::{Child, Command};

use crate::resolver::{BenchmarkCommand, HookCommand};

/// How long a benchmark has to exit after being asked to terminate before it is killed.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Runs benchmark commands as subprocesses with a mandatory deadline.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    shutdown: ShutdownHandle,
    dry_run: bool,
    kill_grace: Duration,
}

/// How a subprocess ended, before it is turned into a [RunResult].
struct Ended {
    outcome: RunOutcome,
    pid: Option<u32>,
    exit_code: Option<i32>,
    signal: Option<i32>,
    error: Option<String>,
}

impl Ended {
    fn without_process(outcome: RunOutcome, error: Option<String>) -> Self {
        Self {
            outcome,
            pid: None,
            exit_code: None,
            signal: None,
            error,
        }
    }

    fn with_status(outcome: RunOutcome, pid: Option<u32>, status: Option<ExitStatus>) -> Self {
        Self {
            outcome,
            pid,
            exit_code: status.and_then(|s| s.code()),
            signal: status.and_then(exit_signal),
            error: None,
        }
    }
}

impl ProcessRunner {
    pub fn new(shutdown: ShutdownHandle, dry_run: bool) -> Self {
        Self {
            shutdown,
            dry_run,
            kill_grace: KILL_GRACE,
        }
    }

    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }

    /// Run a benchmark to completion, or until the timeout elapses or a shutdown is requested.
    ///
    /// Never fails. Anything that goes wrong is described by the outcome of the returned result.
    pub async fn run(&self, command: &BenchmarkCommand, timeout: Duration) -> RunResult {
        log::info!("Executing: {}", command.command_line());

        let started_at = Utc::now();
        let ended = if self.dry_run {
            Ended::without_process(RunOutcome::DryRun, None)
        } else if self.shutdown.is_shutdown() {
            Ended::without_process(RunOutcome::Cancelled, None)
        } else {
            self.execute(command, timeout).await
        };
        let ended_at = Utc::now();

        match ended.outcome {
            RunOutcome::Succeeded | RunOutcome::DryRun => log::info!(
                "The {} run of {} ended with {:?}",
                command.role,
                command.tool,
                ended.outcome
            ),
            outcome => log::warn!(
                "The {} run of {} ended with {:?} (exit code {:?}, signal {:?}){}",
                command.role,
                command.tool,
                outcome,
                ended.exit_code,
                ended.signal,
                ended
                    .error
                    .as_deref()
                    .map(|e| format!(": {e}"))
                    .unwrap_or_default()
            ),
        }

        run_result(command, started_at, ended_at, ended)
    }

    async fn execute(&self, command: &BenchmarkCommand, timeout: Duration) -> Ended {
        let Some((program, args)) = command.argv.split_first() else {
            return Ended::without_process(
                RunOutcome::LaunchFailure,
                Some("Empty command line".to_string()),
            );
        };

        let (stdout, stderr) = match open_output(&command.output_path) {
            Ok(output) => output,
            Err(e) => {
                return Ended::without_process(
                    RunOutcome::LaunchFailure,
                    Some(format!(
                        "Cannot open output file '{}': {e}",
                        command.output_path.display()
                    )),
                )
            }
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&command.working_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Ended::without_process(
                    RunOutcome::LaunchFailure,
                    Some(format!("Failed to start '{program}': {e}")),
                )
            }
        };
        let pid = child.id();
        log::debug!("Started {} with pid {:?}", command.tool, pid);

        let mut shutdown_listener = self.shutdown.new_listener();
        tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => {
                    Ended::with_status(RunOutcome::Succeeded, pid, Some(status))
                }
                Ok(status) => Ended::with_status(RunOutcome::Failed, pid, Some(status)),
                Err(e) => Ended {
                    error: Some(format!("Failed to wait for the benchmark: {e}")),
                    ..Ended::with_status(RunOutcome::Failed, pid, None)
                },
            },
            _ = tokio::time::sleep(timeout) => {
                log::warn!(
                    "The {} run of {} is still running after {:?}, terminating it",
                    command.role,
                    command.tool,
                    timeout
                );
                let status = terminate(&mut child, pid, self.kill_grace).await;
                Ended::with_status(RunOutcome::TimedOut, pid, status)
            },
            _ = shutdown_listener.wait_for_shutdown() => {
                log::warn!("Terminating the {} run of {} for shutdown", command.role, command.tool);
                let status = terminate(&mut child, pid, self.kill_grace).await;
                Ended::with_status(RunOutcome::Cancelled, pid, status)
            },
        }
    }

    /// Run a preflight or teardown command.
    ///
    /// Failures are logged and otherwise ignored. A background hook is returned while still
    /// running so that the caller can stop it with [ProcessRunner::stop_hook].
    pub async fn run_hook(
        &self,
        hook: &HookCommand,
        working_dir: &Path,
        timeout: Duration,
    ) -> Option<Child> {
        log::info!("Running {}: {}", hook.label, hook.argv.join(" "));
        if self.dry_run {
            return None;
        }

        let (program, args) = hook.argv.split_first()?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::error!("Failed to start {}: {e}", hook.label);
                return None;
            }
        };

        if hook.background {
            tokio::time::sleep(hook.settle).await;
            return Some(child);
        }

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => log::debug!("{} finished", hook.label),
            Ok(Ok(status)) => log::error!("{} failed: {status}", hook.label),
            Ok(Err(e)) => log::error!("Failed to wait for {}: {e}", hook.label),
            Err(_) => {
                log::error!("{} did not finish within {timeout:?}, killing it", hook.label);
                if let Err(e) = child.kill().await {
                    log::error!("Failed to kill {}: {e}", hook.label);
                }
            }
        }

        tokio::time::sleep(hook.settle).await;
        None
    }

    /// Stop a background hook started by [ProcessRunner::run_hook].
    pub async fn stop_hook(&self, mut child: Child) {
        if let Err(e) = child.kill().await {
            log::debug!("Background hook could not be killed: {e}");
        }
    }
}

/// The result of a run whose task ended without reporting back, recorded as cancelled.
pub fn cancelled_result(
    command: &BenchmarkCommand,
    started_at: DateTime<Utc>,
    error: String,
) -> RunResult {
    run_result(
        command,
        started_at,
        Utc::now(),
        Ended::without_process(RunOutcome::Cancelled, Some(error)),
    )
}

fn run_result(
    command: &BenchmarkCommand,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    ended: Ended,
) -> RunResult {
    RunResult {
        step: command.phase.step.index,
        phase: command.phase.kind,
        role: command.role,
        contention: command.phase.kind.contention(),
        tool: command.tool.to_string(),
        access: command.access.clone(),
        pattern: command.pattern.clone(),
        ppn: command.ppn,
        primary_ppn: command.phase.step.primary_ppn,
        secondary_ppn: command.phase.step.secondary_ppn,
        command_line: command.argv.clone(),
        pid: ended.pid,
        exit_code: ended.exit_code,
        signal: ended.signal,
        outcome: ended.outcome,
        started_at,
        ended_at,
        output_path: command.output_path.clone(),
        error: ended.error,
    }
}

/// Open the output file for appending, once for stdout and once for stderr.
fn open_output(path: &Path) -> std::io::Result<(std::fs::File, std::fs::File)> {
    let stdout = OpenOptions::new().create(true).append(true).open(path)?;
    let stderr = stdout.try_clone()?;
    Ok((stdout, stderr))
}

/// Ask the benchmark's process group to terminate and kill it if it does not within the grace.
async fn terminate(child: &mut Child, pid: Option<u32>, kill_grace: Duration) -> Option<ExitStatus> {
    signal_group(child, pid, Signal::Terminate);

    match tokio::time::timeout(kill_grace, child.wait()).await {
        Ok(Ok(status)) => return Some(status),
        Ok(Err(e)) => log::warn!("Failed to wait for terminated benchmark {pid:?}: {e}"),
        Err(_) => log::warn!("Benchmark {pid:?} did not exit within {kill_grace:?}, killing it"),
    }

    signal_group(child, pid, Signal::Kill);
    match child.wait().await {
        Ok(status) => Some(status),
        Err(e) => {
            log::error!("Failed to wait for killed benchmark {pid:?}: {e}");
            None
        }
    }
}

enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &mut Child, pid: Option<u32>, signal: Signal) {
    use nix::sys::signal::{killpg, Signal as NixSignal};
    use nix::unistd::Pid;

    let nix_signal = match signal {
        Signal::Terminate => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
    };

    let Some(pgid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        if let Err(e) = child.start_kill() {
            log::debug!("Failed to kill benchmark: {e}");
        }
        return;
    };

    if let Err(e) = killpg(Pid::from_raw(pgid), nix_signal) {
        log::debug!("Failed to send {nix_signal:?} to process group {pgid}: {e}");
        if let Err(e) = child.start_kill() {
            log::debug!("Failed to kill benchmark {pgid}: {e}");
        }
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _pid: Option<u32>, _signal: Signal) {
    if let Err(e) = child.start_kill() {
        log::debug!("Failed to kill benchmark: {e}");
    }
}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}
