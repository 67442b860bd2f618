use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use iopup_core::prelude::{CampaignError, ShutdownHandle};
use iopup_summary_model::RunResult;
use tokio::task::JoinHandle;

use crate::definition::Campaign;
use crate::process::{cancelled_result, ProcessRunner};
use crate::resolver::BenchmarkCommand;
use crate::schedule::Phase;

/// Executes the phases of a campaign, one at a time.
pub struct Coordinator {
    campaign: Arc<Campaign>,
    runner: ProcessRunner,
    shutdown: ShutdownHandle,
}

impl Coordinator {
    pub fn new(campaign: Arc<Campaign>, runner: ProcessRunner, shutdown: ShutdownHandle) -> Self {
        Self {
            campaign,
            runner,
            shutdown,
        }
    }

    /// Run every role of a phase and return their results in launch order.
    ///
    /// All roles are launched before any is awaited and each has its own deadline, so a role that
    /// times out does not affect the others. Preflight hooks run before the launches and teardown
    /// hooks after every role has finished.
    pub async fn execute(&self, phase: &Phase) -> Result<Vec<RunResult>, CampaignError> {
        let campaign = &self.campaign;
        let resolver = &campaign.resolver;
        let roles = phase.kind.roles();

        let commands = roles
            .iter()
            .map(|&role| {
                let spec = campaign.spec(role);
                resolver.resolve(spec, phase.step.ppn(role), spec.time_limit, phase)
            })
            .collect::<Result<Vec<_>, _>>()?;

        log::info!(
            "Step {}: running the {} phase with {}p-{}s",
            phase.step.index,
            phase.kind,
            phase.step.primary_ppn,
            phase.step.secondary_ppn
        );

        let mut background = Vec::new();
        for &role in roles {
            let spec = campaign.spec(role);
            for hook in resolver.preflight(spec, phase.step.ppn(role))? {
                if let Some(child) = self
                    .runner
                    .run_hook(&hook, resolver.job_dir(), self.hook_timeout(spec.time_limit))
                    .await
                {
                    background.push(child);
                }
            }
        }

        let started_at = Utc::now();
        let handles = commands
            .into_iter()
            .map(|command| {
                let runner = self.runner.clone();
                let timeout = command.time_limit + campaign.timeout_grace;
                let task_command = command.clone();
                let handle = tokio::spawn(async move { runner.run(&task_command, timeout).await });
                (command, handle)
            })
            .collect::<Vec<_>>();

        let mut results = Vec::with_capacity(handles.len());
        for (command, handle) in handles {
            results.push(join_run(&command, started_at, handle).await);
        }

        for &role in roles {
            let spec = campaign.spec(role);
            for hook in resolver.teardown(spec, phase.step.ppn(role), spec.time_limit)? {
                if let Some(child) = self
                    .runner
                    .run_hook(&hook, resolver.job_dir(), self.hook_timeout(spec.time_limit))
                    .await
                {
                    background.push(child);
                }
            }
        }
        for child in background {
            self.runner.stop_hook(child).await;
        }

        Ok(results)
    }

    /// Pause between two phases. Returns false if the pause was cut short by a shutdown.
    pub async fn inter_phase_delay(&self) -> bool {
        let delay = self.campaign.delay;
        if delay.is_zero() {
            return !self.shutdown.is_shutdown();
        }
        if self.campaign.dry_run {
            log::info!("Dry run, skipping the {delay:?} delay before the next phase");
            return true;
        }

        log::info!("Waiting {delay:?} before the next phase");
        let mut shutdown_listener = self.shutdown.new_listener();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown_listener.wait_for_shutdown() => {
                log::info!("Delay interrupted by shutdown");
                false
            }
        }
    }

    fn hook_timeout(&self, time_limit: Duration) -> Duration {
        time_limit + self.campaign.timeout_grace
    }
}

/// Wait for a benchmark task. A task that was cancelled before reporting is recorded as a
/// cancelled run so every launched role has a result.
async fn join_run(
    command: &BenchmarkCommand,
    started_at: DateTime<Utc>,
    handle: JoinHandle<RunResult>,
) -> RunResult {
    match handle.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => {
            log::error!(
                "The {} run of {} did not complete: {e}",
                command.role,
                command.tool
            );
            cancelled_result(command, started_at, e.to_string())
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cli::IopupCli;
    use crate::schedule::phases_for;
    use crate::testing;
    use iopup_summary_model::{Contention, PhaseKind, Role, RunOutcome};
    use std::time::Instant;

    fn coordinator(campaign: Campaign, shutdown: ShutdownHandle) -> Coordinator {
        let runner = ProcessRunner::new(shutdown.clone(), campaign.dry_run)
            .with_kill_grace(Duration::from_millis(500));
        Coordinator::new(Arc::new(campaign), runner, shutdown)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn both_phase_runs_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let campaign = testing::campaign(dir.path(), testing::cli(dir.path()));
        let step = campaign.steps().unwrap()[0];
        let coordinator = coordinator(campaign, ShutdownHandle::new());

        let results = coordinator
            .execute(&phases_for(step, Default::default())[0])
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].role, Role::Primary);
        assert_eq!(results[1].role, Role::Secondary);
        assert!(results.iter().all(|r| r.outcome == RunOutcome::Succeeded));
        assert!(results.iter().all(|r| r.contention == Contention::Noisy));
        assert!(results[0].overlaps(&results[1]));
        assert!(results.iter().all(|r| r.output_path.exists()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn timeout_of_one_role_does_not_hold_the_other() {
        let dir = tempfile::tempdir().unwrap();
        let campaign = testing::campaign(
            dir.path(),
            IopupCli {
                secondary_pattern: Some("slow".to_string()),
                secondary_timelimit: Some(1),
                ..testing::cli(dir.path())
            },
        );
        let step = campaign.steps().unwrap()[0];
        let coordinator = coordinator(campaign, ShutdownHandle::new());

        let start = Instant::now();
        let results = coordinator
            .execute(&phases_for(step, Default::default())[0])
            .await
            .unwrap();

        let primary = &results[0];
        let secondary = &results[1];
        assert_eq!(primary.outcome, RunOutcome::Succeeded);
        assert_eq!(secondary.outcome, RunOutcome::TimedOut);
        assert!(primary.duration_s() < 1.0);
        assert!(primary.ended_at < secondary.ended_at);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn single_role_phase() {
        let dir = tempfile::tempdir().unwrap();
        let campaign = testing::campaign(
            dir.path(),
            IopupCli {
                secondary_pattern: Some("fail".to_string()),
                ..testing::cli(dir.path())
            },
        );
        let step = campaign.steps().unwrap()[0];
        let coordinator = coordinator(campaign, ShutdownHandle::new());

        let phase = Phase {
            step,
            kind: PhaseKind::SecondaryOnly,
        };
        let results = coordinator.execute(&phase).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].role, Role::Secondary);
        assert_eq!(results[0].contention, Contention::Quiet);
        assert_eq!(results[0].outcome, RunOutcome::Failed);
        assert_eq!(results[0].exit_code, Some(3));
    }

    #[tokio::test]
    async fn aborted_task_is_recorded_as_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let campaign = testing::campaign(dir.path(), testing::cli(dir.path()));
        let step = campaign.steps().unwrap()[0];
        let phase = phases_for(step, Default::default())[0];
        let spec = campaign.spec(Role::Secondary);
        let command = campaign
            .resolver
            .resolve(spec, step.ppn(Role::Secondary), spec.time_limit, &phase)
            .unwrap();

        let handle = tokio::spawn(std::future::pending::<RunResult>());
        handle.abort();

        let result = join_run(&command, Utc::now(), handle).await;
        assert_eq!(result.role, Role::Secondary);
        assert_eq!(result.contention, Contention::Noisy);
        assert_eq!(result.outcome, RunOutcome::Cancelled);
        assert_eq!(result.pid, None);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn delay_is_cut_short_by_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let campaign = testing::campaign(
            dir.path(),
            IopupCli {
                delay: Some(60),
                ..testing::cli(dir.path())
            },
        );
        let shutdown = ShutdownHandle::new();
        let coordinator = coordinator(campaign, shutdown.clone());

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.shutdown();
        });
        let completed = tokio::time::timeout(Duration::from_secs(5), coordinator.inter_phase_delay())
            .await
            .unwrap();
        trigger.await.unwrap();
        assert!(!completed);
    }

    #[tokio::test]
    async fn dry_run_skips_delay() {
        let dir = tempfile::tempdir().unwrap();
        let campaign = testing::campaign(
            dir.path(),
            IopupCli {
                delay: Some(60),
                dry_run: true,
                ..testing::cli(dir.path())
            },
        );
        let coordinator = coordinator(campaign, ShutdownHandle::new());

        let completed = tokio::time::timeout(Duration::from_secs(5), coordinator.inter_phase_delay())
            .await
            .unwrap();
        assert!(completed);
    }
}
