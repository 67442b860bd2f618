use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use iopup_core::prelude::{CampaignError, ShutdownHandle, ShutdownSignalError};
use iopup_summary_model::CampaignSummary;

use crate::collector::ResultsCollector;
use crate::coordinator::Coordinator;
use crate::definition::Campaign;
use crate::executor::Executor;
use crate::process::ProcessRunner;
use crate::progress::CampaignProgress;
use crate::schedule::phases_for;
use crate::shutdown::start_shutdown_listener;
use crate::types::IopupResult;

/// Run a campaign until every step has run or the operator stops it.
///
/// Returns an error if the campaign was stopped early. The record of the runs that did happen is
/// still written to the job directory.
pub fn run(campaign: Campaign) -> IopupResult<CampaignSummary> {
    log::info!(
        "Running campaign {} against '{}'",
        campaign.job_id,
        campaign.target.display()
    );

    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    let shutdown_handle = start_shutdown_listener(&runtime)?;
    let executor = Executor::new(runtime, shutdown_handle);

    let job_dir = campaign.job_dir.clone();
    let summary = executor.execute_in_place(run_campaign(
        Arc::new(campaign),
        executor.shutdown_handle().clone(),
    ))?;

    if !summary.completed {
        return Err(
            anyhow::Error::new(ShutdownSignalError::default()).context(format!(
                "Campaign {} was interrupted after {} runs, the partial record is in '{}'",
                summary.job_id,
                summary.run_count(),
                job_dir.display()
            )),
        );
    }

    Ok(summary)
}

/// Walk the steps of a campaign, running the phases of each and recording every result.
///
/// The job directory is created here and must not exist yet.
pub async fn run_campaign(
    campaign: Arc<Campaign>,
    shutdown: ShutdownHandle,
) -> Result<CampaignSummary, CampaignError> {
    let steps = campaign.steps()?;
    let total_phases = campaign.phases()?.len();

    create_job_dir(&campaign.job_dir)?;
    let mut collector = ResultsCollector::create(&campaign.job_dir)?;
    let progress = CampaignProgress::start(total_phases, !campaign.no_progress);

    let runner = ProcessRunner::new(shutdown.clone(), campaign.dry_run);
    let coordinator = Coordinator::new(campaign.clone(), runner, shutdown.clone());

    let mut completed = true;
    'steps: for (step_pos, step) in steps.iter().enumerate() {
        log::info!(
            "Starting step {} of {}: primary ppn {}, secondary ppn {}",
            step_pos + 1,
            steps.len(),
            step.primary_ppn,
            step.secondary_ppn
        );
        progress.set_step(step);

        let phases = phases_for(*step, campaign.isolation);
        for (phase_pos, phase) in phases.iter().enumerate() {
            if shutdown.is_shutdown() {
                completed = false;
                break 'steps;
            }

            for result in coordinator.execute(phase).await? {
                collector.record(result)?;
            }
            progress.phase_done();

            let last = step_pos + 1 == steps.len() && phase_pos + 1 == phases.len();
            if !last && !coordinator.inter_phase_delay().await {
                completed = false;
                break 'steps;
            }
        }
    }

    if shutdown.is_shutdown() {
        completed = false;
    }
    progress.finish();

    collector.finalize(&campaign, completed)
}

fn create_job_dir(job_dir: &Path) -> Result<(), CampaignError> {
    if let Some(parent) = job_dir.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CampaignError::io(parent, e))?;
    }
    std::fs::create_dir(job_dir).map_err(|e| CampaignError::io(job_dir, e))?;
    log::debug!("Created job directory '{}'", job_dir.display());
    Ok(())
}
