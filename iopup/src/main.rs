use iopup_runner::prelude::*;

fn main() -> IopupResult<()> {
    let cli = init();

    let campaign = CampaignDefinitionBuilder::new(cli).build()?;
    let summary = run(campaign)?;

    log::info!(
        "Campaign {} finished: {} runs over {} phases, {:?}",
        summary.job_id,
        summary.run_count(),
        summary.phase_count(),
        summary.outcome_counts
    );

    Ok(())
}
