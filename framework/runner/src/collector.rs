use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use iopup_core::prelude::CampaignError;
use iopup_summary_model::{append_run_result, store_campaign_summary, CampaignSummary, RunResult};

use crate::definition::Campaign;

/// The append-only record of every run, one JSON document per line.
pub const RUNS_FILE: &str = "runs.jsonl";
/// The final record of the campaign.
pub const CAMPAIGN_FILE: &str = "campaign.json";

/// Records the results of a campaign as they arrive.
///
/// Every result is on disk before [ResultsCollector::record] returns, so if the process dies the
/// record holds every run that finished before it.
pub struct ResultsCollector {
    runs_path: PathBuf,
    file: File,
    /// The length of the record up to and including the last complete line.
    persisted_len: u64,
    runs: Vec<RunResult>,
    started_at: DateTime<Utc>,
}

impl ResultsCollector {
    /// Start a new record in an existing job directory.
    pub fn create(job_dir: &Path) -> Result<Self, CampaignError> {
        let runs_path = job_dir.join(RUNS_FILE);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&runs_path)
            .map_err(|e| CampaignError::io(&runs_path, e))?;

        Ok(Self {
            runs_path,
            file,
            persisted_len: 0,
            runs: Vec::new(),
            started_at: Utc::now(),
        })
    }

    /// Persist a run result, retrying once on a fresh handle before giving up.
    pub fn record(&mut self, run_result: RunResult) -> Result<(), CampaignError> {
        if let Err(e) = self.persist(&run_result) {
            log::warn!(
                "Failed to record a run in '{}', retrying: {e}",
                self.runs_path.display()
            );
            self.reopen()
                .and_then(|()| self.persist(&run_result))
                .map_err(|e| CampaignError::io(&self.runs_path, e))?;
        }

        self.runs.push(run_result);
        Ok(())
    }

    pub fn runs(&self) -> &[RunResult] {
        &self.runs
    }

    /// Write the final record of the campaign next to the run record and return it.
    pub fn finalize(
        self,
        campaign: &Campaign,
        completed: bool,
    ) -> Result<CampaignSummary, CampaignError> {
        let summary = CampaignSummary::from_runs(
            campaign.job_id.clone(),
            campaign.parameters(),
            self.started_at,
            Utc::now(),
            completed,
            &self.runs,
            env!("CARGO_PKG_VERSION").to_string(),
        );

        let path = campaign.job_dir.join(CAMPAIGN_FILE);
        if let Err(e) = write_summary(&summary, &path) {
            log::warn!("Failed to write '{}', retrying: {e}", path.display());
            write_summary(&summary, &path).map_err(|e| CampaignError::io(&path, e))?;
        }

        log::info!(
            "Campaign {} recorded {} runs in '{}'",
            summary.job_id,
            summary.run_count(),
            path.display()
        );
        Ok(summary)
    }

    /// Open the record again and drop anything after the last complete line.
    fn reopen(&mut self) -> std::io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.runs_path)?;
        file.set_len(self.persisted_len)?;
        self.file = file;
        Ok(())
    }

    fn persist(&mut self, run_result: &RunResult) -> std::io::Result<()> {
        match append_run_result(run_result, &mut self.file) {
            Ok(()) => {
                self.persisted_len = self.file.metadata()?.len();
                Ok(())
            }
            Err(e) => {
                // Drop whatever part of the line made it out so a retry starts on a clean line.
                if let Err(truncate_err) = self.file.set_len(self.persisted_len) {
                    log::debug!("Failed to truncate the run record: {truncate_err}");
                }
                Err(e)
            }
        }
    }
}

/// Write the summary to a temporary file and move it into place, so the final record is never
/// seen half written.
fn write_summary(summary: &CampaignSummary, path: &Path) -> std::io::Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    let mut file = File::create(&tmp_path)?;
    store_campaign_summary(summary, &mut file)?;
    file.flush()?;
    file.sync_all()?;
    std::fs::rename(&tmp_path, path)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testing;
    use iopup_summary_model::{
        load_campaign_summary, load_run_results_from_file, Contention, PhaseKind, Role, RunOutcome,
    };
    use pretty_assertions::assert_eq;

    fn result(step: usize, role: Role, outcome: RunOutcome) -> RunResult {
        let now = Utc::now();
        RunResult {
            step,
            phase: PhaseKind::Both,
            role,
            contention: Contention::Noisy,
            tool: "elbencho".to_string(),
            access: "write".to_string(),
            pattern: "bw".to_string(),
            ppn: 2,
            primary_ppn: 2,
            secondary_ppn: 4,
            command_line: vec!["fake-bench".to_string()],
            pid: Some(1),
            exit_code: Some(0),
            signal: None,
            outcome,
            started_at: now,
            ended_at: now,
            output_path: PathBuf::from("out"),
            error: None,
        }
    }

    #[test]
    fn job_directory_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let err = ResultsCollector::create(&dir.path().join("missing")).err().unwrap();
        assert!(matches!(err, CampaignError::Io { .. }));
    }

    #[test]
    fn record_is_never_reused() {
        let dir = tempfile::tempdir().unwrap();
        let _first = ResultsCollector::create(dir.path()).unwrap();
        assert!(ResultsCollector::create(dir.path()).is_err());
    }

    #[test]
    fn survives_a_crash_in_issue_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut collector = ResultsCollector::create(dir.path()).unwrap();
        let recorded = vec![
            result(0, Role::Primary, RunOutcome::Succeeded),
            result(0, Role::Secondary, RunOutcome::TimedOut),
            result(1, Role::Primary, RunOutcome::Failed),
        ];
        for r in &recorded {
            collector.record(r.clone()).unwrap();
        }
        assert_eq!(collector.runs(), recorded.as_slice());

        // The process dies part way through writing the next result, before finalizing.
        drop(collector);
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(RUNS_FILE))
            .unwrap();
        file.write_all(b"{\"step\":1,\"phase\":\"bo").unwrap();

        let loaded = load_run_results_from_file(&dir.path().join(RUNS_FILE)).unwrap();
        assert_eq!(loaded, recorded);
        assert!(!dir.path().join(CAMPAIGN_FILE).exists());
    }

    #[test]
    fn failed_append_is_retried_without_a_torn_line() {
        let dir = tempfile::tempdir().unwrap();
        let runs_path = dir.path().join(RUNS_FILE);
        let mut collector = ResultsCollector::create(dir.path()).unwrap();
        let first = result(0, Role::Primary, RunOutcome::Succeeded);
        collector.record(first.clone()).unwrap();

        // Part of a line made it out before the handle went bad.
        let mut other = OpenOptions::new().append(true).open(&runs_path).unwrap();
        other.write_all(b"{\"step\":0,\"ph").unwrap();
        collector.file = File::open(&runs_path).unwrap();

        let second = result(0, Role::Secondary, RunOutcome::TimedOut);
        collector.record(second.clone()).unwrap();
        assert_eq!(collector.runs(), &[first.clone(), second.clone()]);

        let content = std::fs::read_to_string(&runs_path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.ends_with('\n'));
        assert_eq!(
            load_run_results_from_file(&runs_path).unwrap(),
            vec![first, second]
        );
    }

    #[test]
    fn second_append_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let runs_path = dir.path().join(RUNS_FILE);
        let mut collector = ResultsCollector::create(dir.path()).unwrap();
        collector
            .record(result(0, Role::Primary, RunOutcome::Succeeded))
            .unwrap();

        collector.file = File::open(&runs_path).unwrap();
        std::fs::remove_file(&runs_path).unwrap();

        let err = collector
            .record(result(0, Role::Secondary, RunOutcome::Succeeded))
            .unwrap_err();
        assert!(matches!(err, CampaignError::Io { .. }));
        assert_eq!(collector.runs().len(), 1);
    }

    #[test]
    fn unwritable_summary_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let campaign = testing::campaign(dir.path(), testing::cli(dir.path()));
        let mut collector = ResultsCollector::create(&campaign.job_dir).unwrap();
        collector
            .record(result(0, Role::Primary, RunOutcome::Succeeded))
            .unwrap();

        // A directory in the way of the final record cannot be replaced by a file.
        std::fs::create_dir(campaign.job_dir.join(CAMPAIGN_FILE)).unwrap();

        let err = collector.finalize(&campaign, true).unwrap_err();
        assert!(matches!(err, CampaignError::Io { .. }));
    }

    #[test]
    fn finalize_writes_summary() {
        let dir = tempfile::tempdir().unwrap();
        let campaign = testing::campaign(dir.path(), testing::cli(dir.path()));
        let mut collector = ResultsCollector::create(&campaign.job_dir).unwrap();
        collector
            .record(result(0, Role::Primary, RunOutcome::Succeeded))
            .unwrap();
        collector
            .record(result(0, Role::Secondary, RunOutcome::LaunchFailure))
            .unwrap();

        let summary = collector.finalize(&campaign, true).unwrap();
        assert!(summary.completed);
        assert_eq!(summary.job_id, "42");
        assert_eq!(summary.run_count(), 2);
        assert_eq!(summary.outcome_counts[&RunOutcome::LaunchFailure], 1);

        let file = File::open(campaign.job_dir.join(CAMPAIGN_FILE)).unwrap();
        let loaded = load_campaign_summary(file).unwrap();
        assert_eq!(loaded, summary);
        assert!(!campaign.job_dir.join("campaign.json.tmp").exists());
    }
}
