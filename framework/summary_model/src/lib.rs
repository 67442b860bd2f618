use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// One of the two workloads in an interference campaign.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The bandwidth oriented workload.
    Primary,
    /// The IOPS oriented workload, run to induce contention.
    Secondary,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Secondary => "secondary",
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a role ran alone or alongside the other role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Contention {
    Quiet,
    Noisy,
}

impl Contention {
    pub fn as_str(&self) -> &'static str {
        match self {
            Contention::Quiet => "quiet",
            Contention::Noisy => "noisy",
        }
    }
}

impl Display for Contention {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The shape of a phase. Each kind has a fixed set of participating roles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseKind {
    PrimaryOnly,
    SecondaryOnly,
    Both,
}

impl PhaseKind {
    /// The roles that run in this phase, in the order they are launched.
    pub fn roles(&self) -> &'static [Role] {
        match self {
            PhaseKind::PrimaryOnly => &[Role::Primary],
            PhaseKind::SecondaryOnly => &[Role::Secondary],
            PhaseKind::Both => &[Role::Primary, Role::Secondary],
        }
    }

    pub fn contention(&self) -> Contention {
        match self {
            PhaseKind::PrimaryOnly | PhaseKind::SecondaryOnly => Contention::Quiet,
            PhaseKind::Both => Contention::Noisy,
        }
    }

    /// The isolated phase for a single role.
    pub fn isolated(role: Role) -> Self {
        match role {
            Role::Primary => PhaseKind::PrimaryOnly,
            Role::Secondary => PhaseKind::SecondaryOnly,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::PrimaryOnly => "primary-only",
            PhaseKind::SecondaryOnly => "secondary-only",
            PhaseKind::Both => "both",
        }
    }
}

impl Display for PhaseKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a single benchmark run ended.
///
/// `Succeeded`, `Failed` and `TimedOut` are measurements: a run that fails or times out under
/// contention is a valid data point. `LaunchFailure` means the orchestrator could not start the
/// benchmark at all.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Exited with status zero before the deadline.
    Succeeded,
    /// Exited with a non-zero status before the deadline.
    Failed,
    /// Still running at the deadline, so it was terminated.
    TimedOut,
    /// The process could not be started.
    LaunchFailure,
    /// Terminated because the operator asked the campaign to stop.
    Cancelled,
    /// Resolved and logged but never started.
    DryRun,
}

impl RunOutcome {
    /// Whether this outcome describes the behaviour of the storage system under test rather than a
    /// problem with the orchestration.
    pub fn is_measurement(&self) -> bool {
        matches!(
            self,
            RunOutcome::Succeeded | RunOutcome::Failed | RunOutcome::TimedOut
        )
    }
}

/// The record of one benchmark invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunResult {
    /// The index of the step this run belongs to, starting at 0.
    pub step: usize,
    /// The phase this run belongs to.
    pub phase: PhaseKind,
    pub role: Role,
    pub contention: Contention,
    pub tool: String,
    pub access: String,
    pub pattern: String,
    /// The effective processes per node of this run's role.
    pub ppn: u32,
    /// The effective primary ppn of the step.
    pub primary_ppn: u32,
    /// The effective secondary ppn of the step.
    pub secondary_ppn: u32,
    /// The full command line, launcher prefix included.
    pub command_line: Vec<String>,
    pub pid: Option<u32>,
    /// Set when the process exited on its own.
    pub exit_code: Option<i32>,
    /// Set when the process was ended by a signal.
    pub signal: Option<i32>,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// The file holding the captured stdout and stderr.
    pub output_path: PathBuf,
    /// Why the run could not be started, for [RunOutcome::LaunchFailure].
    pub error: Option<String>,
}

impl RunResult {
    /// Wall clock duration of the run in seconds.
    pub fn duration_s(&self) -> f64 {
        (self.ended_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    /// Whether the wall clock intervals of two runs intersect.
    pub fn overlaps(&self, other: &RunResult) -> bool {
        self.started_at < other.ended_at && other.started_at < self.ended_at
    }
}

/// The workload parameters of a campaign, as recorded in the final summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkloadParameters {
    pub tool: String,
    pub access: String,
    pub pattern: String,
    pub transfer_size: Option<String>,
    pub base_ppn: u32,
    pub time_limit_s: u64,
    pub target: PathBuf,
    pub hosts: Vec<String>,
}

/// The parameters a campaign was run with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CampaignParameters {
    /// The storage path under test.
    pub target: PathBuf,
    pub primary: WorkloadParameters,
    pub secondary: WorkloadParameters,
    pub step_multiplier: u32,
    pub step_count: usize,
    pub isolation: String,
    pub delay_s: u64,
    pub timeout_grace_s: u64,
    pub dry_run: bool,
}

/// The runs of one phase, in the order they were recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseSummary {
    pub kind: PhaseKind,
    pub runs: Vec<RunResult>,
}

/// The phases executed at one concurrency level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSummary {
    pub index: usize,
    pub primary_ppn: u32,
    pub secondary_ppn: u32,
    pub phases: Vec<PhaseSummary>,
}

/// The final structured record of a campaign.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CampaignSummary {
    /// The job identifier, which also names the output directory.
    pub job_id: String,
    pub parameters: CampaignParameters,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// False if the campaign was stopped before every step ran.
    pub completed: bool,
    pub steps: Vec<StepSummary>,
    /// How many runs ended with each outcome.
    pub outcome_counts: BTreeMap<RunOutcome, usize>,
    /// The version of iopup that ran the campaign.
    pub iopup_version: String,
}

impl CampaignSummary {
    /// Build the summary from the runs recorded during the campaign.
    ///
    /// Runs must be given in the order they were recorded. Consecutive runs with the same step
    /// index form a step, and within a step consecutive runs with the same phase kind form a
    /// phase.
    pub fn from_runs(
        job_id: String,
        parameters: CampaignParameters,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        completed: bool,
        runs: &[RunResult],
        iopup_version: String,
    ) -> Self {
        let mut steps = Vec::new();
        for (index, step_runs) in &runs.iter().chunk_by(|run| run.step) {
            let step_runs = step_runs.collect::<Vec<_>>();
            let (primary_ppn, secondary_ppn) = step_runs
                .first()
                .map(|run| (run.primary_ppn, run.secondary_ppn))
                .unwrap_or_default();

            let phases = step_runs
                .iter()
                .chunk_by(|run| run.phase)
                .into_iter()
                .map(|(kind, phase_runs)| PhaseSummary {
                    kind,
                    runs: phase_runs.map(|run| (*run).clone()).collect(),
                })
                .collect();

            steps.push(StepSummary {
                index,
                primary_ppn,
                secondary_ppn,
                phases,
            });
        }

        let outcome_counts = runs.iter().map(|run| run.outcome).counts().into_iter().collect();

        Self {
            job_id,
            parameters,
            started_at,
            finished_at,
            completed,
            steps,
            outcome_counts,
            iopup_version,
        }
    }

    /// Total number of phases across all steps.
    pub fn phase_count(&self) -> usize {
        self.steps.iter().map(|step| step.phases.len()).sum()
    }

    /// Total number of recorded runs.
    pub fn run_count(&self) -> usize {
        self.outcome_counts.values().sum()
    }
}

/// Append a run result to a JSON lines record.
///
/// The result is serialized to a single line and written, newline included, with one write. The
/// data is flushed to the device before returning so that a crash never loses a result that this
/// function reported as written.
pub fn append_run_result(
    run_result: &RunResult,
    file: &mut std::fs::File,
) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(run_result)?;
    line.push(b'\n');
    file.write_all(&line)?;
    file.sync_data()?;
    Ok(())
}

/// Load run results from a JSON lines record produced by [append_run_result].
///
/// A final line without a terminating newline is the remains of an interrupted write and is
/// ignored. Any other unparseable line is an error.
pub fn load_run_results<R: Read>(mut reader: R) -> anyhow::Result<Vec<RunResult>> {
    let mut content = String::new();
    reader.read_to_string(&mut content)?;

    let complete = match content.rfind('\n') {
        Some(end) => &content[..end],
        None => "",
    };

    let mut runs = Vec::new();
    for line in complete.lines() {
        if line.trim().is_empty() {
            continue;
        }
        runs.push(serde_json::from_str(line)?);
    }
    Ok(runs)
}

/// Load run results from a JSON lines file.
pub fn load_run_results_from_file(path: &Path) -> anyhow::Result<Vec<RunResult>> {
    let file = std::fs::File::open(path)?;
    load_run_results(file)
}

/// Serialize the campaign summary to a writer
pub fn store_campaign_summary<W: Write>(
    summary: &CampaignSummary,
    writer: &mut W,
) -> std::io::Result<()> {
    serde_json::to_writer_pretty(&mut *writer, summary)?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Load a campaign summary from a reader
pub fn load_campaign_summary<R: Read>(reader: R) -> anyhow::Result<CampaignSummary> {
    let reader = std::io::BufReader::new(reader);
    let summary: CampaignSummary = serde_json::from_reader(reader)?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn run(step: usize, phase: PhaseKind, role: Role, outcome: RunOutcome) -> RunResult {
        let started_at = DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::seconds(step as i64 * 100);
        RunResult {
            step,
            phase,
            role,
            contention: phase.contention(),
            tool: "ior".to_string(),
            access: "write".to_string(),
            pattern: "bw".to_string(),
            ppn: 16,
            primary_ppn: 16 << step,
            secondary_ppn: 64 << step,
            command_line: vec!["ior".to_string(), "-w".to_string()],
            pid: Some(4242),
            exit_code: Some(0),
            signal: None,
            outcome,
            started_at,
            ended_at: started_at + Duration::milliseconds(1500),
            output_path: PathBuf::from("1234/primary_quiet.16p-64s.1234.out"),
            error: None,
        }
    }

    fn parameters() -> CampaignParameters {
        let workload = WorkloadParameters {
            tool: "ior".to_string(),
            access: "write".to_string(),
            pattern: "bw".to_string(),
            transfer_size: None,
            base_ppn: 16,
            time_limit_s: 90,
            target: PathBuf::from("/scratch/data-primary.1234.out"),
            hosts: vec![],
        };
        CampaignParameters {
            target: PathBuf::from("/scratch"),
            primary: workload.clone(),
            secondary: workload,
            step_multiplier: 2,
            step_count: 2,
            isolation: "both".to_string(),
            delay_s: 15,
            timeout_grace_s: 15,
            dry_run: false,
        }
    }

    #[test]
    fn phase_kind_roles() {
        assert_eq!(PhaseKind::PrimaryOnly.roles(), &[Role::Primary]);
        assert_eq!(PhaseKind::SecondaryOnly.roles(), &[Role::Secondary]);
        assert_eq!(PhaseKind::Both.roles(), &[Role::Primary, Role::Secondary]);
        assert_eq!(PhaseKind::Both.contention(), Contention::Noisy);
        assert_eq!(PhaseKind::isolated(Role::Secondary), PhaseKind::SecondaryOnly);
    }

    #[test]
    fn serialized_names() {
        assert_eq!(
            serde_json::to_string(&PhaseKind::SecondaryOnly).unwrap(),
            "\"secondary-only\""
        );
        assert_eq!(
            serde_json::to_string(&RunOutcome::TimedOut).unwrap(),
            "\"timed_out\""
        );
    }

    #[test]
    fn duration_and_overlap() {
        let a = run(0, PhaseKind::Both, Role::Primary, RunOutcome::Succeeded);
        let mut b = run(0, PhaseKind::Both, Role::Secondary, RunOutcome::TimedOut);
        assert_eq!(a.duration_s(), 1.5);
        assert!(a.overlaps(&b));

        b.started_at = a.ended_at;
        b.ended_at = a.ended_at + Duration::seconds(1);
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn append_then_load_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .unwrap();

        let runs = vec![
            run(0, PhaseKind::PrimaryOnly, Role::Primary, RunOutcome::Succeeded),
            run(0, PhaseKind::SecondaryOnly, Role::Secondary, RunOutcome::Failed),
            run(0, PhaseKind::Both, Role::Secondary, RunOutcome::TimedOut),
        ];
        for r in &runs {
            append_run_result(r, &mut file).unwrap();
        }

        let loaded = load_run_results_from_file(&path).unwrap();
        assert_eq!(loaded, runs);
    }

    #[test]
    fn load_ignores_torn_final_line() {
        let complete = run(0, PhaseKind::PrimaryOnly, Role::Primary, RunOutcome::Succeeded);
        let mut content = serde_json::to_string(&complete).unwrap();
        content.push('\n');
        let torn = serde_json::to_string(&run(
            0,
            PhaseKind::SecondaryOnly,
            Role::Secondary,
            RunOutcome::Succeeded,
        ))
        .unwrap();
        content.push_str(&torn[..torn.len() / 2]);

        let loaded = load_run_results(content.as_bytes()).unwrap();
        assert_eq!(loaded, vec![complete]);
    }

    #[test]
    fn load_rejects_corrupt_complete_line() {
        let content = "{\"not\": \"a run\"}\n";
        assert!(load_run_results(content.as_bytes()).is_err());
    }

    #[test]
    fn load_empty_record() {
        assert!(load_run_results("".as_bytes()).unwrap().is_empty());
    }

    #[test]
    fn summary_groups_steps_and_phases() {
        let runs = vec![
            run(0, PhaseKind::PrimaryOnly, Role::Primary, RunOutcome::Succeeded),
            run(0, PhaseKind::SecondaryOnly, Role::Secondary, RunOutcome::Succeeded),
            run(0, PhaseKind::Both, Role::Secondary, RunOutcome::TimedOut),
            run(0, PhaseKind::Both, Role::Primary, RunOutcome::Succeeded),
            run(1, PhaseKind::PrimaryOnly, Role::Primary, RunOutcome::LaunchFailure),
            run(1, PhaseKind::SecondaryOnly, Role::Secondary, RunOutcome::Succeeded),
            run(1, PhaseKind::Both, Role::Primary, RunOutcome::Failed),
            run(1, PhaseKind::Both, Role::Secondary, RunOutcome::Succeeded),
        ];
        let started_at = runs[0].started_at;
        let finished_at = runs[7].ended_at;

        let summary = CampaignSummary::from_runs(
            "1234".to_string(),
            parameters(),
            started_at,
            finished_at,
            true,
            &runs,
            "0.1.0".to_string(),
        );

        assert_eq!(summary.steps.len(), 2);
        assert_eq!(summary.phase_count(), 6);
        assert_eq!(summary.run_count(), 8);
        assert_eq!(summary.steps[1].primary_ppn, 32);
        assert_eq!(summary.steps[1].secondary_ppn, 128);
        assert_eq!(
            summary.steps[0]
                .phases
                .iter()
                .map(|phase| phase.kind)
                .collect::<Vec<_>>(),
            vec![
                PhaseKind::PrimaryOnly,
                PhaseKind::SecondaryOnly,
                PhaseKind::Both
            ]
        );
        assert_eq!(summary.steps[0].phases[2].runs.len(), 2);
        assert_eq!(summary.outcome_counts[&RunOutcome::Succeeded], 5);
        assert_eq!(summary.outcome_counts[&RunOutcome::TimedOut], 1);
        assert_eq!(summary.outcome_counts[&RunOutcome::LaunchFailure], 1);
        assert_eq!(summary.outcome_counts[&RunOutcome::Failed], 1);
    }

    #[test]
    fn summary_round_trips_through_json() {
        let runs = vec![run(0, PhaseKind::Both, Role::Primary, RunOutcome::Succeeded)];
        let summary = CampaignSummary::from_runs(
            "1234".to_string(),
            parameters(),
            runs[0].started_at,
            runs[0].ended_at,
            false,
            &runs,
            "0.1.0".to_string(),
        );

        let mut buffer = Vec::new();
        store_campaign_summary(&summary, &mut buffer).unwrap();
        let loaded = load_campaign_summary(buffer.as_slice()).unwrap();
        assert_eq!(loaded, summary);
        assert!(!loaded.completed);
    }

    #[test]
    fn outcome_classes() {
        assert!(RunOutcome::TimedOut.is_measurement());
        assert!(RunOutcome::Failed.is_measurement());
        assert!(!RunOutcome::LaunchFailure.is_measurement());
        assert!(!RunOutcome::Cancelled.is_measurement());
    }
}
