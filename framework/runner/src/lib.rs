mod cli;
mod collector;
mod config;
mod coordinator;
mod definition;
mod executor;
mod init;
mod process;
mod progress;
mod resolver;
mod run;
mod schedule;
mod shutdown;
#[cfg(all(test, unix))]
mod testing;
mod types;

pub mod prelude {
    pub use crate::cli::IopupCli;
    pub use crate::collector::{ResultsCollector, CAMPAIGN_FILE, RUNS_FILE};
    pub use crate::config::{split_args, CampaignDefaults, IopupConfig, ToolConfig, WorkloadDefaults};
    pub use crate::coordinator::Coordinator;
    pub use crate::definition::{Campaign, CampaignDefinitionBuilder, WorkloadSpec};
    pub use crate::init::init;
    pub use crate::process::{ProcessRunner, KILL_GRACE};
    pub use crate::resolver::{BenchmarkCommand, HookCommand, Resolver, Tool};
    pub use crate::run::{run, run_campaign};
    pub use crate::schedule::{phases_for, steps_for, IsolationMode, Phase, Step};
    pub use crate::types::IopupResult;

    pub use iopup_core::prelude::*;
    pub use iopup_summary_model::{
        CampaignSummary, Contention, PhaseKind, Role, RunOutcome, RunResult,
    };
}
