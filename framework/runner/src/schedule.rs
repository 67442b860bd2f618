use iopup_core::prelude::CampaignError;
use iopup_summary_model::{PhaseKind, Role};
use serde::Deserialize;

/// Which workloads also run alone, before both run together, at every step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Only run both workloads together.
    #[default]
    None,
    Primary,
    Secondary,
    /// Run each workload alone, then both together.
    Both,
}

impl IsolationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationMode::None => "none",
            IsolationMode::Primary => "primary",
            IsolationMode::Secondary => "secondary",
            IsolationMode::Both => "both",
        }
    }
}

/// One concurrency level of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub index: usize,
    pub primary_ppn: u32,
    pub secondary_ppn: u32,
}

impl Step {
    /// The effective processes per node of a role at this step.
    pub fn ppn(&self, role: Role) -> u32 {
        match role {
            Role::Primary => self.primary_ppn,
            Role::Secondary => self.secondary_ppn,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phase {
    pub step: Step,
    pub kind: PhaseKind,
}

/// `base * multiplier^index`, or `None` if that does not fit.
pub fn scaled_ppn(base: u32, multiplier: u32, index: usize) -> Option<u32> {
    let exponent = u32::try_from(index).ok()?;
    multiplier.checked_pow(exponent)?.checked_mul(base)
}

/// The steps of a campaign, in the order they run.
pub fn steps_for(
    primary_base: u32,
    secondary_base: u32,
    multiplier: u32,
    step_count: usize,
) -> Result<Vec<Step>, CampaignError> {
    (0..step_count)
        .map(|index| {
            let scale = |role: Role, base: u32| {
                scaled_ppn(base, multiplier, index).ok_or_else(|| {
                    CampaignError::invalid_spec(format!(
                        "The {role} ppn overflows at step {index} ({base} * {multiplier}^{index})"
                    ))
                })
            };
            Ok(Step {
                index,
                primary_ppn: scale(Role::Primary, primary_base)?,
                secondary_ppn: scale(Role::Secondary, secondary_base)?,
            })
        })
        .collect()
}

/// The phases of one step, in the order they run. The phase with both workloads is always last.
pub fn phases_for(step: Step, isolation: IsolationMode) -> Vec<Phase> {
    let kinds: &[PhaseKind] = match isolation {
        IsolationMode::None => &[PhaseKind::Both],
        IsolationMode::Primary => &[PhaseKind::PrimaryOnly, PhaseKind::Both],
        IsolationMode::Secondary => &[PhaseKind::SecondaryOnly, PhaseKind::Both],
        IsolationMode::Both => &[
            PhaseKind::PrimaryOnly,
            PhaseKind::SecondaryOnly,
            PhaseKind::Both,
        ],
    };

    kinds.iter().map(|&kind| Phase { step, kind }).collect()
}
