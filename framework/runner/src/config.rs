use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use iopup_core::prelude::CampaignError;
use serde::Deserialize;

use crate::resolver::Tool;
use crate::schedule::IsolationMode;

/// The parallel launcher used when the configuration document does not name one.
pub const DEFAULT_MPIRUN: &str = "srun";

/// The configuration document.
///
/// It tells iopup how to invoke each benchmark tool and, optionally, provides defaults for the
/// campaign itself.
#[derive(Debug, Clone, Deserialize)]
pub struct IopupConfig {
    /// The parallel launcher for MPI tools, possibly with extra arguments.
    #[serde(default = "default_mpirun")]
    pub mpirun: String,
    pub ior: Option<ToolConfig>,
    pub elbencho: Option<ToolConfig>,
    #[serde(rename = "md-workbench")]
    pub md_workbench: Option<ToolConfig>,
    #[serde(default)]
    pub campaign: CampaignDefaults,
}

fn default_mpirun() -> String {
    DEFAULT_MPIRUN.to_string()
}

impl Default for IopupConfig {
    fn default() -> Self {
        Self {
            mpirun: default_mpirun(),
            ior: None,
            elbencho: None,
            md_workbench: None,
            campaign: CampaignDefaults::default(),
        }
    }
}

/// How to invoke one benchmark tool. Every argument string is split on whitespace.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ToolConfig {
    pub binary: PathBuf,
    #[serde(default)]
    pub common_args: String,
    #[serde(default)]
    pub access_args: BTreeMap<String, String>,
    #[serde(default)]
    pub pattern_args: BTreeMap<String, String>,
    /// Extra arguments for a specific pattern of a specific access mode.
    #[serde(default)]
    pub access_pattern_args: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub random_data_args: String,
    /// Followed by the time limit in seconds.
    #[serde(default)]
    pub timelimit_args: String,
    /// Followed by the workload's transfer size.
    #[serde(default)]
    pub transfer_size_args: String,
}

/// The `campaign` section of the configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CampaignDefaults {
    #[serde(default)]
    pub primary: WorkloadDefaults,
    #[serde(default)]
    pub secondary: WorkloadDefaults,
    pub ppn: Option<i64>,
    pub step: Option<i64>,
    pub step_count: Option<usize>,
    pub delay: Option<u64>,
    pub isolate: Option<IsolationMode>,
    pub timeout_grace: Option<u64>,
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadDefaults {
    pub tool: Option<String>,
    pub access: Option<String>,
    pub pattern: Option<String>,
    pub transfer_size: Option<String>,
    pub ppn: Option<i64>,
    pub timelimit: Option<u64>,
    pub hosts: Option<Vec<String>>,
}

impl IopupConfig {
    /// Load the configuration document from a file.
    ///
    /// A missing or malformed document means that no valid campaign can be built, so both are
    /// reported as [CampaignError::InvalidSpec].
    pub fn load(path: &Path) -> Result<Self, CampaignError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CampaignError::invalid_spec(format!(
                "Cannot read configuration '{}': {e}",
                path.display()
            ))
        })?;

        Self::from_yaml_str(&content).map_err(|e| match e {
            CampaignError::InvalidSpec(msg) => {
                CampaignError::invalid_spec(format!("{msg} in '{}'", path.display()))
            }
            other => other,
        })
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, CampaignError> {
        serde_yaml::from_str(content)
            .map_err(|e| CampaignError::invalid_spec(format!("Malformed configuration: {e}")))
    }

    /// The configuration section for a tool, if the document has one.
    pub fn tool(&self, tool: Tool) -> Option<&ToolConfig> {
        match tool {
            Tool::Ior => self.ior.as_ref(),
            Tool::Elbencho => self.elbencho.as_ref(),
            Tool::MdWorkbench => self.md_workbench.as_ref(),
        }
    }
}

/// Split an argument string from the configuration document into individual arguments.
pub fn split_args(args: &str) -> impl Iterator<Item = String> + '_ {
    args.split_whitespace().map(str::to_string)
}
