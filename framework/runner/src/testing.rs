use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};

use crate::cli::IopupCli;
use crate::config::IopupConfig;
use crate::definition::{Campaign, CampaignDefinitionBuilder};

/// Stands in for a benchmark. Sleeps for `--sleep N` seconds, then exits with `--exit C`.
const FAKE_TOOL: &str = include_str!("../tests/fake-bench.sh");

pub(crate) fn write_fake_tool(dir: &Path) -> PathBuf {
    let path = dir.join("fake-bench");
    std::fs::write(&path, FAKE_TOOL).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub(crate) fn config(tool: &Path) -> IopupConfig {
    IopupConfig::from_yaml_str(&format!(
        r#"
elbencho:
  binary: {}
  common_args: "--threads 1"
  access_args: {{ write: "--write" }}
  pattern_args: {{ bw: "--sleep 0.2", iops: "--sleep 0.2", slow: "--sleep 30", fail: "--exit 3" }}
  timelimit_args: "--timelimit"
campaign:
  primary: {{ tool: elbencho }}
  secondary: {{ tool: elbencho }}
  delay: 0
"#,
        tool.display()
    ))
    .unwrap()
}

pub(crate) fn cli(dir: &Path) -> IopupCli {
    IopupCli {
        target: dir.join("target"),
        primary_ppn: Some(2),
        secondary_ppn: Some(4),
        output_dir: Some(dir.join("results")),
        job_id: Some("42".to_string()),
        no_progress: true,
        ..Default::default()
    }
}

/// A campaign against the fake tool, with its job directory created.
pub(crate) fn campaign(dir: &Path, cli: IopupCli) -> Campaign {
    let tool = write_fake_tool(dir);
    let campaign = CampaignDefinitionBuilder::new(cli)
        .with_config(config(&tool))
        .build()
        .unwrap();
    std::fs::create_dir_all(&campaign.job_dir).unwrap();
    campaign
}
