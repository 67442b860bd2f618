use std::path::PathBuf;

/// Errors that stop a campaign.
///
/// Anything that goes wrong with a single benchmark run is recorded as part of the campaign
/// results instead. Only configuration problems, found before any benchmark is launched, and
/// failures to persist the campaign record are fatal.
#[derive(Debug, thiserror::Error)]
pub enum CampaignError {
    /// The configuration cannot produce a valid campaign.
    #[error("Invalid workload specification: {0}")]
    InvalidSpec(String),

    /// The campaign record could not be written.
    #[error("Failed to persist campaign record to '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CampaignError {
    pub fn invalid_spec(msg: impl Into<String>) -> Self {
        Self::InvalidSpec(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error was raised before anything was launched.
    pub fn is_invalid_spec(&self) -> bool {
        matches!(self, Self::InvalidSpec(_))
    }
}
