/// Recommended error type for the `main` function of a binary that drives a campaign. Fatal
/// [iopup_core::prelude::CampaignError]s convert into it so you can use `?` to propagate them.
pub type IopupResult<T> = anyhow::Result<T>;
