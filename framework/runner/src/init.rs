use crate::cli::IopupCli;
use clap::Parser;

/// Initialise the CLI and logging for the campaign runner.
///
/// Logging defaults to the `info` level so that every launched command is visible. Set `RUST_LOG`
/// to change it.
pub fn init() -> IopupCli {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    IopupCli::parse()
}
