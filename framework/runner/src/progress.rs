use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use crate::schedule::Step;

/// Displays a progress bar while the campaign is running to show the user how many phases are left.
pub struct CampaignProgress {
    bar: Option<ProgressBar>,
}

impl CampaignProgress {
    /// Start showing progress, unless disabled.
    pub fn start(total_phases: usize, enabled: bool) -> Self {
        if !enabled {
            return Self { bar: None };
        }

        let bar = ProgressBar::new(total_phases as u64);
        match ProgressStyle::with_template(
            "{spinner:.green} [{wide_bar:.cyan/blue}] {pos}/{len} phases [{elapsed_precise}] {msg}",
        ) {
            Ok(style) => bar.set_style(style.progress_chars("#>-")),
            Err(e) => log::debug!("Using the default progress style: {e}"),
        }
        bar.enable_steady_tick(Duration::from_secs(1));

        Self { bar: Some(bar) }
    }

    pub fn set_step(&self, step: &Step) {
        if let Some(bar) = &self.bar {
            bar.set_message(format!(
                "step {} ({}p-{}s)",
                step.index, step.primary_ppn, step.secondary_ppn
            ));
        }
    }

    pub fn phase_done(&self) {
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            log::trace!("Progress finished");
            bar.finish_and_clear();
        }
    }
}
