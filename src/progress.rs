//! Progress reporting for long index phases
//!
//! The engine announces named phases (reading manifests, merging the
//! dictionary) with an optional goal. Library callers who want silence get
//! [`NullProgress`]; the CLI wires up [`BarProgress`] behind its
//! `--progress` flag.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Receiver for phase start / advance / finish notifications.
pub trait ProgressTracker {
    /// A phase begins. `goal` is the expected number of items, when known.
    fn job_start(&mut self, name: &str, goal: Option<u64>);

    fn job_add_progress(&mut self, amount: u64);

    fn job_done(&mut self);
}

/// Discards all progress events.
#[derive(Debug, Default)]
pub struct NullProgress;

impl ProgressTracker for NullProgress {
    fn job_start(&mut self, _name: &str, _goal: Option<u64>) {}
    fn job_add_progress(&mut self, _amount: u64) {}
    fn job_done(&mut self) {}
}

/// Renders each phase as a terminal progress bar on stderr. Phases without a
/// goal render as a spinner.
#[derive(Debug, Default)]
pub struct BarProgress {
    bar: Option<ProgressBar>,
}

impl ProgressTracker for BarProgress {
    fn job_start(&mut self, name: &str, goal: Option<u64>) {
        self.job_done();
        let pb = match goal {
            Some(goal) => {
                let pb = ProgressBar::new(goal);
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                        .expect("static template")
                        .progress_chars("=>-"),
                );
                pb
            }
            None => {
                let pb = ProgressBar::new_spinner();
                pb.enable_steady_tick(std::time::Duration::from_millis(100));
                pb
            }
        };
        pb.set_draw_target(ProgressDrawTarget::stderr());
        pb.set_message(name.to_string());
        self.bar = Some(pb);
    }

    fn job_add_progress(&mut self, amount: u64) {
        if let Some(pb) = &self.bar {
            pb.inc(amount);
        }
    }

    fn job_done(&mut self) {
        if let Some(pb) = self.bar.take() {
            pb.finish_and_clear();
        }
    }
}
