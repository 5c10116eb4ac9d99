//! Step reporting and cooperative cancellation.
//!
//! Loops call [`Progress::step`] between model invocations; returning
//! `false` stops the loop with [`DecodeError::Cancelled`]. Nothing is
//! interrupted mid-step.
//!
//! [`DecodeError::Cancelled`]: crate::error::DecodeError::Cancelled

/// Decode loop stage names passed to [`Progress`].
pub mod stage {
    pub const AR: &str = "ar";
    pub const NAR: &str = "nar";
    pub const MASKED: &str = "nar-masked";
    pub const LENGTH: &str = "len";
}

pub trait Progress {
    /// Called before step `step` of `total`. Return `false` to cancel.
    fn step(&mut self, stage: &str, step: usize, total: usize) -> bool;

    /// Called once when a stage ends normally.
    fn finish(&mut self, _stage: &str) {}
}

/// Reports nothing, never cancels.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn step(&mut self, _stage: &str, _step: usize, _total: usize) -> bool {
        true
    }
}

impl<F> Progress for F
where
    F: FnMut(&str, usize, usize) -> bool,
{
    fn step(&mut self, stage: &str, step: usize, total: usize) -> bool {
        self(stage, step, total)
    }
}

#[cfg(feature = "progress")]
pub use bars::ProgressBars;

#[cfg(feature = "progress")]
mod bars {
    use indicatif::{ProgressBar, ProgressStyle};

    use super::Progress;

    /// Terminal progress bars, one per stage.
    #[derive(Default)]
    pub struct ProgressBars {
        current: Option<(String, ProgressBar)>,
    }

    impl ProgressBars {
        pub fn new() -> Self {
            Self::default()
        }

        fn ensure_bar(&mut self, stage: &str, total: usize) {
            if matches!(&self.current, Some((name, _)) if name == stage) {
                return;
            }
            if let Some((_, bar)) = self.current.take() {
                bar.finish_and_clear();
            }
            let bar = ProgressBar::new(total as u64);
            if let Ok(style) = ProgressStyle::default_bar().template(
                "{spinner:.green} {prefix:>10} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}",
            ) {
                bar.set_style(style.progress_chars("#>-"));
            }
            bar.set_prefix(stage.to_string());
            self.current = Some((stage.to_string(), bar));
        }
    }

    impl Progress for ProgressBars {
        fn step(&mut self, stage: &str, step: usize, total: usize) -> bool {
            self.ensure_bar(stage, total);
            if let Some((_, bar)) = &self.current {
                bar.set_position(step as u64);
            }
            true
        }

        fn finish(&mut self, stage: &str) {
            if let Some((name, bar)) = self.current.take() {
                if name == stage {
                    bar.finish();
                } else {
                    self.current = Some((name, bar));
                }
            }
        }
    }
}
