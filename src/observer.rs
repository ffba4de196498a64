//! Progress and status reporting out of the engine.

use indicatif::ProgressBar;
use log::{debug, info};

/// Receives the only user-facing output of an update.
#[cfg_attr(test, mockall::automock)]
pub trait DfuObserver: Send + Sync {
    /// Transfer progress, 0..=100, never decreasing within a transfer.
    fn progress(&self, percent: u8);
    /// Human readable status line.
    fn status(&self, line: &str);
}

/// Observer that only writes to the log.
pub struct LogObserver;

impl DfuObserver for LogObserver {
    fn progress(&self, percent: u8) {
        info!("progress {}%", percent);
    }

    fn status(&self, line: &str) {
        info!("{}", line);
    }
}

/// Terminal progress bar, status lines printed above it.
pub struct BarObserver {
    bar: ProgressBar,
}

impl BarObserver {
    pub fn new() -> Self {
        Self {
            bar: ProgressBar::new(100),
        }
    }

    pub fn finish(&self) {
        self.bar.finish();
    }
}

impl Default for BarObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl DfuObserver for BarObserver {
    fn progress(&self, percent: u8) {
        self.bar.set_position(u64::from(percent));
    }

    fn status(&self, line: &str) {
        debug!("status: {}", line);
        self.bar.println(line);
    }
}
