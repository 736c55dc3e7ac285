use indicatif::{ProgressBar, ProgressStyle};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// Live batch counters behind a single-line spinner.
///
/// Counters are only ever bumped atomically; the bar message is re-rendered
/// from a snapshot after every change.
pub struct Progress {
    processed: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    invalid: AtomicU64,
    retried: AtomicU64,
    active: AtomicU64,
    bar: ProgressBar,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub processed: u64,
    pub success: u64,
    pub failed: u64,
    pub invalid: u64,
    pub retried: u64,
    pub active: u64,
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Processed: {} | Success: {} | Errors: {} | Invalid: {} | Retried: {} | Active: {}",
            self.processed, self.success, self.failed, self.invalid, self.retried, self.active
        )
    }
}

impl Progress {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("[{elapsed_precise}] {spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(200));
        Self::with_bar(bar)
    }

    #[cfg(test)]
    pub fn hidden() -> Self {
        Self::with_bar(ProgressBar::hidden())
    }

    fn with_bar(bar: ProgressBar) -> Self {
        let progress = Self {
            processed: AtomicU64::new(0),
            success: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            invalid: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            active: AtomicU64::new(0),
            bar,
        };
        progress.render();
        progress
    }

    pub fn job_started(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.render();
    }

    fn job_finished(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::SeqCst);
        self.processed.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.render();
    }

    pub fn record_success(&self) {
        self.job_finished(&self.success);
    }

    pub fn record_failure(&self) {
        self.job_finished(&self.failed);
    }

    pub fn record_invalid(&self) {
        self.job_finished(&self.invalid);
    }

    pub fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::SeqCst);
        self.render();
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            processed: self.processed.load(Ordering::SeqCst),
            success: self.success.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            invalid: self.invalid.load(Ordering::SeqCst),
            retried: self.retried.load(Ordering::SeqCst),
            active: self.active.load(Ordering::SeqCst),
        }
    }

    /// Prints above the bar without tearing it.
    pub fn println(&self, line: impl AsRef<str>) {
        self.bar.println(line);
    }

    pub fn finish(&self) {
        self.bar.finish_with_message(self.snapshot().to_string());
    }

    fn render(&self) {
        self.bar.set_message(self.snapshot().to_string());
    }
}
