use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        OnceLock,
    },
    time::{Duration, Instant},
};

/// Progress counters for a migration or patch.
#[derive(Debug)]
pub struct MigrationStats {
    total_keys: AtomicU64,
    processed_keys: AtomicU64,
    skipped_keys: AtomicU64,
    error_count: AtomicU64,
    highest_height: AtomicU64,
    started: Instant,
    finished: OnceLock<Instant>,
}

impl Default for MigrationStats {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationStats {
    /// Start a new run.
    pub fn new() -> Self {
        Self {
            total_keys: AtomicU64::new(0),
            processed_keys: AtomicU64::new(0),
            skipped_keys: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            highest_height: AtomicU64::new(0),
            started: Instant::now(),
            finished: OnceLock::new(),
        }
    }

    pub fn total_keys(&self) -> u64 {
        self.total_keys.load(Ordering::Relaxed)
    }

    pub fn processed_keys(&self) -> u64 {
        self.processed_keys.load(Ordering::Relaxed)
    }

    pub fn skipped_keys(&self) -> u64 {
        self.skipped_keys.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Highest block height written (`0` if no height-bearing key was written).
    pub fn highest_height(&self) -> u64 {
        self.highest_height.load(Ordering::Relaxed)
    }

    pub(crate) fn set_total(&self, total: u64) {
        self.total_keys.store(total, Ordering::Relaxed);
    }

    pub(crate) fn add_processed(&self, count: u64) {
        self.processed_keys.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_skipped(&self, count: u64) {
        self.skipped_keys.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn observe_height(&self, height: u64) {
        self.highest_height.fetch_max(height, Ordering::Relaxed);
    }

    pub(crate) fn finish(&self) {
        let _ = self.finished.set(Instant::now());
    }

    /// Percentage of keys processed (0 when nothing was counted).
    pub fn progress(&self) -> f64 {
        let total = self.total_keys();
        if total == 0 {
            return 0.0;
        }
        self.processed_keys() as f64 / total as f64 * 100.0
    }

    /// Time from start to finish, or to now while still running.
    pub fn duration(&self) -> Duration {
        match self.finished.get() {
            Some(end) => end.duration_since(self.started),
            None => self.started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress() {
        let stats = MigrationStats::new();
        assert_eq!(stats.progress(), 0.0);
        stats.set_total(200);
        stats.add_processed(50);
        assert_eq!(stats.progress(), 25.0);
    }

    #[test]
    fn test_duration_freezes_on_finish() {
        let stats = MigrationStats::new();
        stats.finish();
        let first = stats.duration();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(stats.duration(), first);
    }
}
