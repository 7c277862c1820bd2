use std::time::{Duration, Instant};

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Reports block throughput at most once per second.
pub(crate) struct Progress {
    action: &'static str,
    last_report: Instant,
    last_height: i32,
}

impl Progress {
    pub(crate) fn new(action: &'static str, height: i32) -> Self {
        Self {
            action,
            last_report: Instant::now(),
            last_height: height,
        }
    }

    pub(crate) fn on_block(&mut self, height: i32, num_leaves: u64) {
        let elapsed = self.last_report.elapsed();
        if elapsed < REPORT_INTERVAL {
            return;
        }
        let speed = f64::from(height - self.last_height) / elapsed.as_secs_f64();
        tracing::info!(
            "{} #{height}, {num_leaves} leaves, {speed:.1} bps",
            self.action
        );
        self.last_report = Instant::now();
        self.last_height = height;
    }
}
