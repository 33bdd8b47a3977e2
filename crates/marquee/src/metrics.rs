use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Counters kept by an actor loop over its whole life.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopMetrics {
    pub frames: u64,
    pub messages_handled: u64,
    pub handler_failures: u64,
    /// Messages dropped because their frame ran past the abort threshold.
    pub messages_shed: u64,
    /// Frames that ran past the warn threshold.
    pub overrun_frames: u64,
    pub peak_batch: usize,
    pub timer_fires: u64,
    pub tasks_started: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub slowest_frame_ms: u64,
}

impl LoopMetrics {
    pub fn record_batch(&mut self, size: usize) {
        self.peak_batch = self.peak_batch.max(size);
    }

    pub fn record_frame(&mut self, elapsed: Duration) {
        self.frames += 1;
        self.slowest_frame_ms = self.slowest_frame_ms.max(elapsed.as_millis() as u64);
    }
}
