use tokio::time::Instant;

/// Millisecond clock shared by a loop, its timers and its tasks.
///
/// Built on [`tokio::time::Instant`] so paused-time tests drive it deterministically.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Milliseconds since the clock was created.
    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }
}
