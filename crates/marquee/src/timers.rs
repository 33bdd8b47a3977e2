//! # Timer Set
//!
//! Named recurring or limited-count callbacks, fired by whoever owns the set once per loop
//! iteration through [`TimerSet::run_once`].
//!
//! Callbacks receive the owner (`&mut H`) so they can touch actor state and add or remove
//! timers on the same set. A timer added while a pass is running is parked and only joins
//! the live set at the end of the following pass, so one callback can never trigger another
//! timer within the same tick.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{debug, error};

use crate::errors::TimerError;

pub type TimerCallback<H> = Box<dyn FnMut(&mut H) -> anyhow::Result<()> + Send>;

/// Anything that owns a [`TimerSet`] of itself.
pub trait TimerHost: Sized {
    fn timers(&mut self) -> &mut TimerSet<Self>;
}

struct TimerEntry<H> {
    name: String,
    interval_ms: u64,
    /// `None` while the callback is running.
    callback: Option<TimerCallback<H>>,
    /// Set when the entry joins the live set.
    last_fire_ms: u64,
    max_fires: u32,
    fire_count: u32,
    terminal: bool,
}

impl<H> TimerEntry<H> {
    fn is_due(&self, now_ms: u64) -> bool {
        !self.terminal && now_ms.saturating_sub(self.last_fire_ms) >= self.interval_ms
    }
}

pub struct TimerSet<H> {
    live: Vec<TimerEntry<H>>,
    pending: Vec<TimerEntry<H>>,
    /// Pending entries snapshotted at the start of the current pass.
    arriving: Vec<TimerEntry<H>>,
}

impl<H> Default for TimerSet<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> std::fmt::Debug for TimerSet<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerSet")
            .field("live", &self.live.iter().map(|t| &t.name).collect::<Vec<_>>())
            .field("pending", &self.pending.len())
            .field("arriving", &self.arriving.len())
            .finish()
    }
}

impl<H> TimerSet<H> {
    pub fn new() -> Self {
        Self {
            live: Vec::new(),
            pending: Vec::new(),
            arriving: Vec::new(),
        }
    }

    /// Registers a timer firing every `interval_ms`. `max_fires == 0` means unlimited.
    ///
    /// Fails if the name is already live or waiting to be merged; the existing timer is
    /// left untouched.
    pub fn add<F>(
        &mut self,
        name: impl Into<String>,
        interval_ms: u64,
        max_fires: u32,
        callback: F,
    ) -> Result<(), TimerError>
    where
        F: FnMut(&mut H) -> anyhow::Result<()> + Send + 'static,
    {
        let name = name.into();
        if self.contains(&name) {
            error!("Timer '{}' already exists", name);
            return Err(TimerError::NameConflict(name));
        }

        debug!(
            "Adding timer '{}' every {}ms (max fires: {})",
            name, interval_ms, max_fires
        );
        self.pending.push(TimerEntry {
            name,
            interval_ms,
            callback: Some(Box::new(callback)),
            last_fire_ms: 0,
            max_fires,
            fire_count: 0,
            terminal: false,
        });
        Ok(())
    }

    /// Removes a timer wherever it is. Removing an unknown name does nothing.
    pub fn remove(&mut self, name: &str) {
        self.live.retain(|t| t.name != name);
        self.pending.retain(|t| t.name != name);
        self.arriving.retain(|t| t.name != name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.live
            .iter()
            .chain(self.pending.iter())
            .chain(self.arriving.iter())
            .any(|t| t.name == name)
    }

    /// Whether the timer is live, i.e. eligible to fire on the next pass.
    pub fn is_live(&self, name: &str) -> bool {
        self.live.iter().any(|t| t.name == name)
    }

    pub fn fire_count(&self, name: &str) -> Option<u32> {
        self.live
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.fire_count)
    }

    pub fn len(&self) -> usize {
        self.live.len() + self.pending.len() + self.arriving.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_mut(&mut self, name: &str) -> Option<&mut TimerEntry<H>> {
        self.live.iter_mut().find(|t| t.name == name)
    }

    fn begin_pass(&mut self) -> Vec<String> {
        self.arriving = std::mem::take(&mut self.pending);
        self.live.iter().map(|t| t.name.clone()).collect()
    }

    fn end_pass(&mut self, now_ms: u64) {
        self.live.retain(|t| {
            if t.terminal {
                debug!("Timer '{}' reached {} fires", t.name, t.fire_count);
            }
            !t.terminal
        });
        for mut entry in std::mem::take(&mut self.arriving) {
            entry.last_fire_ms = now_ms;
            self.live.push(entry);
        }
    }
}

impl<H: TimerHost> TimerSet<H> {
    /// Fires every due live timer on `host`, then purges finished timers and merges the
    /// ones added before this pass. Returns how many callbacks ran.
    ///
    /// Callback errors and panics are logged and never stop the pass.
    pub fn run_once(host: &mut H, now_ms: u64) -> usize {
        let names = host.timers().begin_pass();
        let mut fired = 0;

        for name in names {
            let callback = match host.timers().live_mut(&name) {
                Some(entry) if entry.is_due(now_ms) => entry.callback.take(),
                _ => None,
            };
            let Some(mut callback) = callback else {
                continue;
            };

            match catch_unwind(AssertUnwindSafe(|| callback(host))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Timer '{}' callback failed: {}", name, e),
                Err(_) => error!("Timer '{}' callback panicked", name),
            }
            fired += 1;

            // Gone if the callback removed its own timer.
            if let Some(entry) = host.timers().live_mut(&name) {
                entry.callback = Some(callback);
                entry.last_fire_ms = now_ms;
                entry.fire_count += 1;
                if entry.max_fires != 0 && entry.fire_count >= entry.max_fires {
                    entry.terminal = true;
                }
            }
        }

        host.timers().end_pass(now_ms);
        fired
    }
}
