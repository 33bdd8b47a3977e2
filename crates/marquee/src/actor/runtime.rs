//! # Actor Loop
//!
//! One [`ActorLoop`] drives one [`Actor`] through fixed-budget frames:
//!
//! 1. drain whatever is in the inbox right now,
//! 2. dispatch it in order, dropping the rest of the batch if the frame has run past the
//!    abort threshold,
//! 3. fire due timers, run the actor's per-frame hook, resume tasks with queued values,
//! 4. sleep off the rest of the minimum frame time (or warn if the frame was slow).
//!
//! A quit sentinel ends the loop at the end of the frame that saw it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::actor::handle::ActorHandle;
use crate::actor::types::{Actor, ActorPhase, ActorPhaseManager};
use crate::config::ActorConfig;
use crate::errors::ActorError;
use crate::messages::Envelope;
use crate::metrics::LoopMetrics;
use crate::timers::TimerSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub min_frame: Duration,
    pub warn_frame: Duration,
    pub abort_frame: Duration,
    pub inbox_capacity: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from(&ActorConfig::default())
    }
}

impl From<&ActorConfig> for LoopSettings {
    fn from(config: &ActorConfig) -> Self {
        Self {
            min_frame: Duration::from_millis(config.min_frame_ms),
            warn_frame: Duration::from_millis(config.warn_frame_ms),
            abort_frame: Duration::from_millis(config.abort_frame_ms),
            inbox_capacity: config.inbox_capacity.max(1),
        }
    }
}

pub struct ActorLoop<A: Actor> {
    actor: A,
    inbox: mpsc::Receiver<Envelope<A::Message>>,
    settings: LoopSettings,
    phase_manager: ActorPhaseManager,
    metrics: LoopMetrics,
}

impl<A: Actor> ActorLoop<A> {
    pub fn new(actor: A, settings: LoopSettings) -> (Self, ActorHandle<A::Message>) {
        let (inbox_tx, inbox) = mpsc::channel(settings.inbox_capacity);
        let phase_manager = ActorPhaseManager::new();
        let handle = ActorHandle::new(actor.name(), inbox_tx, phase_manager.clone());
        let actor_loop = Self {
            actor,
            inbox,
            settings,
            phase_manager,
            metrics: LoopMetrics::default(),
        };
        (actor_loop, handle)
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    pub fn actor_mut(&mut self) -> &mut A {
        &mut self.actor
    }

    /// Runs the actor until it quits or every handle is dropped, then returns it together
    /// with the loop's counters.
    pub async fn run(mut self) -> Result<(A, LoopMetrics), ActorError> {
        let name = self.actor.name().to_string();
        debug!("Initializing actor '{}'", name);

        match catch_unwind(AssertUnwindSafe(|| self.actor.init())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Actor '{}' failed to initialize: {}", name, e);
                self.phase_manager.set_phase(ActorPhase::Terminated).await;
                return Err(ActorError::InitFailed(e.to_string()));
            }
            Err(_) => {
                error!("Actor '{}' panicked during init", name);
                self.phase_manager.set_phase(ActorPhase::Terminated).await;
                return Err(ActorError::InitFailed("panicked".to_string()));
            }
        }

        self.phase_manager.set_phase(ActorPhase::Running).await;
        info!("Actor '{}' running", name);

        loop {
            let draining = self.run_frame().await;
            if draining {
                break;
            }
        }

        self.phase_manager.set_phase(ActorPhase::Draining).await;
        debug!("Actor '{}' draining", name);
        if catch_unwind(AssertUnwindSafe(|| self.actor.shutdown())).is_err() {
            error!("Actor '{}' panicked during shutdown", name);
        }
        self.phase_manager.set_phase(ActorPhase::Terminated).await;

        info!(
            "Actor '{}' terminated after {} frames: {} handled, {} failed, {} shed, {} overruns, peak batch {}",
            name,
            self.metrics.frames,
            self.metrics.messages_handled,
            self.metrics.handler_failures,
            self.metrics.messages_shed,
            self.metrics.overrun_frames,
            self.metrics.peak_batch
        );
        Ok((self.actor, self.metrics))
    }

    /// Runs one frame. Returns whether the loop should stop.
    async fn run_frame(&mut self) -> bool {
        let frame_start = Instant::now();
        let (batch, mut draining) = self.drain_inbox();
        let batch_len = batch.len();
        self.metrics.record_batch(batch_len);

        let mut shedding = false;
        let mut shed = 0u64;
        for envelope in batch {
            let message = match envelope {
                Envelope::Quit => {
                    draining = true;
                    continue;
                }
                Envelope::Message(message) => message,
            };
            if !shedding && frame_start.elapsed() > self.settings.abort_frame {
                shedding = true;
                warn!(
                    "Actor '{}' frame at {:?} of {:?} budget with batch of {}, dropping the rest",
                    self.actor.name(),
                    frame_start.elapsed(),
                    self.settings.abort_frame,
                    batch_len
                );
            }
            if shedding {
                shed += 1;
                continue;
            }
            self.dispatch(message);
        }
        if shed > 0 {
            self.metrics.messages_shed += shed;
            warn!("Actor '{}' shed {} messages", self.actor.name(), shed);
        }

        let now_ms = self.actor.core().now_ms();
        self.metrics.timer_fires += TimerSet::run_once(&mut self.actor, now_ms) as u64;

        match catch_unwind(AssertUnwindSafe(|| self.actor.on_frame(now_ms))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Actor '{}' frame hook failed: {}", self.actor.name(), e),
            Err(_) => error!("Actor '{}' frame hook panicked", self.actor.name()),
        }

        let summary = self.actor.core().tasks.dispatch_pending(now_ms);
        self.metrics.tasks_started += summary.started as u64;
        self.metrics.tasks_completed += summary.completed as u64;
        self.metrics.tasks_failed += summary.failed as u64;

        let elapsed = frame_start.elapsed();
        self.metrics.record_frame(elapsed);
        if elapsed > self.settings.warn_frame {
            self.metrics.overrun_frames += 1;
            warn!(
                "Actor '{}' frame took {:?} (batch of {})",
                self.actor.name(),
                elapsed,
                batch_len
            );
        } else if !draining {
            tokio::time::sleep(self.settings.min_frame.saturating_sub(elapsed)).await;
        }

        draining
    }

    /// Takes everything queued right now, up to one inbox worth. A closed inbox counts as
    /// a quit.
    fn drain_inbox(&mut self) -> (Vec<Envelope<A::Message>>, bool) {
        let mut batch = Vec::new();
        while batch.len() < self.settings.inbox_capacity {
            match self.inbox.try_recv() {
                Ok(envelope) => batch.push(envelope),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!("Actor '{}' inbox disconnected", self.actor.name());
                    return (batch, true);
                }
            }
        }
        (batch, false)
    }

    fn dispatch(&mut self, message: A::Message) {
        match catch_unwind(AssertUnwindSafe(|| self.actor.handle(message))) {
            Ok(Ok(())) => self.metrics.messages_handled += 1,
            Ok(Err(e)) => {
                self.metrics.handler_failures += 1;
                error!("Actor '{}' failed to handle message: {}", self.actor.name(), e);
            }
            Err(_) => {
                self.metrics.handler_failures += 1;
                error!("Actor '{}' panicked handling message", self.actor.name());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::types::ActorCore;

    struct Counter {
        core: ActorCore<Counter>,
        seen: Vec<u32>,
    }

    impl Actor for Counter {
        type Message = u32;
        type Resume = ();

        fn name(&self) -> &str {
            "counter"
        }

        fn core(&mut self) -> &mut ActorCore<Self> {
            &mut self.core
        }

        fn handle(&mut self, message: u32) -> anyhow::Result<()> {
            if message == 0 {
                anyhow::bail!("zero");
            }
            self.seen.push(message);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_before_quit_are_handled() {
        let counter = Counter {
            core: ActorCore::new(),
            seen: Vec::new(),
        };
        let (actor_loop, handle) = ActorLoop::new(counter, LoopSettings::default());

        handle.send(1).await.unwrap();
        handle.send(0).await.unwrap();
        handle.send(2).await.unwrap();
        handle.quit().await.unwrap();

        let (counter, metrics) = actor_loop.run().await.unwrap();
        assert_eq!(counter.seen, vec![1, 2]);
        assert_eq!(metrics.messages_handled, 2);
        assert_eq!(metrics.handler_failures, 1);
        assert_eq!(metrics.frames, 1);
        assert_eq!(handle.phase().await, ActorPhase::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handles_stop_the_loop() {
        let counter = Counter {
            core: ActorCore::new(),
            seen: Vec::new(),
        };
        let (actor_loop, handle) = ActorLoop::new(counter, LoopSettings::default());
        handle.send(5).await.unwrap();
        drop(handle);

        let (counter, _) = actor_loop.run().await.unwrap();
        assert_eq!(counter.seen, vec![5]);
    }

    #[test]
    fn test_settings_from_config() {
        let settings = LoopSettings::default();
        assert_eq!(settings.min_frame, Duration::from_millis(2));
        assert_eq!(settings.warn_frame, Duration::from_millis(1000));
        assert_eq!(settings.abort_frame, Duration::from_millis(30000));
    }
}
