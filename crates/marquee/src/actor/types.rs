//! # Actor Types
//!
//! The [`Actor`] capability set, the per-actor scheduling state every actor carries
//! ([`ActorCore`]), and the phase tracking shared between a loop and its handles.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock};

use crate::clock::Clock;
use crate::tasks::TaskTable;
use crate::timers::{TimerHost, TimerSet};

/// # Actor
///
/// Logic driven by an [`ActorLoop`](super::ActorLoop). Every hook runs on the loop's task,
/// one at a time, and must not block: slow work goes to a worker and is awaited through a
/// resumable task.
///
/// Hooks that return errors (or panic) are logged by the loop and never stop it.
pub trait Actor: Send + Sized + 'static {
    /// Domain messages delivered through the actor's inbox.
    type Message: Send + 'static;

    /// Values delivered to the actor's resumable tasks.
    type Resume: Send + 'static;

    fn name(&self) -> &str;

    fn core(&mut self) -> &mut ActorCore<Self>;

    /// Runs once before the first frame. Failing here aborts the loop.
    fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn handle(&mut self, message: Self::Message) -> anyhow::Result<()>;

    /// Runs every frame after timers and before task dispatch. Worker pools pump their
    /// replies from here.
    fn on_frame(&mut self, _now_ms: u64) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs once after the last frame.
    fn shutdown(&mut self) {}
}

impl<A: Actor> TimerHost for A {
    fn timers(&mut self) -> &mut TimerSet<Self> {
        &mut self.core().timers
    }
}

/// Timers, resumable tasks and the clock they share. Owned by the actor so that timer
/// callbacks and handlers can reach all of them through `&mut self`.
pub struct ActorCore<A: Actor> {
    pub timers: TimerSet<A>,
    pub tasks: TaskTable<A::Resume>,
    clock: Clock,
}

impl<A: Actor> Default for ActorCore<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Actor> std::fmt::Debug for ActorCore<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorCore")
            .field("timers", &self.timers)
            .field("tasks", &self.tasks)
            .finish()
    }
}

impl<A: Actor> ActorCore<A> {
    pub fn new() -> Self {
        Self {
            timers: TimerSet::new(),
            tasks: TaskTable::new(),
            clock: Clock::new(),
        }
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum ActorPhase {
    #[default]
    Initializing,
    Running,
    /// The quit sentinel was seen; the current frame is the last.
    Draining,
    Terminated,
}

impl std::fmt::Display for ActorPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorPhase::Initializing => write!(f, "Initializing"),
            ActorPhase::Running => write!(f, "Running"),
            ActorPhase::Draining => write!(f, "Draining"),
            ActorPhase::Terminated => write!(f, "Terminated"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActorPhaseManager {
    current_phase: Arc<RwLock<ActorPhase>>,
    notify: Arc<Notify>,
}

impl ActorPhaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_phase(&self, phase: ActorPhase) {
        let mut current_phase = self.current_phase.write().await;
        *current_phase = phase;
        self.notify.notify_waiters();
    }

    pub async fn get_phase(&self) -> ActorPhase {
        *self.current_phase.read().await
    }

    pub async fn is_phase(&self, phase: ActorPhase) -> bool {
        *self.current_phase.read().await == phase
    }

    /// Waits until the phase is `phase`, or has moved past it.
    pub async fn wait_for_phase(&self, phase: ActorPhase) {
        loop {
            let notified = self.notify.notified();
            if *self.current_phase.read().await >= phase {
                break;
            }
            notified.await;
        }
    }
}
