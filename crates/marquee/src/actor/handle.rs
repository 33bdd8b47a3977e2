//! # Actor Handle
//!
//! The producer side of an actor's inbox. Handles are cheap to clone and can be used from
//! any task or thread; the queue is bounded, so a flooded actor pushes back on its
//! producers instead of growing without limit.

use tokio::sync::mpsc;
use tracing::error;

use crate::actor::types::{ActorPhase, ActorPhaseManager};
use crate::errors::ActorError;
use crate::messages::Envelope;

pub struct ActorHandle<M> {
    name: String,
    inbox_tx: mpsc::Sender<Envelope<M>>,
    phase_manager: ActorPhaseManager,
}

impl<M> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            inbox_tx: self.inbox_tx.clone(),
            phase_manager: self.phase_manager.clone(),
        }
    }
}

impl<M> std::fmt::Debug for ActorHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorHandle")
            .field("name", &self.name)
            .finish()
    }
}

impl<M: Send + 'static> ActorHandle<M> {
    pub fn new(
        name: impl Into<String>,
        inbox_tx: mpsc::Sender<Envelope<M>>,
        phase_manager: ActorPhaseManager,
    ) -> Self {
        Self {
            name: name.into(),
            inbox_tx,
            phase_manager,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues a message, waiting for room in the inbox.
    pub async fn send(&self, message: M) -> Result<(), ActorError> {
        self.inbox_tx
            .send(Envelope::Message(message))
            .await
            .map_err(|_| {
                error!("Actor '{}' inbox closed", self.name);
                ActorError::ChannelClosed
            })
    }

    /// Queues a message without waiting. Used from synchronous contexts such as worker
    /// threads.
    pub fn try_send(&self, message: M) -> Result<(), ActorError> {
        self.inbox_tx
            .try_send(Envelope::Message(message))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ActorError::InboxFull,
                mpsc::error::TrySendError::Closed(_) => ActorError::ChannelClosed,
            })
    }

    /// Queues the quit sentinel. The loop honours it at the end of the frame that sees it.
    pub async fn quit(&self) -> Result<(), ActorError> {
        self.inbox_tx
            .send(Envelope::Quit)
            .await
            .map_err(|_| ActorError::ChannelClosed)
    }

    pub async fn phase(&self) -> ActorPhase {
        self.phase_manager.get_phase().await
    }

    pub async fn wait_for_phase(&self, phase: ActorPhase) {
        self.phase_manager.wait_for_phase(phase).await
    }

    pub fn is_closed(&self) -> bool {
        self.inbox_tx.is_closed()
    }
}
