//! Broadcast-and-acknowledge shutdown for the handlers that run beside an actor loop.

use std::time::Duration;
use tokio::sync::oneshot::{Receiver, Sender};
use tokio::time::timeout;
use tracing::{debug, warn};

/// How long [`ShutdownController::signal_shutdown`] waits for each acknowledgement.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Sent to each subscriber. Drop it, or call [`acknowledge`](Self::acknowledge), once the
/// subscriber has stopped.
#[derive(Debug)]
pub struct ShutdownSignal {
    pub shutdown_type: ShutdownType,
    pub sender: Option<Sender<()>>,
}

impl ShutdownSignal {
    pub fn acknowledge(mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(());
        }
    }

    pub fn is_force(&self) -> bool {
        matches!(self.shutdown_type, ShutdownType::Force)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownType {
    /// Finish in-flight work (flush outbound queues) before stopping.
    Graceful,
    Force,
}

#[derive(Debug, Default)]
pub struct ShutdownController {
    subscribers: Vec<Sender<ShutdownSignal>>,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> ShutdownReceiver {
        let (sender, receiver) = tokio::sync::oneshot::channel();
        self.subscribers.push(sender);
        ShutdownReceiver { receiver }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Signals every subscriber and waits (bounded by [`DEFAULT_SHUTDOWN_TIMEOUT`] each)
    /// for them to acknowledge.
    pub async fn signal_shutdown(self, shutdown_type: ShutdownType) {
        debug!(
            "Signaling {:?} shutdown to {} subscribers",
            shutdown_type,
            self.subscribers.len()
        );
        let mut acks = Vec::new();
        for sender in self.subscribers {
            let (responder, ack) = tokio::sync::oneshot::channel();
            let signal = ShutdownSignal {
                shutdown_type,
                sender: Some(responder),
            };
            if sender.send(signal).is_ok() {
                acks.push(ack);
            } else {
                debug!("Subscriber already gone");
            }
        }

        for ack in acks {
            match timeout(DEFAULT_SHUTDOWN_TIMEOUT, ack).await {
                Ok(_) => {}
                Err(_) => warn!(
                    "Subscriber did not acknowledge shutdown within {:?}",
                    DEFAULT_SHUTDOWN_TIMEOUT
                ),
            }
        }
    }
}

pub struct ShutdownReceiver {
    pub receiver: Receiver<ShutdownSignal>,
}

impl ShutdownReceiver {
    /// Resolves with the signal, or with a graceful signal if the controller was dropped.
    pub async fn wait_for_shutdown(self) -> ShutdownSignal {
        match self.receiver.await {
            Ok(signal) => signal,
            Err(_) => {
                debug!("Shutdown controller dropped, treating as graceful shutdown");
                ShutdownSignal {
                    sender: None,
                    shutdown_type: ShutdownType::Graceful,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_waits_for_acknowledgement() {
        let mut controller = ShutdownController::new();
        let receiver = controller.subscribe();
        let subscriber = tokio::spawn(async move {
            let signal = receiver.wait_for_shutdown().await;
            let force = signal.is_force();
            signal.acknowledge();
            force
        });

        controller.signal_shutdown(ShutdownType::Force).await;
        assert!(subscriber.await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_controller_means_graceful() {
        let mut controller = ShutdownController::new();
        let receiver = controller.subscribe();
        drop(controller);
        let signal = receiver.wait_for_shutdown().await;
        assert_eq!(signal.shutdown_type, ShutdownType::Graceful);
        assert!(signal.sender.is_none());
    }
}
