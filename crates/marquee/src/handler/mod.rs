use crate::actor::handle::ActorHandle;
use crate::shutdown::{ShutdownController, ShutdownReceiver};
use anyhow::Result;
use std::future::Future;
use std::pin::Pin;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Handlers registered beside one actor, started together and stopped through one
/// [`ShutdownController`].
pub struct HandlerRegistry<M> {
    handlers: Vec<Box<dyn Handler<M>>>,
}

impl<M> Default for HandlerRegistry<M> {
    fn default() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }
}

impl<M: Send + 'static> HandlerRegistry<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: Handler<M>>(&mut self, handler: H) {
        self.handlers.push(Box::new(handler));
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.iter().map(|h| h.name().to_string()).collect()
    }

    /// Spawns every handler with its own shutdown subscription.
    pub fn start_all(
        self,
        actor_handle: ActorHandle<M>,
        shutdown: &mut ShutdownController,
    ) -> Vec<JoinHandle<()>> {
        self.handlers
            .into_iter()
            .map(|mut handler| {
                let name = handler.name().to_string();
                let task = handler.start(actor_handle.clone(), shutdown.subscribe());
                info!("Started handler '{}'", name);
                tokio::spawn(async move {
                    if let Err(e) = task.await {
                        error!("Handler '{}' stopped with error: {}", name, e);
                    }
                })
            })
            .collect()
    }
}

/// Something that runs beside an actor and feeds it messages: a network listener, a
/// worker pump, a signal watcher.
pub trait Handler<M>: Send + 'static {
    fn name(&self) -> &str;

    /// Returns the handler's main future. It should resolve once `shutdown_receiver`
    /// fires or the actor's inbox closes.
    fn start(
        &mut self,
        actor_handle: ActorHandle<M>,
        shutdown_receiver: ShutdownReceiver,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::types::ActorPhaseManager;
    use crate::messages::Envelope;
    use crate::shutdown::ShutdownType;
    use tokio::sync::mpsc;

    struct Ticker;

    impl Handler<u32> for Ticker {
        fn name(&self) -> &str {
            "ticker"
        }

        fn start(
            &mut self,
            actor_handle: ActorHandle<u32>,
            shutdown_receiver: ShutdownReceiver,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
            Box::pin(async move {
                actor_handle.send(7).await?;
                shutdown_receiver.wait_for_shutdown().await.acknowledge();
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_registry_starts_and_stops_handlers() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = ActorHandle::new("test", tx, ActorPhaseManager::new());

        let mut registry = HandlerRegistry::new();
        registry.register(Ticker);
        assert_eq!(registry.names(), vec!["ticker"]);

        let mut shutdown = ShutdownController::new();
        let tasks = registry.start_all(handle, &mut shutdown);
        assert_eq!(rx.recv().await, Some(Envelope::Message(7)));

        shutdown.signal_shutdown(ShutdownType::Graceful).await;
        for task in tasks {
            task.await.unwrap();
        }
    }
}
