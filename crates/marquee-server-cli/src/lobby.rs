//! The lobby: the one actor the standalone server runs.
//!
//! Category 1 frames are echoed back with the server's name attached. Category 2 frames are
//! key/value requests (subtype 1 get, subtype 2 put) answered by a worker pool through a
//! resumable task.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use marquee::actor::{Actor, ActorCore};
use marquee::messages::{ConnId, NetEvent, NetOutbound};
use marquee::notify::AsyncNotify;
use marquee::wire::WireFrame;
use marquee_handler_worker::{Worker, WorkerPool};

pub const ECHO: i64 = 1;
pub const STORE: i64 = 2;
pub const STORE_GET: i64 = 1;
pub const STORE_PUT: i64 = 2;

const STATS_INTERVAL_MS: u64 = 10_000;

#[derive(Debug)]
pub enum LobbyMessage {
    Net(NetEvent),
}

impl From<NetEvent> for LobbyMessage {
    fn from(event: NetEvent) -> Self {
        LobbyMessage::Net(event)
    }
}

/// Worker requests raised by tasks, submitted on the next frame.
#[derive(Debug, Clone, Default)]
struct PendingCalls(Arc<Mutex<Vec<AsyncNotify>>>);

impl PendingCalls {
    fn push(&self, call: AsyncNotify) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(call);
    }

    fn take(&self) -> Vec<AsyncNotify> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

pub struct LobbyActor {
    name: String,
    core: ActorCore<Self>,
    outbound: NetOutbound,
    workers: WorkerPool,
    store_alias: String,
    calls: PendingCalls,
    connections: HashSet<ConnId>,
    echoed: u64,
}

impl LobbyActor {
    pub fn new(
        name: impl Into<String>,
        outbound: NetOutbound,
        workers: WorkerPool,
        store_alias: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            core: ActorCore::new(),
            outbound,
            workers,
            store_alias: store_alias.into(),
            calls: PendingCalls::default(),
            connections: HashSet::new(),
            echoed: 0,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn echoed(&self) -> u64 {
        self.echoed
    }

    fn on_net(&mut self, event: NetEvent) {
        match event {
            NetEvent::Connected {
                conn,
                peer,
                outbound,
            } => {
                info!("Connection {} from {} (outbound: {})", conn, peer, outbound);
                self.connections.insert(conn);
            }
            NetEvent::Disconnected { conn, reason } => {
                info!("Connection {} gone: {}", conn, reason);
                self.connections.remove(&conn);
            }
            NetEvent::Frame { conn, frame } => self.on_frame_received(conn, frame),
            NetEvent::StreamCorrupted { conn, error } => {
                warn!("Connection {} sent a corrupt stream: {}", conn, error);
            }
            NetEvent::ConnectFailed { net, addr, reason } => {
                warn!("Net {} could not reach {}: {}", net, addr, reason);
            }
        }
    }

    fn on_frame_received(&mut self, conn: ConnId, frame: WireFrame) {
        match frame.category() {
            Some(ECHO) => {
                let mut echo = frame;
                echo.insert("svr", self.name.as_str());
                if let Err(e) = self.outbound.send_frame(conn, &echo) {
                    warn!("Echo to {} dropped: {}", conn, e);
                } else {
                    self.echoed += 1;
                }
            }
            Some(STORE) => self.start_store_call(conn, frame),
            other => debug!("Ignoring frame of category {:?} from {}", other, conn),
        }
    }

    /// Starts a task that asks the store worker and answers `conn` with the result.
    fn start_store_call(&mut self, conn: ConnId, frame: WireFrame) {
        let subtype = frame.subtype().unwrap_or(STORE_GET);
        let Some(key) = frame.get("k").and_then(Value::as_str).map(str::to_string) else {
            let mut error = WireFrame::with_ids(STORE, subtype);
            error.insert("error", "missing key");
            let _ = self.outbound.send_frame(conn, &error);
            return;
        };
        let (operation, payload) = match subtype {
            STORE_PUT => (
                "put",
                json!({ "k": key, "v": frame.get("v").cloned().unwrap_or(Value::Null) }),
            ),
            _ => ("get", json!({ "k": key })),
        };

        let alias = self.store_alias.clone();
        let calls = self.calls.clone();
        let outbound = self.outbound.clone();
        self.core.tasks.start(move |suspension| async move {
            let id = suspension.own_id().await;
            calls.push(AsyncNotify::request(alias, id, operation, payload));
            let reply = suspension.value().await;

            let mut response = WireFrame::with_ids(STORE, subtype);
            response.insert("k", key);
            if let Some(error) = reply.error_message() {
                response.insert("error", error);
            } else {
                response.insert("v", reply.result.clone().unwrap_or(Value::Null));
            }
            if let Err(e) = outbound.send_frame(conn, &response) {
                warn!("Store reply to {} dropped: {}", conn, e);
            }
        });
    }
}

impl Actor for LobbyActor {
    type Message = LobbyMessage;
    type Resume = AsyncNotify;

    fn name(&self) -> &str {
        &self.name
    }

    fn core(&mut self) -> &mut ActorCore<Self> {
        &mut self.core
    }

    fn init(&mut self) -> anyhow::Result<()> {
        if !self.workers.has_pool(&self.store_alias) {
            anyhow::bail!("no worker pool named '{}'", self.store_alias);
        }
        self.core
            .timers
            .add("stats", STATS_INTERVAL_MS, 0, |lobby: &mut LobbyActor| {
                info!(
                    "Lobby '{}': {} connections, {} echoed, {} store calls in flight",
                    lobby.name,
                    lobby.connections.len(),
                    lobby.echoed,
                    lobby.workers.in_flight()
                );
                Ok(())
            })?;
        Ok(())
    }

    fn handle(&mut self, message: LobbyMessage) -> anyhow::Result<()> {
        match message {
            LobbyMessage::Net(event) => self.on_net(event),
        }
        Ok(())
    }

    fn on_frame(&mut self, _now_ms: u64) -> anyhow::Result<()> {
        for call in self.calls.take() {
            if let Err(e) = self.workers.submit(call.clone()) {
                warn!("Could not submit call {}: {}", call.call_id, e);
                let call_id = call.call_id;
                self.core
                    .tasks
                    .resume(call_id, call.into_reply(Err(e.into())));
            }
        }
        self.workers.pump(&self.core.tasks);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.workers.close_all();
        for conn in self.connections.drain() {
            let _ = self.outbound.close(conn);
        }
    }
}

/// Shared in-memory store. Every worker of a pool talks to the same map.
pub type Store = Arc<Mutex<HashMap<String, Value>>>;

pub struct StoreWorker {
    store: Store,
    open: bool,
}

impl StoreWorker {
    pub fn new(store: Store) -> Self {
        Self { store, open: false }
    }
}

impl Worker for StoreWorker {
    fn open(&mut self) -> anyhow::Result<()> {
        self.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn execute(&mut self, operation: &str, payload: &Value) -> anyhow::Result<Value> {
        let key = payload
            .get("k")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("missing key"))?;
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        match operation {
            "get" => Ok(store.get(key).cloned().unwrap_or(Value::Null)),
            "put" => {
                let value = payload.get("v").cloned().unwrap_or(Value::Null);
                store.insert(key.to_string(), value.clone());
                Ok(value)
            }
            other => anyhow::bail!("unknown operation '{}'", other),
        }
    }

    fn close(&mut self) {
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use marquee::actor::{ActorLoop, LoopSettings};
    use marquee::messages::NetCommand;
    use marquee::wire::FrameLimits;
    use marquee_handler_worker::WorkerSettings;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn lobby() -> (LobbyActor, mpsc::Receiver<NetCommand>) {
        let (tx, rx) = mpsc::channel(16);
        let outbound = NetOutbound::new(1, FrameLimits::default(), tx);
        let store = Store::default();
        let mut workers = WorkerPool::new();
        workers
            .add_pool("store", 2, WorkerSettings::default(), |_| {
                StoreWorker::new(store.clone())
            })
            .unwrap();
        (LobbyActor::new("lobby", outbound, workers, "store"), rx)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<NetCommand>) -> WireFrame {
        match timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(NetCommand::Send { bytes, .. })) => WireFrame::decode(&bytes).unwrap(),
            other => panic!("expected a send, got {:?}", other),
        }
    }

    fn frame(conn: ConnId, frame: WireFrame) -> LobbyMessage {
        NetEvent::Frame { conn, frame }.into()
    }

    #[tokio::test]
    async fn test_echo_and_store_round_trip() {
        let (lobby, mut rx) = lobby();
        let settings = LoopSettings {
            min_frame: Duration::from_millis(1),
            ..LoopSettings::default()
        };
        let (actor_loop, handle) = ActorLoop::new(lobby, settings);
        let running = tokio::spawn(actor_loop.run());
        let conn = ConnId::new(1, 1);

        let mut hello = WireFrame::with_ids(ECHO, 1);
        hello.insert("text", "hi");
        handle.send(frame(conn, hello)).await.unwrap();
        let echo = next_frame(&mut rx).await;
        assert_eq!(echo.get("svr"), Some(&json!("lobby")));
        assert_eq!(echo.get("text"), Some(&json!("hi")));

        let mut put = WireFrame::with_ids(STORE, STORE_PUT);
        put.insert("k", "score");
        put.insert("v", 42);
        handle.send(frame(conn, put)).await.unwrap();
        let stored = next_frame(&mut rx).await;
        assert_eq!(stored.subtype(), Some(STORE_PUT));
        assert_eq!(stored.get("v"), Some(&json!(42)));

        let mut get = WireFrame::with_ids(STORE, STORE_GET);
        get.insert("k", "score");
        handle.send(frame(conn, get)).await.unwrap();
        let fetched = next_frame(&mut rx).await;
        assert_eq!(fetched.get("k"), Some(&json!("score")));
        assert_eq!(fetched.get("v"), Some(&json!(42)));

        handle.send(frame(conn, WireFrame::with_ids(STORE, STORE_GET))).await.unwrap();
        let missing = next_frame(&mut rx).await;
        assert_eq!(missing.get("error"), Some(&json!("missing key")));

        handle.quit().await.unwrap();
        let (lobby, metrics) = running.await.unwrap().unwrap();
        assert_eq!(lobby.echoed(), 1);
        assert_eq!(metrics.tasks_completed, 2);
        assert!(lobby.core.tasks.is_empty());
    }

    #[test]
    fn test_store_worker_operations() {
        let store = Store::default();
        let mut worker = StoreWorker::new(store.clone());
        worker.open().unwrap();

        assert_eq!(
            worker.execute("get", &json!({"k": "a"})).unwrap(),
            Value::Null
        );
        worker.execute("put", &json!({"k": "a", "v": [1, 2]})).unwrap();
        assert_eq!(
            worker.execute("get", &json!({"k": "a"})).unwrap(),
            json!([1, 2])
        );
        assert!(worker.execute("get", &json!({})).is_err());
        assert!(worker.execute("drop", &json!({"k": "a"})).is_err());
        assert_eq!(store.lock().unwrap().len(), 1);
    }
}
