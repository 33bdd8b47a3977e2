//! # TCP Handler
//!
//! Moves framed messages between TCP peers and one Marquee actor.
//!
//! Every connection gets a reader task that owns the connection's
//! [`StreamDeframer`] and a writer task fed by a bounded queue. The handler's main loop owns
//! the connection table: it accepts, dials, executes [`NetCommand`]s coming from the actor
//! through [`NetOutbound`], and is the only place a connection is removed, which is what
//! guarantees exactly one [`NetEvent::Disconnected`] per connection.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use marquee::actor::ActorHandle;
use marquee::config::MarqueeConfig;
use marquee::deframer::{StreamDeframer, DEFAULT_READ_CHUNK, DEFAULT_RING_CAPACITY};
use marquee::handler::Handler;
use marquee::messages::{ConnId, NetCommand, NetEvent, NetOutbound};
use marquee::shutdown::ShutdownReceiver;
use marquee::wire::FrameLimits;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHandlerConfig {
    /// Stamped into every [`ConnId`] this handler creates.
    pub net: u16,
    /// Address to accept on. Without one the handler only dials out.
    pub listen: Option<String>,
    pub max_connections: Option<usize>,
    /// Capacity of the command queue and of each connection's write queue.
    pub outbound_capacity: usize,
    pub limits: FrameLimits,
    pub ring_capacity: usize,
    pub read_chunk: usize,
}

impl TcpHandlerConfig {
    pub fn new(net: u16, listen: Option<String>) -> Self {
        Self {
            net,
            listen,
            max_connections: None,
            outbound_capacity: 1024,
            limits: FrameLimits::default(),
            ring_capacity: DEFAULT_RING_CAPACITY,
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }

    pub fn from_config(net: u16, config: &MarqueeConfig) -> Self {
        Self {
            net,
            listen: config.tcp.listen.clone(),
            max_connections: config.tcp.max_connections,
            outbound_capacity: config.tcp.outbound_capacity,
            limits: config.wire.limits(),
            ring_capacity: config.wire.ring_capacity,
            read_chunk: config.wire.read_chunk,
        }
    }
}

pub struct TcpHandler {
    config: TcpHandlerConfig,
    listener: Option<TcpListener>,
    command_rx: Option<mpsc::Receiver<NetCommand>>,
}

impl TcpHandler {
    /// Creates the handler and the outbound side the actor uses to drive it.
    pub fn new(config: TcpHandlerConfig) -> (Self, NetOutbound) {
        let (command_tx, command_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let outbound = NetOutbound::new(config.net, config.limits, command_tx);
        let handler = Self {
            config,
            listener: None,
            command_rx: Some(command_rx),
        };
        (handler, outbound)
    }

    /// Binds the listen address ahead of [`Handler::start`], so callers can learn the
    /// actual port when binding to port 0.
    pub async fn bind(&mut self) -> io::Result<SocketAddr> {
        let Some(listen) = self.config.listen.as_deref() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no listen address configured",
            ));
        };
        let listener = TcpListener::bind(listen).await?;
        let addr = listener.local_addr()?;
        info!("TCP handler {} listening on {}", self.config.net, addr);
        self.listener = Some(listener);
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }
}

impl<M> Handler<M> for TcpHandler
where
    M: From<NetEvent> + Send + 'static,
{
    fn name(&self) -> &str {
        "tcp"
    }

    fn start(
        &mut self,
        actor_handle: ActorHandle<M>,
        shutdown_receiver: ShutdownReceiver,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> {
        let config = self.config.clone();
        let listener = self.listener.take();
        let command_rx = self.command_rx.take();

        Box::pin(async move {
            let Some(command_rx) = command_rx else {
                anyhow::bail!("TCP handler {} was already started", config.net);
            };
            let listener = match (listener, config.listen.as_deref()) {
                (Some(listener), _) => Some(listener),
                (None, Some(listen)) => {
                    let listener = TcpListener::bind(listen).await?;
                    info!("TCP handler {} listening on {}", config.net, listen);
                    Some(listener)
                }
                (None, None) => {
                    info!("TCP handler {} running in client-only mode", config.net);
                    None
                }
            };

            let (net_loop, inputs) = NetLoop::new(config, actor_handle);
            net_loop
                .run(inputs, listener, command_rx, shutdown_receiver)
                .await;
            Ok(())
        })
    }
}

struct Connection {
    writer_tx: mpsc::Sender<Bytes>,
    reader: JoinHandle<()>,
}

/// Channels the connection tasks report back on.
struct LoopInputs {
    ended_rx: mpsc::UnboundedReceiver<(ConnId, String)>,
    dialed_rx: mpsc::UnboundedReceiver<(String, io::Result<TcpStream>)>,
}

struct NetLoop<M> {
    config: TcpHandlerConfig,
    actor_handle: ActorHandle<M>,
    connections: HashMap<ConnId, Connection>,
    next_seq: u64,
    ended_tx: mpsc::UnboundedSender<(ConnId, String)>,
    dialed_tx: mpsc::UnboundedSender<(String, io::Result<TcpStream>)>,
}

impl<M> NetLoop<M>
where
    M: From<NetEvent> + Send + 'static,
{
    fn new(config: TcpHandlerConfig, actor_handle: ActorHandle<M>) -> (Self, LoopInputs) {
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let (dialed_tx, dialed_rx) = mpsc::unbounded_channel();
        let net_loop = Self {
            config,
            actor_handle,
            connections: HashMap::new(),
            next_seq: 1,
            ended_tx,
            dialed_tx,
        };
        (net_loop, LoopInputs { ended_rx, dialed_rx })
    }

    async fn run(
        mut self,
        inputs: LoopInputs,
        listener: Option<TcpListener>,
        mut command_rx: mpsc::Receiver<NetCommand>,
        shutdown_receiver: ShutdownReceiver,
    ) {
        let LoopInputs {
            mut ended_rx,
            mut dialed_rx,
        } = inputs;

        let mut shutdown = Box::pin(shutdown_receiver.wait_for_shutdown());
        loop {
            tokio::select! {
                signal = &mut shutdown => {
                    info!("TCP handler {} received shutdown signal", self.config.net);
                    self.close_all();
                    signal.acknowledge();
                    break;
                }
                accepted = accept(listener.as_ref()) => match accepted {
                    Ok((stream, peer)) => self.on_accept(stream, peer).await,
                    Err(e) => error!("TCP accept error: {}", e),
                },
                Some(command) = command_rx.recv() => self.on_command(command).await,
                Some((conn, reason)) = ended_rx.recv() => self.drop_connection(conn, reason).await,
                Some((addr, result)) = dialed_rx.recv() => self.on_dialed(addr, result).await,
            }
        }
    }

    fn at_limit(&self) -> bool {
        self.config
            .max_connections
            .is_some_and(|max| self.connections.len() >= max)
    }

    async fn on_accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.at_limit() {
            warn!(
                "TCP handler {} rejecting {} (limit {} reached)",
                self.config.net,
                peer,
                self.connections.len()
            );
            drop(stream);
            return;
        }
        self.register(stream, peer, false).await;
    }

    async fn on_dialed(&mut self, addr: String, result: io::Result<TcpStream>) {
        let failure = match result {
            Ok(stream) if !self.at_limit() => match stream.peer_addr() {
                Ok(peer) => {
                    self.register(stream, peer, true).await;
                    return;
                }
                Err(e) => e.to_string(),
            },
            Ok(_) => "connection limit reached".to_string(),
            Err(e) => e.to_string(),
        };
        warn!("TCP handler {} failed to connect to {}: {}", self.config.net, addr, failure);
        self.deliver(NetEvent::ConnectFailed {
            net: self.config.net,
            addr,
            reason: failure,
        })
        .await;
    }

    async fn register(&mut self, stream: TcpStream, peer: SocketAddr, outbound: bool) {
        let conn = ConnId::new(self.config.net, self.next_seq);
        self.next_seq += 1;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY on {}: {}", conn, e);
        }
        let (read_half, write_half) = stream.into_split();

        let (writer_tx, writer_rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        tokio::spawn(write_connection(conn, write_half, writer_rx, self.ended_tx.clone()));

        // Connected goes out before the reader can deliver any frame.
        info!("Connection {} established with {} (outbound: {})", conn, peer, outbound);
        self.deliver(NetEvent::Connected {
            conn,
            peer,
            outbound,
        })
        .await;

        let reader = tokio::spawn(read_connection(
            conn,
            read_half,
            self.actor_handle.clone(),
            self.config.clone(),
            self.ended_tx.clone(),
        ));
        self.connections.insert(conn, Connection { writer_tx, reader });
    }

    async fn on_command(&mut self, command: NetCommand) {
        match command {
            NetCommand::Send { conn, bytes } => {
                let Some(connection) = self.connections.get(&conn) else {
                    debug!("Dropping {} bytes for unknown connection {}", bytes.len(), conn);
                    return;
                };
                match connection.writer_tx.try_send(bytes) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("Write queue of {} is full, closing it", conn);
                        self.drop_connection(conn, "write queue full".to_string())
                            .await;
                    }
                    // The writer already reported why it stopped.
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
            NetCommand::Close { conn } => {
                self.drop_connection(conn, "closed by actor".to_string())
                    .await;
            }
            NetCommand::Connect { addr } => {
                debug!("TCP handler {} dialing {}", self.config.net, addr);
                let dialed_tx = self.dialed_tx.clone();
                tokio::spawn(async move {
                    let result = TcpStream::connect(&addr).await;
                    let _ = dialed_tx.send((addr, result));
                });
            }
        }
    }

    /// Removes the connection if it is still registered. Pending writes are flushed by the
    /// writer before it shuts the socket down.
    async fn drop_connection(&mut self, conn: ConnId, reason: String) {
        let Some(connection) = self.connections.remove(&conn) else {
            return;
        };
        connection.reader.abort();
        let _ = connection.reader.await;
        drop(connection.writer_tx);

        info!("Connection {} closed: {}", conn, reason);
        self.deliver(NetEvent::Disconnected { conn, reason }).await;
    }

    fn close_all(&mut self) {
        for (conn, connection) in self.connections.drain() {
            connection.reader.abort();
            drop(connection.writer_tx);
            // The actor may already be gone; do not wait for room in its inbox.
            let event = NetEvent::Disconnected {
                conn,
                reason: "shutdown".to_string(),
            };
            if self.actor_handle.try_send(M::from(event)).is_err() {
                debug!("Could not report shutdown of {}", conn);
            }
        }
    }

    async fn deliver(&self, event: NetEvent) {
        if let Err(e) = self.actor_handle.send(M::from(event)).await {
            debug!("TCP handler {} could not deliver event: {}", self.config.net, e);
        }
    }
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn read_connection<M>(
    conn: ConnId,
    mut read_half: OwnedReadHalf,
    actor_handle: ActorHandle<M>,
    config: TcpHandlerConfig,
    ended_tx: mpsc::UnboundedSender<(ConnId, String)>,
) where
    M: From<NetEvent> + Send + 'static,
{
    let mut deframer = StreamDeframer::with_capacity(config.ring_capacity, config.limits);
    let mut buf = vec![0u8; config.read_chunk.clamp(1, config.limits.max_len)];
    let mut frames = Vec::new();

    let reason = 'read: loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => break "peer closed".to_string(),
            Ok(n) => n,
            Err(e) => break format!("read error: {}", e),
        };
        if let Err(e) = deframer.push(&buf[..n]) {
            break e.to_string();
        }

        let result = deframer.split_into(&mut frames);
        for frame in frames.drain(..) {
            if actor_handle
                .send(M::from(NetEvent::Frame { conn, frame }))
                .await
                .is_err()
            {
                break 'read "actor stopped".to_string();
            }
        }

        if let Err(error) = result {
            let reason = error.to_string();
            let _ = actor_handle
                .send(M::from(NetEvent::StreamCorrupted { conn, error }))
                .await;
            break reason;
        }
    };

    debug!(
        "Reader for {} stopped ({} frames rejected)",
        conn,
        deframer.rejected_frames()
    );
    deframer.clear();
    let _ = ended_tx.send((conn, reason));
}

async fn write_connection(
    conn: ConnId,
    mut write_half: OwnedWriteHalf,
    mut writer_rx: mpsc::Receiver<Bytes>,
    ended_tx: mpsc::UnboundedSender<(ConnId, String)>,
) {
    while let Some(bytes) = writer_rx.recv().await {
        if let Err(e) = write_half.write_all(&bytes).await {
            let _ = ended_tx.send((conn, format!("write error: {}", e)));
            return;
        }
    }
    let _ = write_half.shutdown().await;
}
