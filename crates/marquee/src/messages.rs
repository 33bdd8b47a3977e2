//! # Messages
//!
//! Types that flow over the queues between an actor loop and the components around it:
//! the inbox envelope, network events coming in and network commands going out.

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::errors::{DeframeError, OutboundError};
use crate::wire::{FrameLimits, WireFrame};

/// What an actor's inbox carries: a domain message or the quit sentinel.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope<M> {
    Message(M),
    Quit,
}

/// Identifies one connection: the network handler that owns it and a per-handler sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnId {
    pub net: u16,
    pub seq: u64,
}

impl ConnId {
    pub fn new(net: u16, seq: u64) -> Self {
        Self { net, seq }
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.net, self.seq)
    }
}

/// Delivered by a network handler to its actor.
#[derive(Debug, Clone, PartialEq)]
pub enum NetEvent {
    Connected {
        conn: ConnId,
        peer: SocketAddr,
        /// True when the connection was dialled by us.
        outbound: bool,
    },
    Disconnected {
        conn: ConnId,
        reason: String,
    },
    Frame {
        conn: ConnId,
        frame: WireFrame,
    },
    /// The connection's ring was cleared and the connection is being closed.
    StreamCorrupted {
        conn: ConnId,
        error: DeframeError,
    },
    ConnectFailed {
        net: u16,
        addr: String,
        reason: String,
    },
}

impl NetEvent {
    pub fn conn(&self) -> Option<ConnId> {
        match self {
            NetEvent::Connected { conn, .. }
            | NetEvent::Disconnected { conn, .. }
            | NetEvent::Frame { conn, .. }
            | NetEvent::StreamCorrupted { conn, .. } => Some(*conn),
            NetEvent::ConnectFailed { .. } => None,
        }
    }
}

/// Issued by an actor to a network handler.
#[derive(Debug, Clone, PartialEq)]
pub enum NetCommand {
    /// Already framed bytes.
    Send { conn: ConnId, bytes: Bytes },
    Close { conn: ConnId },
    Connect { addr: String },
}

/// The actor's side of a network handler's command queue.
///
/// Never blocks: a full queue is reported to the caller instead of stalling the loop.
#[derive(Debug, Clone)]
pub struct NetOutbound {
    net: u16,
    limits: FrameLimits,
    tx: mpsc::Sender<NetCommand>,
}

impl NetOutbound {
    pub fn new(net: u16, limits: FrameLimits, tx: mpsc::Sender<NetCommand>) -> Self {
        Self { net, limits, tx }
    }

    pub fn net(&self) -> u16 {
        self.net
    }

    pub fn send_frame(&self, conn: ConnId, frame: &WireFrame) -> Result<(), OutboundError> {
        let bytes = frame.encode_with(&self.limits)?;
        self.submit(NetCommand::Send { conn, bytes })
    }

    pub fn send_bytes(&self, conn: ConnId, bytes: Bytes) -> Result<(), OutboundError> {
        self.submit(NetCommand::Send { conn, bytes })
    }

    pub fn close(&self, conn: ConnId) -> Result<(), OutboundError> {
        self.submit(NetCommand::Close { conn })
    }

    pub fn connect(&self, addr: impl Into<String>) -> Result<(), OutboundError> {
        self.submit(NetCommand::Connect { addr: addr.into() })
    }

    fn submit(&self, command: NetCommand) -> Result<(), OutboundError> {
        self.tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(command) => {
                debug!("Outbound queue of net {} full, dropping {:?}", self.net, command);
                OutboundError::Full
            }
            mpsc::error::TrySendError::Closed(_) => OutboundError::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deframer::StreamDeframer;
    use crate::errors::WireError;

    #[tokio::test]
    async fn test_outbound_encodes_and_reports_full_queue() {
        let (tx, mut rx) = mpsc::channel(1);
        let outbound = NetOutbound::new(1, FrameLimits::default(), tx);
        let conn = ConnId::new(1, 7);

        outbound.send_frame(conn, &WireFrame::with_ids(1, 1)).unwrap();
        assert!(matches!(outbound.close(conn), Err(OutboundError::Full)));

        match rx.recv().await.unwrap() {
            NetCommand::Send { conn: to, bytes } => {
                assert_eq!(to, conn);
                assert_eq!(WireFrame::decode(&bytes).unwrap(), WireFrame::with_ids(1, 1));
            }
            other => panic!("unexpected command {:?}", other),
        }

        drop(rx);
        assert!(matches!(outbound.connect("127.0.0.1:1"), Err(OutboundError::Closed)));
    }

    #[tokio::test]
    async fn test_short_frame_never_reaches_the_queue() {
        let (tx, mut rx) = mpsc::channel(4);
        let outbound = NetOutbound::new(1, FrameLimits::default(), tx);
        let conn = ConnId::new(1, 3);

        let err = outbound.send_frame(conn, &WireFrame::new()).unwrap_err();
        assert!(matches!(
            err,
            OutboundError::Wire(WireError::PayloadTooSmall { len: 2, .. })
        ));
        assert!(rx.try_recv().is_err());

        // What does get queued is something a receiving deframer accepts.
        outbound.send_frame(conn, &WireFrame::with_ids(0, 0)).unwrap();
        let Some(NetCommand::Send { bytes, .. }) = rx.recv().await else {
            panic!("expected a send");
        };
        let mut deframer = StreamDeframer::new();
        deframer.push(&bytes).unwrap();
        assert_eq!(deframer.split().unwrap(), vec![WireFrame::with_ids(0, 0)]);
    }

    #[test]
    fn test_conn_id_display() {
        assert_eq!(ConnId::new(2, 15).to_string(), "2:15");
    }
}
