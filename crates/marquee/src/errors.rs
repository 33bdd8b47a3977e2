//! # Error Types
//!
//! Error enums for the framing layer and the scheduler primitives. Each concern gets its
//! own enum so callers can tell a per-frame failure apart from a failure that takes down a
//! whole connection ring.

use std::fmt;
use thiserror::Error;

use crate::tasks::TaskId;

/// Which stage of frame decoding rejected the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// Fewer bytes than the length prefix announced.
    Truncated,
    /// Payload is not valid UTF-8.
    Utf8,
    /// Payload is valid UTF-8 but not valid JSON.
    Json,
    /// Payload is valid JSON but not an object.
    NotAnObject,
}

impl fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeErrorKind::Truncated => write!(f, "truncated"),
            DecodeErrorKind::Utf8 => write!(f, "utf8"),
            DecodeErrorKind::Json => write!(f, "json"),
            DecodeErrorKind::NotAnObject => write!(f, "not-an-object"),
        }
    }
}

/// A single frame could not be turned back into a [`WireFrame`](crate::wire::WireFrame).
///
/// Only the frame is lost; the ring it came from is untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Frame decode error ({kind}): {context}")]
pub struct FrameDecodeError {
    pub kind: DecodeErrorKind,
    /// First 30 raw bytes (utf8 failures) or first 30 decoded characters (json failures).
    pub context: String,
}

#[derive(Error, Debug)]
pub enum WireError {
    #[error("Payload of {len} bytes exceeds maximum frame length {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Payload of {len} bytes is below minimum frame length {min}")]
    PayloadTooSmall { len: usize, min: usize },

    #[error("Length prefix {len} is outside the accepted frame range")]
    InvalidLength { len: usize },

    #[error(transparent)]
    Decode(#[from] FrameDecodeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeframeError {
    /// A pushed chunk is bigger than one maximum-size frame. The chunk is dropped and the
    /// connection keeps going.
    #[error("Chunk of {len} bytes exceeds maximum frame length {max}")]
    ChunkTooLarge { len: usize, max: usize },

    /// Accepting the chunk would overwrite bytes that have not been split yet.
    #[error("Ring full: chunk of {len} bytes, {free} bytes free")]
    RingFull { len: usize, free: usize },

    /// The ring can no longer be trusted. It has already been cleared when this is
    /// returned; the owner should close the connection.
    #[error("Stream corruption: {reason} ({context})")]
    StreamCorruption { reason: String, context: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimerError {
    #[error("Timer name already in use: {0}")]
    NameConflict(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("No live task with id {0}")]
    NotFound(TaskId),
}

#[derive(Error, Debug)]
pub enum OutboundError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("Outbound queue is full")]
    Full,

    #[error("Network handler has stopped")]
    Closed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActorError {
    #[error("Actor inbox closed")]
    ChannelClosed,

    #[error("Actor inbox is full")]
    InboxFull,

    #[error("Actor init failed: {0}")]
    InitFailed(String),
}

/// Errors returned when loading or validating a configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
