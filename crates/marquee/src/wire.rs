//! # Wire Format
//!
//! Every message on the wire is a 2-byte little-endian length `N` followed by exactly `N`
//! bytes of UTF-8 JSON text holding a single object:
//!
//! ```text
//! [len: u16 LE][utf8-json: len bytes]
//! ```
//!
//! Accepted lengths are `[min_len, max_len]` (7 and 16384 by default; `{"m":0}` is the
//! shortest useful payload). The same format is used between network handlers and actors
//! and between clients and the server.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::{DecodeErrorKind, FrameDecodeError, WireError};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX: usize = 2;

/// Shortest accepted payload (`{"m":0}`).
pub const MIN_FRAME_LEN: usize = 7;

/// Longest accepted payload (16K).
pub const MAX_FRAME_LEN: usize = 16384;

/// Key holding the message category.
pub const CATEGORY_KEY: &str = "m";

/// Key holding the message subtype within its category.
pub const SUBTYPE_KEY: &str = "n";

/// Number of bytes/characters quoted in decode error reports.
const ERROR_CONTEXT_LEN: usize = 30;

/// Inclusive payload length bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLimits {
    pub min_len: usize,
    pub max_len: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            min_len: MIN_FRAME_LEN,
            max_len: MAX_FRAME_LEN,
        }
    }
}

impl FrameLimits {
    pub fn new(min_len: usize, max_len: usize) -> Self {
        Self { min_len, max_len }
    }

    /// Whether a length prefix may start a frame. Zero is never accepted, whatever the
    /// configured minimum.
    pub fn accepts(&self, len: usize) -> bool {
        len != 0 && len >= self.min_len && len <= self.max_len
    }
}

/// # WireFrame
///
/// One logical message: a JSON object keyed by strings. By convention every frame carries
/// a category (`"m"`) and a subtype (`"n"`), but the codec does not enforce it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WireFrame(Map<String, Value>);

impl WireFrame {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Creates a frame with its category and subtype already set.
    pub fn with_ids(category: impl Into<Value>, subtype: impl Into<Value>) -> Self {
        let mut frame = Self::new();
        frame.set_ids(category, subtype);
        frame
    }

    pub fn set_ids(&mut self, category: impl Into<Value>, subtype: impl Into<Value>) {
        self.0.insert(CATEGORY_KEY.to_string(), category.into());
        self.0.insert(SUBTYPE_KEY.to_string(), subtype.into());
    }

    pub fn category(&self) -> Option<i64> {
        self.0.get(CATEGORY_KEY).and_then(Value::as_i64)
    }

    pub fn subtype(&self) -> Option<i64> {
        self.0.get(SUBTYPE_KEY).and_then(Value::as_i64)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Encodes with the default [`FrameLimits`].
    pub fn encode(&self) -> Result<Bytes, WireError> {
        self.encode_with(&FrameLimits::default())
    }

    /// Serializes to JSON (non-ASCII characters stay literal) and prepends the length.
    ///
    /// Fails only when the payload would not be accepted by a receiver using `limits`.
    pub fn encode_with(&self, limits: &FrameLimits) -> Result<Bytes, WireError> {
        let payload = serde_json::to_vec(&self.0)?;
        let min = limits.min_len.max(1);
        if payload.len() < min {
            return Err(WireError::PayloadTooSmall {
                len: payload.len(),
                min,
            });
        }
        let max = limits.max_len.min(u16::MAX as usize);
        if payload.len() > max {
            return Err(WireError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }

        let mut buffer = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
        buffer.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        buffer.extend_from_slice(&payload);
        Ok(buffer.freeze())
    }

    /// Decodes one length-prefixed frame from the start of `bytes`.
    ///
    /// Bytes after the announced length are ignored. Range checking of the prefix is the
    /// deframer's job; this only reports what is wrong with the payload itself.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameDecodeError> {
        if bytes.len() < LENGTH_PREFIX {
            return Err(FrameDecodeError {
                kind: DecodeErrorKind::Truncated,
                context: quote_bytes(bytes),
            });
        }

        let len = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        let body = bytes
            .get(LENGTH_PREFIX..LENGTH_PREFIX + len)
            .ok_or_else(|| FrameDecodeError {
                kind: DecodeErrorKind::Truncated,
                context: format!(
                    "announced {} bytes, got {}",
                    len,
                    bytes.len() - LENGTH_PREFIX
                ),
            })?;

        let text = std::str::from_utf8(body).map_err(|e| FrameDecodeError {
            kind: DecodeErrorKind::Utf8,
            context: format!("{}: {}", e, quote_bytes(body)),
        })?;

        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => Ok(Self(map)),
            Ok(_) => Err(FrameDecodeError {
                kind: DecodeErrorKind::NotAnObject,
                context: quote_chars(text),
            }),
            Err(e) => Err(FrameDecodeError {
                kind: DecodeErrorKind::Json,
                context: format!("{}: {}", e, quote_chars(text)),
            }),
        }
    }
}

impl From<Map<String, Value>> for WireFrame {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

fn quote_bytes(bytes: &[u8]) -> String {
    let end = bytes.len().min(ERROR_CONTEXT_LEN);
    bytes[..end].escape_ascii().to_string()
}

fn quote_chars(text: &str) -> String {
    text.chars().take(ERROR_CONTEXT_LEN).collect()
}

/// `tokio_util` codec for reading and writing frames straight off a socket.
///
/// Servers ingest through [`StreamDeframer`](crate::deframer::StreamDeframer) instead;
/// this adapter is for clients and tools that are happy with a growable buffer.
#[derive(Debug, Clone, Default)]
pub struct WireCodec {
    limits: FrameLimits,
}

impl WireCodec {
    pub fn new(limits: FrameLimits) -> Self {
        Self { limits }
    }
}

impl Decoder for WireCodec {
    type Item = WireFrame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WireFrame>, WireError> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let len = u16::from_le_bytes([src[0], src[1]]) as usize;
        if !self.limits.accepts(len) {
            return Err(WireError::InvalidLength { len });
        }

        let total = LENGTH_PREFIX + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let raw = src.split_to(total);
        Ok(Some(WireFrame::decode(&raw)?))
    }
}

impl Encoder<WireFrame> for WireCodec {
    type Error = WireError;

    fn encode(&mut self, item: WireFrame, dst: &mut BytesMut) -> Result<(), WireError> {
        let bytes = item.encode_with(&self.limits)?;
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}
