//! # Stream Deframer
//!
//! TCP hands us bytes, not messages. A [`StreamDeframer`] is a fixed-capacity ring owned by
//! whoever reads a connection's socket: chunks are [`push`](StreamDeframer::push)ed as they
//! arrive and [`split`](StreamDeframer::split) hands back every frame that is complete so
//! far, leaving partial frames in the ring until the rest shows up.
//!
//! The ring never grows. A producer that outpaces `split` gets [`DeframeError::RingFull`]
//! instead of silently overwriting unread bytes.

use tracing::{debug, warn};

use crate::errors::DeframeError;
use crate::wire::{FrameLimits, WireFrame, LENGTH_PREFIX};

/// Default ring size per connection.
pub const DEFAULT_RING_CAPACITY: usize = 65536;

/// Default number of bytes a transport reads per call.
pub const DEFAULT_READ_CHUNK: usize = 2048;

const CONTEXT_DUMP_LEN: usize = 30;

#[derive(Debug)]
pub struct StreamDeframer {
    ring: Box<[u8]>,
    write: usize,
    read: usize,
    unconsumed: usize,
    limits: FrameLimits,
    rejected_frames: u64,
}

impl Default for StreamDeframer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDeframer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RING_CAPACITY, FrameLimits::default())
    }

    /// Creates a ring of `capacity` bytes. The capacity is raised if needed so that one
    /// maximum-size frame always fits.
    pub fn with_capacity(capacity: usize, limits: FrameLimits) -> Self {
        let capacity = capacity.max(limits.max_len + LENGTH_PREFIX + 1);
        Self {
            ring: vec![0u8; capacity].into_boxed_slice(),
            write: 0,
            read: 0,
            unconsumed: 0,
            limits,
            rejected_frames: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.len()
    }

    pub fn unconsumed(&self) -> usize {
        self.unconsumed
    }

    pub fn is_empty(&self) -> bool {
        self.unconsumed == 0
    }

    pub fn read_cursor(&self) -> usize {
        self.read
    }

    pub fn write_cursor(&self) -> usize {
        self.write
    }

    pub fn limits(&self) -> &FrameLimits {
        &self.limits
    }

    /// Frames dropped because their payload failed to decode.
    pub fn rejected_frames(&self) -> u64 {
        self.rejected_frames
    }

    /// Bytes that can be pushed before the ring is full. One slot is always kept free so
    /// that equal cursors only ever mean "empty".
    pub fn free(&self) -> usize {
        self.capacity() - 1 - self.unconsumed
    }

    /// Copies `chunk` into the ring at the write cursor. Either the whole chunk is accepted
    /// or nothing is written.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), DeframeError> {
        let len = chunk.len();
        if len > self.limits.max_len {
            warn!(
                "Rejecting chunk of {} bytes (max frame length {})",
                len, self.limits.max_len
            );
            return Err(DeframeError::ChunkTooLarge {
                len,
                max: self.limits.max_len,
            });
        }
        if len > self.free() {
            warn!(
                "Ring full: {} bytes pending, cannot accept chunk of {} bytes",
                self.unconsumed, len
            );
            return Err(DeframeError::RingFull {
                len,
                free: self.free(),
            });
        }

        let capacity = self.capacity();
        let first = len.min(capacity - self.write);
        self.ring[self.write..self.write + first].copy_from_slice(&chunk[..first]);
        self.ring[..len - first].copy_from_slice(&chunk[first..]);

        self.write = (self.write + len) % capacity;
        self.unconsumed += len;
        Ok(())
    }

    /// Returns every complete frame currently in the ring, in arrival order.
    ///
    /// On corruption the frames split before the bad prefix are lost along with the ring;
    /// use [`split_into`](Self::split_into) to keep them.
    pub fn split(&mut self) -> Result<Vec<WireFrame>, DeframeError> {
        let mut frames = Vec::new();
        self.split_into(&mut frames)?;
        Ok(frames)
    }

    /// Appends every complete frame to `out`. Frames that fail to decode are logged and
    /// skipped; an invalid length prefix or inconsistent cursors clear the ring and
    /// return [`DeframeError::StreamCorruption`].
    pub fn split_into(&mut self, out: &mut Vec<WireFrame>) -> Result<(), DeframeError> {
        // A prefix split across two pushes waits for its second byte.
        while self.unconsumed >= LENGTH_PREFIX {
            let len = u16::from_le_bytes([self.byte_at(0), self.byte_at(1)]) as usize;
            if !self.limits.accepts(len) {
                return Err(self.corrupt(format!("invalid length prefix {}", len)));
            }

            let available = self.available()?;
            let total = len + LENGTH_PREFIX;
            if available < total {
                break;
            }

            let raw = self.take(total);
            match WireFrame::decode(&raw) {
                Ok(frame) => out.push(frame),
                Err(e) => {
                    self.rejected_frames += 1;
                    warn!("Dropping undecodable frame of {} bytes: {}", len, e);
                }
            }
        }
        Ok(())
    }

    /// Zeroes the ring and resets both cursors.
    pub fn clear(&mut self) {
        self.ring.fill(0);
        self.write = 0;
        self.read = 0;
        self.unconsumed = 0;
    }

    fn byte_at(&self, offset: usize) -> u8 {
        self.ring[(self.read + offset) % self.capacity()]
    }

    /// Bytes between the read and write cursors, through the wrap point if needed.
    fn available(&mut self) -> Result<usize, DeframeError> {
        let distance = if self.write > self.read {
            self.write - self.read
        } else if self.write < self.read {
            self.capacity() - self.read + self.write
        } else {
            return Err(self.corrupt(format!(
                "cursors equal at {} with {} bytes pending",
                self.read, self.unconsumed
            )));
        };

        if distance != self.unconsumed {
            return Err(self.corrupt(format!(
                "cursor distance {} disagrees with {} pending bytes",
                distance, self.unconsumed
            )));
        }
        Ok(distance)
    }

    fn take(&mut self, total: usize) -> Vec<u8> {
        let capacity = self.capacity();
        let first = total.min(capacity - self.read);
        let rest = total - first;

        let mut raw = Vec::with_capacity(total);
        raw.extend_from_slice(&self.ring[self.read..self.read + first]);
        raw.extend_from_slice(&self.ring[..rest]);
        self.ring[self.read..self.read + first].fill(0);
        self.ring[..rest].fill(0);

        self.read = (self.read + total) % capacity;
        self.unconsumed -= total;
        raw
    }

    fn corrupt(&mut self, reason: String) -> DeframeError {
        let dump: Vec<u8> = (0..CONTEXT_DUMP_LEN.min(self.unconsumed.max(LENGTH_PREFIX)))
            .map(|offset| self.byte_at(offset))
            .collect();
        let context = format!(
            "read={} write={} pending={} bytes={}",
            self.read,
            self.write,
            self.unconsumed,
            dump.escape_ascii()
        );
        warn!("Stream corruption: {} ({})", reason, context);
        self.clear();
        debug!("Ring cleared after corruption");
        DeframeError::StreamCorruption { reason, context }
    }
}
