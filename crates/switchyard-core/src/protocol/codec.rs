//! Newline framing for protocol messages.
//!
//! Implements a resynchronising reader: a bad line costs exactly that line.

use tracing::{trace, warn};

use super::types::Message;
use crate::error::{Error, Result};

/// Default cap on a single frame (10 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// Serialize a message into a newline-terminated frame.
pub fn encode(message: &Message) -> Result<String> {
    let mut frame = serde_json::to_string(message)?;
    frame.push('\n');
    Ok(frame)
}

/// Parse one line (without its terminator) into a message.
pub fn decode_line(line: &str) -> Result<Message> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(Error::Protocol("empty frame".into()));
    }
    serde_json::from_str(trimmed).map_err(|e| Error::Protocol(e.to_string()))
}

/// Incremental decoder fed with raw chunks from a byte stream.
///
/// Complete lines are decoded as they arrive; a trailing partial line is kept
/// until its newline shows up. A partial line that grows past the frame limit
/// is discarded along with everything up to the next newline.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_bytes: usize,
    discarding: bool,
    dropped: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_bytes: max_frame_bytes.max(1),
            discarding: false,
            dropped: 0,
        }
    }

    /// Feed a chunk and return every message it completed, in stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Message> {
        let mut messages = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                self.discarding = false;
                self.buffer.clear();
                continue;
            }
            if self.buffer.len() + head.len() > self.max_frame_bytes {
                self.reject(&Error::FrameTooLarge {
                    limit: self.max_frame_bytes,
                });
                self.buffer.clear();
                continue;
            }

            self.buffer.extend_from_slice(head);
            let line = std::mem::take(&mut self.buffer);
            if let Some(message) = self.decode_frame(&line) {
                messages.push(message);
            }
        }

        if !rest.is_empty() && !self.discarding {
            if self.buffer.len() + rest.len() > self.max_frame_bytes {
                self.reject(&Error::FrameTooLarge {
                    limit: self.max_frame_bytes,
                });
                self.buffer.clear();
                self.discarding = true;
            } else {
                self.buffer.extend_from_slice(rest);
            }
        }

        messages
    }

    /// Decode whatever is left in the buffer once the stream has ended.
    pub fn finish(&mut self) -> Option<Message> {
        let line = std::mem::take(&mut self.buffer);
        let was_discarding = std::mem::replace(&mut self.discarding, false);
        if was_discarding {
            return None;
        }
        self.decode_frame(&line)
    }

    /// Bytes currently held for an incomplete line.
    pub const fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Number of lines dropped as malformed or oversized.
    pub const fn dropped_frames(&self) -> u64 {
        self.dropped
    }

    fn decode_frame(&mut self, raw: &[u8]) -> Option<Message> {
        let Ok(line) = std::str::from_utf8(raw) else {
            self.reject(&Error::Protocol("frame is not valid UTF-8".into()));
            return None;
        };
        if line.trim().is_empty() {
            return None;
        }
        match decode_line(line) {
            Ok(message) => {
                trace!(kind = message.kind(), "Decoded frame");
                Some(message)
            }
            Err(e) => {
                self.reject(&e);
                None
            }
        }
    }

    fn reject(&mut self, error: &Error) {
        self.dropped += 1;
        warn!(error = %error, dropped = self.dropped, "Dropping malformed frame");
    }
}
