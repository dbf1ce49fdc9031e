//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for splitting the byte stream into frames:
//! - `WaitingForLength`: need the magic bytes plus the 4-byte total length
//! - `WaitingForFrame`: length known, need the rest of the frame
//!
//! Each yielded frame starts at the total-length field (magic stripped), which
//! is what [`FrameCodec::decode`](super::FrameCodec::decode) expects.

use bytes::{Bytes, BytesMut};

use super::wire_format::{FIXED_HEADER_SIZE, LENGTH_FIELD_SIZE};
use crate::error::{CodecError, CodecErrorKind, Result};

/// Default maximum frame size (8 MB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 8 * 1024 * 1024;

/// State machine for frame splitting.
#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForLength,
    WaitingForFrame { length: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    magic: Vec<u8>,
    max_frame_size: u32,
}

impl FrameBuffer {
    /// Create a frame buffer expecting `magic` before every frame.
    ///
    /// Default capacity: 64KB.
    pub fn new(magic: &[u8], max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForLength,
            magic: magic.to_vec(),
            max_frame_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Returns a header-format codec error on bad magic, an impossible length,
    /// or a frame larger than the configured maximum. The stream cannot be
    /// resynchronized after that; the caller should drop the connection.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Bytes>> {
        match self.state {
            State::WaitingForLength => {
                let prefix = self.magic.len() + LENGTH_FIELD_SIZE;
                if self.buffer.len() < prefix {
                    return Ok(None);
                }
                if self.buffer[..self.magic.len()] != self.magic[..] {
                    return Err(CodecError::new(
                        CodecErrorKind::HeaderFormat,
                        format!(
                            "bad magic {:02x?}, expected {:02x?}",
                            &self.buffer[..self.magic.len()],
                            self.magic
                        ),
                    )
                    .into());
                }
                let at = self.magic.len();
                let length = u32::from_be_bytes([
                    self.buffer[at],
                    self.buffer[at + 1],
                    self.buffer[at + 2],
                    self.buffer[at + 3],
                ]);
                if (length as usize) < LENGTH_FIELD_SIZE + FIXED_HEADER_SIZE {
                    return Err(CodecError::header_format(format!(
                        "frame length {} shorter than a header",
                        length
                    ))
                    .into());
                }
                if length > self.max_frame_size {
                    return Err(CodecError::header_format(format!(
                        "frame size {} exceeds maximum {}",
                        length, self.max_frame_size
                    ))
                    .into());
                }

                let _ = self.buffer.split_to(self.magic.len());
                self.state = State::WaitingForFrame {
                    length: length as usize,
                };
                self.try_extract_one()
            }

            State::WaitingForFrame { length } => {
                if self.buffer.len() < length {
                    return Ok(None);
                }
                let frame = self.buffer.split_to(length).freeze();
                self.state = State::WaitingForLength;
                Ok(Some(frame))
            }
        }
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForLength;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForLength => "WaitingForLength",
            State::WaitingForFrame { .. } => "WaitingForFrame",
        }
    }
}
