//! Frame codec: [`Message`] to bytes and back.
//!
//! Encoding writes the magic, a length placeholder, the header, then the
//! serialized (and possibly compressed) body, and finally patches the length
//! and compression fields. The compression byte on the wire always states
//! whether the payload bytes are compressed.
//!
//! Every failure leaves the codec as a [`CodecError`] carrying the header
//! that was being processed.

use std::sync::Arc;
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};

use super::frame_buffer::{FrameBuffer, DEFAULT_MAX_FRAME_SIZE};
use super::message::{Body, Message};
use super::session::SessionManager;
use super::wire_format::{
    Header, PayloadKind, COMPRESSION_OFFSET, DEFAULT_MAGIC, LENGTH_FIELD_SIZE,
};
use crate::codec::{
    compress_adaptive, default_compressions, default_serializations, Compression, Selector,
    Serialization, DEFAULT_COMPRESS_THRESHOLD, NONE_ID,
};
use crate::error::{CodecError, CodecErrorKind, RpcError};

/// Codec tunables.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Bytes written before every frame; empty for none.
    pub magic: Vec<u8>,
    /// Payloads must exceed this size before compression is attempted.
    pub compress_threshold: usize,
    /// Largest frame accepted or produced.
    pub max_frame_size: u32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            magic: DEFAULT_MAGIC.to_vec(),
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Binary frame codec with byte-id selected serialization and compression.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    config: CodecConfig,
    serializations: Arc<Selector<dyn Serialization>>,
    compressions: Arc<Selector<dyn Compression>>,
}

impl FrameCodec {
    /// Codec over the process-wide plugin tables.
    pub fn new(config: CodecConfig) -> Self {
        Self::with_selectors(config, default_serializations(), default_compressions())
    }

    pub fn with_selectors(
        config: CodecConfig,
        serializations: Arc<Selector<dyn Serialization>>,
        compressions: Arc<Selector<dyn Compression>>,
    ) -> Self {
        Self {
            config,
            serializations,
            compressions,
        }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    pub fn serializations(&self) -> &Selector<dyn Serialization> {
        &self.serializations
    }

    pub fn compressions(&self) -> &Selector<dyn Compression> {
        &self.compressions
    }

    /// Id of the serialization plugin called `name`.
    pub fn serialization_id(&self, name: &str) -> Option<u8> {
        self.serializations
            .ids()
            .into_iter()
            .find(|id| self.serializations.select(*id).is_some_and(|s| s.name() == name))
    }

    /// Id of the compression plugin called `name`.
    pub fn compression_id(&self, name: &str) -> Option<u8> {
        self.compressions
            .ids()
            .into_iter()
            .find(|id| self.compressions.select(*id).is_some_and(|c| c.name() == name))
    }

    /// Frame splitter matching this codec's magic and size limit.
    pub fn frame_buffer(&self) -> FrameBuffer {
        FrameBuffer::new(&self.config.magic, self.config.max_frame_size)
    }

    /// Encode `message` and append the frame to `buf`.
    ///
    /// On error nothing is appended.
    pub fn encode(&self, message: &Message, buf: &mut BytesMut) -> Result<(), CodecError> {
        let start = buf.len();
        buf.put_slice(&self.config.magic);
        let length_pos = buf.len();
        buf.put_u32(0);

        match self.encode_frame(message, buf, length_pos) {
            Ok(()) => Ok(()),
            Err(e) => {
                buf.truncate(start);
                Err(CodecError::classify("Error occurs while encoding.", e)
                    .with_header(Some(&message.header)))
            }
        }
    }

    /// Encode `message` into a standalone frame.
    pub fn encode_to_bytes(&self, message: &Message) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(256);
        self.encode(message, &mut buf)?;
        Ok(buf.freeze())
    }

    fn encode_frame(
        &self,
        message: &Message,
        buf: &mut BytesMut,
        length_pos: usize,
    ) -> Result<(), RpcError> {
        let header = &message.header;
        let header_pos = buf.len();
        header.encode_into(buf)?;
        // Provisional until the payload says otherwise.
        buf[header_pos + COMPRESSION_OFFSET] = NONE_ID;

        if !message.body.is_empty() {
            let serialization = self.serializations.select(header.serialization).ok_or_else(|| {
                CodecError::serializer(format!(
                    "Error occurs while encoding. unknown serialization type {}!",
                    header.serialization
                ))
            })?;
            let data = serialization.serialize(&message.body)?;

            let mut compression_id = NONE_ID;
            let compressed = if header.compression > NONE_ID {
                match self.compressions.select(header.compression) {
                    Some(c) => {
                        let out = compress_adaptive(&*c, &data, self.config.compress_threshold);
                        if out.is_some() {
                            compression_id = c.type_id();
                        }
                        out
                    }
                    None => {
                        tracing::debug!(
                            "Unknown compression {} for message {}, sending raw",
                            header.compression,
                            header.msg_id
                        );
                        None
                    }
                }
            } else {
                None
            };
            buf.put_slice(compressed.as_deref().unwrap_or(&data));
            buf[header_pos + COMPRESSION_OFFSET] = compression_id;
        }

        let total = buf.len() - length_pos;
        if total > self.config.max_frame_size as usize {
            return Err(CodecError::new(
                CodecErrorKind::Default,
                format!(
                    "frame size {} exceeds maximum {}",
                    total, self.config.max_frame_size
                ),
            )
            .into());
        }
        buf[length_pos..length_pos + LENGTH_FIELD_SIZE]
            .copy_from_slice(&(total as u32).to_be_bytes());
        Ok(())
    }

    /// Decode one frame positioned at the total-length field.
    ///
    /// `sessions` resolves `header.session_id` when the transport keeps
    /// per-connection sessions.
    pub fn decode(
        &self,
        frame: Bytes,
        sessions: Option<&SessionManager>,
    ) -> Result<Message, CodecError> {
        let mut buf = frame;
        let header = Header::decode(&mut buf)
            .map_err(|e| CodecError::classify("Error occurs while decoding.", e.into()))?;

        self.decode_message(header.clone(), buf, sessions)
            .map_err(|e| {
                CodecError::classify("Error occurs while decoding.", e).with_header(Some(&header))
            })
    }

    fn decode_message(
        &self,
        header: Header,
        mut buf: Bytes,
        sessions: Option<&SessionManager>,
    ) -> Result<Message, RpcError> {
        let payload_len = (header.length as usize)
            .checked_sub(LENGTH_FIELD_SIZE + header.header_length as usize)
            .ok_or_else(|| {
                CodecError::header_format(format!(
                    "frame length {} shorter than header length {}",
                    header.length, header.header_length
                ))
            })?;
        if buf.len() < payload_len {
            return Err(RpcError::from(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("truncated frame: need {} payload bytes, have {}", payload_len, buf.len()),
            )));
        }
        let payload = buf.split_to(payload_len);

        let kind = header.msg_type.payload_kind();
        let body = if payload.is_empty() || kind == PayloadKind::None {
            Body::Empty
        } else {
            let serialization = self.serializations.select(header.serialization).ok_or_else(|| {
                CodecError::serializer(format!(
                    "Error occurs while decoding. unknown serialization type {}!",
                    header.serialization
                ))
            })?;
            if header.compression > NONE_ID {
                let compression = self.compressions.select(header.compression).ok_or_else(|| {
                    CodecError::new(
                        CodecErrorKind::Default,
                        format!(
                            "Error occurs while decoding. unknown compression type {}!",
                            header.compression
                        ),
                    )
                })?;
                let data =
                    compression.decompress(&payload, self.config.max_frame_size as usize)?;
                serialization.deserialize(&data, kind)?
            } else {
                serialization.deserialize(&payload, kind)?
            }
        };

        let session = match sessions {
            Some(manager) if header.session_id > 0 => manager.get(header.session_id),
            _ => None,
        };
        let is_request = header.msg_type.is_request();
        let mut message = Message::new(header, body);
        message.session = session;
        if is_request {
            message.receive_time = Some(Instant::now());
        }
        Ok(message)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(CodecConfig::default())
    }
}
