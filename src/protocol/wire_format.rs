//! Wire format encoding and decoding.
//!
//! Frame layout:
//! ```text
//! [magic?][total length: 4][header length: 2]
//! [msgType: 1][msgId: 4][sessionId: 4][serialization: 1][compression: 1][timeout: 4]
//! [attrCount: 1]{ [key: 1][type: 1][value] }*
//! [payload]
//! ```
//!
//! All multi-byte integers are Big Endian. The total length counts from the
//! start of the length field itself; the header length counts from the start
//! of the header-length field.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::CodecError;

/// Default magic bytes preceding every frame.
pub const DEFAULT_MAGIC: [u8; 2] = [0xDA, 0xCC];

/// Size of the total-length field.
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Fixed header bytes (header-length field through attribute count).
pub const FIXED_HEADER_SIZE: usize = 18;

/// Offset of the compression byte from the start of the header-length field.
pub const COMPRESSION_OFFSET: usize = 12;

/// Largest encodable attribute count (signed byte on the wire).
pub const MAX_ATTRIBUTES: usize = 127;

/// Attribute value type tags.
pub mod tags {
    pub const INT: u8 = 1;
    pub const STRING: u8 = 2;
    pub const BYTE: u8 = 3;
    pub const SHORT: u8 = 4;
}

/// Wire message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    BizReq = 1,
    BizResp = 2,
    HbReq = 3,
    HbResp = 4,
    CallbackReq = 5,
    CallbackResp = 6,
    NegotiationReq = 7,
    NegotiationResp = 8,
    SessionbeatReq = 9,
    SessionbeatResp = 10,
    OfflineReq = 11,
    OfflineResp = 12,
}

/// Payload schema implied by a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Carries no payload; trailing bytes are ignored.
    None,
    Invocation,
    Response,
    Negotiation,
}

impl MsgType {
    pub fn from_u8(value: u8) -> Option<Self> {
        use MsgType::*;
        Some(match value {
            1 => BizReq,
            2 => BizResp,
            3 => HbReq,
            4 => HbResp,
            5 => CallbackReq,
            6 => CallbackResp,
            7 => NegotiationReq,
            8 => NegotiationResp,
            9 => SessionbeatReq,
            10 => SessionbeatResp,
            11 => OfflineReq,
            12 => OfflineResp,
            _ => return None,
        })
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Odd codes are requests.
    #[inline]
    pub fn is_request(self) -> bool {
        self.as_u8() % 2 == 1
    }

    /// Response type paired with this request type.
    pub fn response(self) -> Self {
        use MsgType::*;
        match self {
            BizReq | BizResp => BizResp,
            HbReq | HbResp => HbResp,
            CallbackReq | CallbackResp => CallbackResp,
            NegotiationReq | NegotiationResp => NegotiationResp,
            SessionbeatReq | SessionbeatResp => SessionbeatResp,
            OfflineReq | OfflineResp => OfflineResp,
        }
    }

    pub fn payload_kind(self) -> PayloadKind {
        use MsgType::*;
        match self {
            BizReq | CallbackReq => PayloadKind::Invocation,
            BizResp | CallbackResp => PayloadKind::Response,
            NegotiationReq | NegotiationResp => PayloadKind::Negotiation,
            HbReq | HbResp | SessionbeatReq | SessionbeatResp | OfflineReq | OfflineResp => {
                PayloadKind::None
            }
        }
    }
}

/// Typed attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Int(i32),
    Str(String),
    Byte(i8),
    Short(i16),
}

impl AttrValue {
    pub fn tag(&self) -> u8 {
        match self {
            AttrValue::Int(_) => tags::INT,
            AttrValue::Str(_) => tags::STRING,
            AttrValue::Byte(_) => tags::BYTE,
            AttrValue::Short(_) => tags::SHORT,
        }
    }
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        AttrValue::Int(v)
    }
}

impl From<i16> for AttrValue {
    fn from(v: i16) -> Self {
        AttrValue::Short(v)
    }
}

impl From<i8> for AttrValue {
    fn from(v: i8) -> Self {
        AttrValue::Byte(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

/// Header attributes keyed by a single byte.
///
/// Keys the receiver does not understand are kept as-is so they survive a
/// relay.
pub type Attributes = BTreeMap<u8, AttrValue>;

/// Decoded frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub msg_type: MsgType,
    pub msg_id: u32,
    pub session_id: u32,
    pub serialization: u8,
    pub compression: u8,
    /// Request timeout in milliseconds.
    pub timeout: u32,
    pub attributes: Attributes,
    /// Total length read off the wire (0 until decoded).
    pub length: u32,
    /// Header length read off the wire (0 until decoded).
    pub header_length: u16,
}

impl Header {
    /// Create a new header with no attributes.
    pub fn new(msg_type: MsgType, msg_id: u32) -> Self {
        Self {
            msg_type,
            msg_id,
            session_id: 0,
            serialization: 0,
            compression: 0,
            timeout: 0,
            attributes: Attributes::new(),
            length: 0,
            header_length: 0,
        }
    }

    pub fn with_serialization(mut self, id: u8) -> Self {
        self.serialization = id;
        self
    }

    pub fn with_compression(mut self, id: u8) -> Self {
        self.compression = id;
        self
    }

    pub fn with_session(mut self, session_id: u32) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u32) -> Self {
        self.timeout = timeout_ms;
        self
    }

    pub fn with_attribute(mut self, key: u8, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(key, value.into());
        self
    }

    /// Header of the response to this request.
    pub fn response(&self) -> Self {
        Self {
            msg_type: self.msg_type.response(),
            msg_id: self.msg_id,
            session_id: self.session_id,
            serialization: self.serialization,
            compression: self.compression,
            timeout: 0,
            attributes: Attributes::new(),
            length: 0,
            header_length: 0,
        }
    }

    /// Write the header starting at the header-length field.
    ///
    /// The header-length slot is patched with the size actually written; the
    /// compression byte is written as-is and may be patched later by the
    /// caller once the payload has been encoded.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<usize, CodecError> {
        let start = buf.len();
        buf.put_u16(0);
        buf.put_u8(self.msg_type.as_u8());
        buf.put_u32(self.msg_id);
        buf.put_u32(self.session_id);
        buf.put_u8(self.serialization);
        buf.put_u8(self.compression);
        buf.put_u32(self.timeout);
        encode_attributes(&self.attributes, buf)?;

        let written = buf.len() - start;
        let header_length = u16::try_from(written)
            .map_err(|_| CodecError::header_format(format!("header too large: {} bytes", written)))?;
        buf[start..start + 2].copy_from_slice(&header_length.to_be_bytes());
        Ok(written)
    }

    /// Decode the header from a frame positioned at the total-length field.
    ///
    /// Consumes exactly the length field plus `header_length` bytes.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        if buf.remaining() < LENGTH_FIELD_SIZE + FIXED_HEADER_SIZE {
            return Err(CodecError::header_format(format!(
                "frame too short: {} bytes",
                buf.remaining()
            )));
        }
        let available = buf.remaining();
        let length = buf.get_u32();
        let header_length = buf.get_u16();
        if (header_length as usize) < FIXED_HEADER_SIZE
            || buf.remaining() + 2 < header_length as usize
        {
            return Err(CodecError::header_format(format!(
                "invalid header length {}",
                header_length
            )));
        }
        let raw_type = buf.get_u8();
        let msg_type = MsgType::from_u8(raw_type).ok_or_else(|| {
            CodecError::header_format(format!(
                "Error occurs while decoding. unknown message type {}!",
                raw_type
            ))
        })?;
        let msg_id = buf.get_u32();
        let session_id = buf.get_u32();
        let serialization = buf.get_u8();
        let compression = buf.get_u8();
        let timeout = buf.get_u32();
        let attributes = decode_attributes(buf)?;

        // Skip header bytes this version does not understand.
        let consumed = available - buf.remaining() - LENGTH_FIELD_SIZE;
        let declared = header_length as usize;
        if declared < consumed {
            return Err(CodecError::header_format(format!(
                "header length {} shorter than parsed {}",
                declared, consumed
            )));
        }
        need(&*buf, declared - consumed)?;
        buf.advance(declared - consumed);

        Ok(Self {
            msg_type,
            msg_id,
            session_id,
            serialization,
            compression,
            timeout,
            attributes,
            length,
            header_length,
        })
    }
}

/// Encode the attribute block: count, then `key, tag, value` per entry.
pub fn encode_attributes(attributes: &Attributes, buf: &mut BytesMut) -> Result<(), CodecError> {
    if attributes.len() > MAX_ATTRIBUTES {
        return Err(CodecError::header_format(format!(
            "too many attributes: {}",
            attributes.len()
        )));
    }
    buf.put_u8(attributes.len() as u8);
    for (key, value) in attributes {
        buf.put_u8(*key);
        buf.put_u8(value.tag());
        match value {
            AttrValue::Int(v) => buf.put_i32(*v),
            AttrValue::Str(s) => {
                let len = u16::try_from(s.len()).map_err(|_| {
                    CodecError::header_format(format!("attribute {} string too long", key))
                })?;
                buf.put_u16(len);
                buf.put_slice(s.as_bytes());
            }
            AttrValue::Byte(v) => buf.put_i8(*v),
            AttrValue::Short(v) => buf.put_i16(*v),
        }
    }
    Ok(())
}

/// Decode the attribute block. A non-positive count means no attributes.
pub fn decode_attributes(buf: &mut impl Buf) -> Result<Attributes, CodecError> {
    let mut attributes = Attributes::new();
    need(&*buf, 1)?;
    let size = buf.get_i8();
    if size <= 0 {
        return Ok(attributes);
    }
    for _ in 0..size {
        need(&*buf, 2)?;
        let key = buf.get_u8();
        let tag = buf.get_u8();
        let value = match tag {
            tags::INT => {
                need(&*buf, 4)?;
                AttrValue::Int(buf.get_i32())
            }
            tags::STRING => {
                need(&*buf, 2)?;
                let len = buf.get_u16() as usize;
                need(&*buf, len)?;
                let mut raw = vec![0u8; len];
                buf.copy_to_slice(&mut raw);
                let s = String::from_utf8(raw).map_err(|e| {
                    CodecError::header_format(format!("attribute {} is not utf-8: {}", key, e))
                })?;
                AttrValue::Str(s)
            }
            tags::BYTE => {
                need(&*buf, 1)?;
                AttrValue::Byte(buf.get_i8())
            }
            tags::SHORT => {
                need(&*buf, 2)?;
                AttrValue::Short(buf.get_i16())
            }
            other => {
                return Err(CodecError::header_format(format!(
                    "unsupported attribute type {} for key {}",
                    other, key
                )))
            }
        };
        attributes.insert(key, value);
    }
    Ok(attributes)
}

#[inline]
fn need(buf: &impl Buf, n: usize) -> Result<(), CodecError> {
    if buf.remaining() < n {
        return Err(CodecError::header_format(format!(
            "truncated attributes: need {} bytes, have {}",
            n,
            buf.remaining()
        )));
    }
    Ok(())
}
