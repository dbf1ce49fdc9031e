//! Protocol module - wire format, framing, messages and the frame codec.
//!
//! - Header layout and attribute TLV encoding
//! - Frame buffer for splitting a byte stream into length-prefixed frames
//! - Typed message bodies and the codec that (de)serializes them

mod codec;
mod frame_buffer;
mod message;
mod session;
mod wire_format;

pub use codec::{CodecConfig, FrameCodec};
pub use frame_buffer::{FrameBuffer, DEFAULT_MAX_FRAME_SIZE};
pub use message::{service_key, Body, Invocation, Message, Negotiation, ResponsePayload};
pub use session::{Session, SessionManager};
pub use wire_format::{
    decode_attributes, encode_attributes, tags, AttrValue, Attributes, Header, MsgType,
    PayloadKind, COMPRESSION_OFFSET, DEFAULT_MAGIC, FIXED_HEADER_SIZE, LENGTH_FIELD_SIZE,
    MAX_ATTRIBUTES,
};
