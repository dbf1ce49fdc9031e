//! Codec module - pluggable payload serialization and compression.
//!
//! - [`Serialization`] - body (de)serializers: [`MsgPack`], [`Json`]
//! - [`Compression`] - payload compressors: [`Deflate`], [`Zlib`]
//! - [`Selector`] - byte-id dispatch table used by the frame codec
//!
//! # Example
//!
//! ```
//! use joywire::codec::{default_serializations, MSGPACK_ID};
//!
//! let msgpack = default_serializations().select(MSGPACK_ID).unwrap();
//! assert_eq!(msgpack.name(), "msgpack");
//! ```

mod compression;
mod selector;
mod serialization;

pub use compression::{
    compress_adaptive, Compression, Deflate, Zlib, DEFAULT_COMPRESS_THRESHOLD, DEFLATE_ID,
    NONE_ID, ZLIB_ID,
};
pub use selector::{
    compression_selector, default_compressions, default_serializations, serialization_selector,
    Selector, SELECTOR_SLOTS,
};
pub use serialization::{Format, Json, MsgPack, Serialization, JSON_ID, MSGPACK_ID};
