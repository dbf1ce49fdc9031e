//! Payload serialization plugins.
//!
//! Two formats ship with the crate:
//!
//! - [`MsgPack`] - MessagePack via `rmp-serde`, structs as maps (`to_vec_named`)
//! - [`Json`] - JSON via `serde_json`
//!
//! Both are exposed through the object-safe [`Serialization`] trait so the
//! frame codec can pick one by the id carried in each header.
//!
//! # Example
//!
//! ```
//! use joywire::codec::{MsgPack, Serialization};
//! use joywire::protocol::{Body, PayloadKind, ResponsePayload};
//!
//! let body = Body::Response(ResponsePayload::ok(serde_json::json!(42)));
//! let bytes = MsgPack.serialize(&body).unwrap();
//! assert_eq!(MsgPack.deserialize(&bytes, PayloadKind::Response).unwrap(), body);
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::protocol::{Body, PayloadKind};

/// Serialization id of MessagePack.
pub const MSGPACK_ID: u8 = 1;

/// Serialization id of JSON.
pub const JSON_ID: u8 = 2;

/// A payload serializer selectable by byte id.
pub trait Serialization: Send + Sync + 'static {
    /// Id written in the header's serialization byte.
    fn type_id(&self) -> u8;

    /// Name used during negotiation.
    fn name(&self) -> &'static str;

    /// Serialize a body. `Body::Empty` yields no bytes.
    fn serialize(&self, body: &Body) -> Result<Vec<u8>>;

    /// Deserialize bytes into the schema implied by `kind`.
    fn deserialize(&self, bytes: &[u8], kind: PayloadKind) -> Result<Body>;
}

/// A serde data format usable as a [`Serialization`].
pub trait Format: Send + Sync + 'static {
    const ID: u8;
    const NAME: &'static str;

    fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>>;

    fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T>;
}

impl<F: Format> Serialization for F {
    fn type_id(&self) -> u8 {
        F::ID
    }

    fn name(&self) -> &'static str {
        F::NAME
    }

    fn serialize(&self, body: &Body) -> Result<Vec<u8>> {
        match body {
            Body::Empty => Ok(Vec::new()),
            Body::Invocation(v) => F::to_vec(v),
            Body::Response(v) => F::to_vec(v),
            Body::Negotiation(v) => F::to_vec(v),
        }
    }

    fn deserialize(&self, bytes: &[u8], kind: PayloadKind) -> Result<Body> {
        Ok(match kind {
            PayloadKind::None => Body::Empty,
            PayloadKind::Invocation => Body::Invocation(F::from_slice(bytes)?),
            PayloadKind::Response => Body::Response(F::from_slice(bytes)?),
            PayloadKind::Negotiation => Body::Negotiation(F::from_slice(bytes)?),
        })
    }
}

/// MessagePack format.
///
/// Always `to_vec_named`: structs travel as maps so peers can decode by
/// field name.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPack;

impl Format for MsgPack {
    const ID: u8 = MSGPACK_ID;
    const NAME: &'static str = "msgpack";

    #[inline]
    fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    #[inline]
    fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// JSON format.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json;

impl Format for Json {
    const ID: u8 = JSON_ID;
    const NAME: &'static str = "json";

    #[inline]
    fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    #[inline]
    fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
