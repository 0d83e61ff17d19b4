//! # Message Codecs
//!
//! A [`Codec`] turns request messages into bytes and response bytes back into
//! messages. The same trait serves both sides of a call: a client uses a codec whose
//! `Encode` is the request type, a server one whose `Encode` is the response type.
//!
//! * [`ProtoCodec`]: binary protobuf for `prost` generated (or hand derived) types.
//! * [`JsonCodec`]: JSON for types implementing `serde` traits.
//! * [`DynamicCodec`]: binary protobuf or canonical protobuf JSON for
//!   `prost_reflect::DynamicMessage`, driven by runtime descriptors.
use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use std::marker::PhantomData;

mod dynamic;

pub use dynamic::{DynamicCodec, WireFormat};

pub const CODEC_NAME_PROTO: &str = "proto";
pub const CODEC_NAME_JSON: &str = "json";

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("Failed to decode protobuf message: '{0}'")]
    ProtoDecode(#[from] prost::DecodeError),
    #[error("Failed to process JSON message: '{0}'")]
    Json(#[from] serde_json::Error),
    #[error("Message of type '{actual}' does not match the expected type '{expected}'")]
    DescriptorMismatch { expected: String, actual: String },
}

/// Serialization for one direction of a call.
pub trait Codec: Send + Sync + 'static {
    type Encode: Send + 'static;
    type Decode: Send + 'static;

    /// The codec name used in content types (`application/<name>`).
    fn encoding_name(&self) -> &'static str;

    fn encode(&self, item: &Self::Encode) -> Result<Bytes, CodecError>;

    /// Encodes `item` so that equal messages always yield identical bytes.
    /// Used when the bytes end up in a cacheable GET URL.
    fn encode_deterministic(&self, item: &Self::Encode) -> Result<Bytes, CodecError> {
        self.encode(item)
    }

    fn decode(&self, buf: Bytes) -> Result<Self::Decode, CodecError>;
}

/// Binary protobuf codec for `prost` messages.
///
/// `prost` writes fields in tag order, so the output is deterministic as long as
/// map fields use `BTreeMap`.
pub struct ProtoCodec<E, D> {
    _marker: PhantomData<fn(E) -> D>,
}

impl<E, D> ProtoCodec<E, D> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<E, D> Default for ProtoCodec<E, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E, D> Clone for ProtoCodec<E, D> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<E, D> Codec for ProtoCodec<E, D>
where
    E: prost::Message + Send + 'static,
    D: prost::Message + Default + Send + 'static,
{
    type Encode = E;
    type Decode = D;

    fn encoding_name(&self) -> &'static str {
        CODEC_NAME_PROTO
    }

    fn encode(&self, item: &E) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(item.encode_to_vec()))
    }

    fn decode(&self, buf: Bytes) -> Result<D, CodecError> {
        Ok(D::decode(buf)?)
    }
}

/// JSON codec for `serde` types. Unknown fields are ignored when decoding unless the
/// type itself denies them.
pub struct JsonCodec<E, D> {
    _marker: PhantomData<fn(E) -> D>,
}

impl<E, D> JsonCodec<E, D> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<E, D> Default for JsonCodec<E, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E, D> Clone for JsonCodec<E, D> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<E, D> Codec for JsonCodec<E, D>
where
    E: Serialize + Send + 'static,
    D: DeserializeOwned + Send + 'static,
{
    type Encode = E;
    type Decode = D;

    fn encoding_name(&self) -> &'static str {
        CODEC_NAME_JSON
    }

    fn encode(&self, item: &E) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(serde_json::to_vec(item)?))
    }

    fn encode_deterministic(&self, item: &E) -> Result<Bytes, CodecError> {
        // serde_json::Value keeps object keys sorted.
        let value = serde_json::to_value(item)?;
        Ok(Bytes::from(serde_json::to_vec(&value)?))
    }

    fn decode(&self, buf: Bytes) -> Result<D, CodecError> {
        Ok(serde_json::from_slice(&buf)?)
    }
}
