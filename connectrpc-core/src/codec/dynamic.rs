//! # Descriptor Driven Codec
//!
//! Encodes and decodes `DynamicMessage`s, so a caller can talk to any method it has
//! a descriptor for without compile-time knowledge of its messages.
//!
//! ## How it works
//!
//! 1. **Encoder**: checks the message's descriptor against the expected input type,
//!    then writes binary protobuf or canonical protobuf JSON. The deterministic
//!    binary form writes map entries in key order, so a GET URL built from it is
//!    stable.
//! 2. **Decoder**: reads bytes into a `DynamicMessage` of the output type. JSON
//!    input may carry fields the descriptor does not know; they are dropped.
use super::{CODEC_NAME_JSON, CODEC_NAME_PROTO, Codec, CodecError};
use bytes::Bytes;
use prost::{
    Message,
    encoding::{WireType, encode_key, encode_varint},
};
use prost_reflect::{
    DeserializeOptions, DynamicMessage, FieldDescriptor, Kind, MapKey, MessageDescriptor,
    ReflectMessage, SerializeOptions, Value,
};

/// On-the-wire representation used by [`DynamicCodec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    Proto,
    Json,
}

/// A codec for `DynamicMessage`s.
#[derive(Debug, Clone)]
pub struct DynamicCodec {
    /// Schema of the messages this codec encodes.
    encode_desc: MessageDescriptor,
    /// Schema of the messages this codec decodes.
    decode_desc: MessageDescriptor,
    format: WireFormat,
}

impl DynamicCodec {
    /// Creates a new `DynamicCodec`.
    ///
    /// # Arguments
    /// * `encode_desc` - Descriptor of the outgoing message type (the request, on a client).
    /// * `decode_desc` - Descriptor of the incoming message type (the response, on a client).
    /// * `format` - Binary protobuf or JSON.
    pub fn new(
        encode_desc: MessageDescriptor,
        decode_desc: MessageDescriptor,
        format: WireFormat,
    ) -> Self {
        Self {
            encode_desc,
            decode_desc,
            format,
        }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    fn check_descriptor(&self, item: &DynamicMessage) -> Result<(), CodecError> {
        let actual = item.descriptor();
        if actual.full_name() != self.encode_desc.full_name() {
            return Err(CodecError::DescriptorMismatch {
                expected: self.encode_desc.full_name().to_string(),
                actual: actual.full_name().to_string(),
            });
        }
        Ok(())
    }

    fn to_json(&self, item: &DynamicMessage) -> Result<Vec<u8>, CodecError> {
        let mut serializer = serde_json::Serializer::new(Vec::new());
        item.serialize_with_options(&mut serializer, &SerializeOptions::new())?;
        Ok(serializer.into_inner())
    }
}

/// Binary encoding with the entries of every map written in key order, nested
/// messages included. Unknown fields and extensions are not written.
fn encode_sorted(message: &DynamicMessage, buf: &mut Vec<u8>) {
    for (field, value) in message.fields() {
        match (field.kind(), value) {
            (Kind::Message(entry), Value::Map(entries)) => {
                let mut entries: Vec<_> = entries.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                for (key, value) in entries {
                    let mut bytes = Vec::new();
                    encode_field(&entry.map_entry_key_field(), &key_value(key), &mut bytes);
                    encode_field(&entry.map_entry_value_field(), value, &mut bytes);
                    write_length_delimited(field.number(), &bytes, buf);
                }
            }
            _ => encode_field(&field, value, buf),
        }
    }
}

fn encode_field(field: &FieldDescriptor, value: &Value, buf: &mut Vec<u8>) {
    match (field.kind(), value) {
        (Kind::Message(_), Value::Message(nested)) if !field.is_group() => {
            let mut bytes = Vec::new();
            encode_sorted(nested, &mut bytes);
            write_length_delimited(field.number(), &bytes, buf);
        }
        (Kind::Message(_), Value::List(items)) if !field.is_group() => {
            for item in items {
                encode_field(field, item, buf);
            }
        }
        _ => {
            // Scalars, packed lists and groups hold no maps: let prost-reflect write them.
            let mut single = DynamicMessage::new(field.parent_message().clone());
            single.set_field(field, value.clone());
            buf.extend_from_slice(&single.encode_to_vec());
        }
    }
}

fn write_length_delimited(number: u32, bytes: &[u8], buf: &mut Vec<u8>) {
    encode_key(number, WireType::LengthDelimited, buf);
    encode_varint(bytes.len() as u64, buf);
    buf.extend_from_slice(bytes);
}

fn key_value(key: &MapKey) -> Value {
    match key {
        MapKey::Bool(value) => Value::Bool(*value),
        MapKey::I32(value) => Value::I32(*value),
        MapKey::I64(value) => Value::I64(*value),
        MapKey::U32(value) => Value::U32(*value),
        MapKey::U64(value) => Value::U64(*value),
        MapKey::String(value) => Value::String(value.clone()),
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;

    fn encoding_name(&self) -> &'static str {
        match self.format {
            WireFormat::Proto => CODEC_NAME_PROTO,
            WireFormat::Json => CODEC_NAME_JSON,
        }
    }

    fn encode(&self, item: &DynamicMessage) -> Result<Bytes, CodecError> {
        self.check_descriptor(item)?;
        match self.format {
            WireFormat::Proto => Ok(Bytes::from(item.encode_to_vec())),
            WireFormat::Json => Ok(Bytes::from(self.to_json(item)?)),
        }
    }

    fn encode_deterministic(&self, item: &DynamicMessage) -> Result<Bytes, CodecError> {
        match self.format {
            WireFormat::Proto => {
                self.check_descriptor(item)?;
                let mut buf = Vec::new();
                encode_sorted(item, &mut buf);
                Ok(Bytes::from(buf))
            }
            WireFormat::Json => {
                self.check_descriptor(item)?;
                // Round trip through serde_json::Value to sort map keys.
                let value: serde_json::Value = serde_json::from_slice(&self.to_json(item)?)?;
                Ok(Bytes::from(serde_json::to_vec(&value)?))
            }
        }
    }

    fn decode(&self, buf: Bytes) -> Result<DynamicMessage, CodecError> {
        match self.format {
            WireFormat::Proto => Ok(DynamicMessage::decode(self.decode_desc.clone(), buf)?),
            WireFormat::Json => {
                let mut deserializer = serde_json::Deserializer::from_slice(&buf);
                let message = DynamicMessage::deserialize_with_options(
                    self.decode_desc.clone(),
                    &mut deserializer,
                    &DeserializeOptions::new().deny_unknown_fields(false),
                )?;
                deserializer.end()?;
                Ok(message)
            }
        }
    }
}
