//! # RPC Errors
//!
//! [`ConnectError`] is the single error type surfaced by RPC calls, regardless of the
//! protocol spoken on the wire. It carries a [`Code`], an optional human readable
//! message, self-describing protobuf [`ErrorDetail`]s and the metadata (headers or
//! trailers) that accompanied the failure.
//!
//! gRPC transports details inside the `grpc-status-details-bin` trailer as a
//! `google.rpc.Status` message, modelled here by [`RpcStatus`].
use crate::{BoxError, Code, CodecError, compression::CompressionError, envelope::EnvelopeError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use bytes::Bytes;
use http::HeaderMap;
use prost::Message;
use std::{error::Error, fmt, sync::Arc};

const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

/// A protobuf message attached to an error, identified by its type URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    pub type_url: String,
    pub value: Bytes,
}

impl ErrorDetail {
    pub fn new(type_url: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            type_url: type_url.into(),
            value: value.into(),
        }
    }

    /// Encodes `message` into a detail addressed by `type.googleapis.com/<full name>`.
    pub fn pack<M: prost::Name>(message: &M) -> Self {
        Self {
            type_url: format!("{TYPE_URL_PREFIX}{}", M::full_name()),
            value: Bytes::from(message.encode_to_vec()),
        }
    }

    /// The fully-qualified message name, without any URL prefix.
    pub fn message_name(&self) -> &str {
        self.type_url
            .rsplit_once('/')
            .map_or(self.type_url.as_str(), |(_, name)| name)
    }
}

/// The `google.rpc.Status` message.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RpcStatus {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, repeated, tag = "3")]
    pub details: Vec<prost_types::Any>,
}

/// A failed RPC.
#[derive(Debug, Clone)]
pub struct ConnectError {
    pub code: Code,
    pub message: Option<String>,
    pub details: Vec<ErrorDetail>,
    pub metadata: HeaderMap,
    source: Option<Arc<dyn Error + Send + Sync + 'static>>,
}

impl ConnectError {
    pub fn new(code: Code) -> Self {
        Self {
            code,
            message: None,
            details: Vec::new(),
            metadata: HeaderMap::new(),
            source: None,
        }
    }

    /// Builds an error whose message is the display form of `source`.
    pub fn from_source<E>(code: Code, source: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::new(code)
            .with_message(source.to_string())
            .with_source(source)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_details(mut self, details: Vec<ErrorDetail>) -> Self {
        self.details = details;
        self
    }

    pub fn with_detail(mut self, detail: ErrorDetail) -> Self {
        self.details.push(detail);
        self
    }

    pub fn with_metadata(mut self, metadata: HeaderMap) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    pub(crate) fn from_boxed(code: Code, source: BoxError) -> Self {
        let mut err = Self::new(code).with_message(source.to_string());
        err.source = Some(Arc::from(source));
        err
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Decodes every detail whose type matches `M`.
    ///
    /// Details of other types, or whose payload fails to decode, are skipped.
    pub fn unpack_details<M>(&self) -> Vec<M>
    where
        M: prost::Name + Default,
    {
        let expected = M::full_name();
        self.details
            .iter()
            .filter(|detail| detail.message_name() == expected)
            .filter_map(|detail| M::decode(detail.value.clone()).ok())
            .collect()
    }

    /// Encodes this error as a `google.rpc.Status` message.
    pub fn to_status_proto(&self) -> RpcStatus {
        RpcStatus {
            code: self.code.value(),
            message: self.message.clone().unwrap_or_default(),
            details: self
                .details
                .iter()
                .map(|detail| prost_types::Any {
                    type_url: if detail.type_url.contains('/') {
                        detail.type_url.clone()
                    } else {
                        format!("{TYPE_URL_PREFIX}{}", detail.type_url)
                    },
                    value: detail.value.to_vec(),
                })
                .collect(),
        }
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.code, message),
            None => write!(f, "{}", self.code),
        }
    }
}

impl Error for ConnectError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn Error + 'static))
    }
}

impl From<CodecError> for ConnectError {
    fn from(err: CodecError) -> Self {
        Self::from_source(Code::Internal, err)
    }
}

impl From<CompressionError> for ConnectError {
    fn from(err: CompressionError) -> Self {
        match err {
            CompressionError::TooLarge { .. } => Self::from_source(Code::ResourceExhausted, err),
            err => Self::from_source(Code::Internal, err),
        }
    }
}

impl From<EnvelopeError> for ConnectError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::Compression(err) => err.into(),
            EnvelopeError::TooLarge { .. } => Self::from_source(Code::ResourceExhausted, err),
            err => Self::from_source(Code::Internal, err),
        }
    }
}

/// Decodes the payload of a `grpc-status-details-bin` trailer.
pub fn parse_status_details(bytes: &[u8]) -> Result<Vec<ErrorDetail>, prost::DecodeError> {
    let status = RpcStatus::decode(bytes)?;
    Ok(status
        .details
        .into_iter()
        .map(|any| {
            let value = std::str::from_utf8(&any.value)
                .ok()
                .and_then(|text| decode_base64(text).ok())
                .unwrap_or(any.value);
            ErrorDetail::new(any.type_url, value)
        })
        .collect())
}

/// Decodes standard base64 with or without padding.
pub(crate) fn decode_base64(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD_NO_PAD.decode(text.trim_end_matches('='))
}

pub(crate) fn encode_base64(bytes: &[u8]) -> String {
    STANDARD_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_message() {
        let err = ConnectError::new(Code::NotFound).with_message("no such user");
        assert_eq!(err.to_string(), "not_found: no such user");
        assert_eq!(ConnectError::new(Code::Aborted).to_string(), "aborted");
    }

    #[test]
    fn unpack_details_matches_bare_and_prefixed_type_urls() {
        let duration = prost_types::Duration {
            seconds: 3,
            nanos: 0,
        };
        let bare = ErrorDetail::new("google.protobuf.Duration", duration.encode_to_vec());
        let err = ConnectError::new(Code::Unavailable)
            .with_detail(ErrorDetail::pack(&duration))
            .with_detail(bare)
            .with_detail(ErrorDetail::new("google.protobuf.Empty", Vec::new()))
            .with_detail(ErrorDetail::new("google.protobuf.Duration", vec![0xff]));

        let decoded: Vec<prost_types::Duration> = err.unpack_details();
        assert_eq!(decoded, vec![duration.clone(), duration]);
    }

    #[test]
    fn status_details_accept_base64_text_values() {
        let duration = prost_types::Duration {
            seconds: 1,
            nanos: 5,
        };
        let raw = duration.encode_to_vec();
        let status = RpcStatus {
            code: Code::Internal.value(),
            message: "boom".to_string(),
            details: vec![
                prost_types::Any {
                    type_url: "type.googleapis.com/google.protobuf.Duration".to_string(),
                    value: raw.clone(),
                },
                prost_types::Any {
                    type_url: "type.googleapis.com/google.protobuf.Duration".to_string(),
                    value: encode_base64(&raw).into_bytes(),
                },
            ],
        };

        let details = parse_status_details(&status.encode_to_vec()).unwrap();
        assert_eq!(details.len(), 2);
        assert_eq!(details[0].value.as_ref(), raw.as_slice());
        assert_eq!(details[1].value.as_ref(), raw.as_slice());
    }

    #[test]
    fn status_proto_round_trips_code_and_message() {
        let err = ConnectError::new(Code::PermissionDenied)
            .with_message("nope")
            .with_detail(ErrorDetail::new("google.protobuf.Empty", Vec::new()));
        let status = err.to_status_proto();
        assert_eq!(status.code, 7);
        assert_eq!(status.message, "nope");
        assert_eq!(
            status.details[0].type_url,
            "type.googleapis.com/google.protobuf.Empty"
        );
    }

    #[test]
    fn lenient_base64() {
        assert_eq!(decode_base64("aGk=").unwrap(), b"hi");
        assert_eq!(decode_base64("aGk").unwrap(), b"hi");
    }
}
