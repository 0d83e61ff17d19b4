//! # HTTP Transport
//!
//! Protocol-agnostic request/response types exchanged between the
//! [`ProtocolClient`](crate::ProtocolClient), the interceptor chain and the
//! [`HttpClient`] that moves bytes over any `tonic` compatible service.
//!
//! Interceptors rewrite these values in place: the protocol interceptor turns a
//! plain request into a Connect, gRPC or gRPC-Web one, and turns the raw response
//! back into messages, headers and trailers.
use crate::{ConnectError, MethodSpec};
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use std::time::Duration;

mod body;
mod client;

pub(crate) use body::ChannelBody;
pub use body::FullBody;
pub use client::{HttpClient, HttpStream};

/// Everything about a request except its body.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Uri,
    pub content_type: String,
    /// Name of the codec producing the body (`"proto"`, `"json"`).
    pub encoding: &'static str,
    pub headers: HeaderMap,
    pub spec: MethodSpec,
    pub timeout: Option<Duration>,
}

/// A request whose body is a single, fully buffered message.
#[derive(Debug, Clone)]
pub struct UnaryHttpRequest {
    pub head: HttpRequest,
    pub message: Bytes,
}

/// A fully buffered response, or the reason there is none.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub message: Bytes,
    pub trailers: HeaderMap,
    pub cause: Option<ConnectError>,
}

impl HttpResponse {
    pub fn failed(cause: ConnectError) -> Self {
        Self {
            cause: Some(cause),
            ..Default::default()
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status.map(|status| status.as_u16())
    }
}

/// One event of a streaming response.
#[derive(Debug, Clone)]
pub enum StreamResult<T> {
    Headers(HeaderMap),
    Message(T),
    Complete {
        error: Option<ConnectError>,
        trailers: HeaderMap,
    },
}

impl<T> StreamResult<T> {
    pub fn failed(error: ConnectError) -> Self {
        StreamResult::Complete {
            error: Some(error),
            trailers: HeaderMap::new(),
        }
    }

    /// The error carried by a failed completion.
    pub fn connect_error(&self) -> Option<&ConnectError> {
        match self {
            StreamResult::Complete { error, .. } => error.as_ref(),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StreamResult<U> {
        match self {
            StreamResult::Headers(headers) => StreamResult::Headers(headers),
            StreamResult::Message(message) => StreamResult::Message(f(message)),
            StreamResult::Complete { error, trailers } => StreamResult::Complete { error, trailers },
        }
    }
}
