//! # Wire Protocols
//!
//! Each supported protocol is implemented as an [`Interceptor`](crate::Interceptor)
//! that runs last in the chain of every call:
//!
//! * [`ConnectInterceptor`]: the Connect protocol, unary (with optional GET) and streaming.
//! * [`GrpcInterceptor`]: gRPC over HTTP/2 with status in trailers.
//! * [`GrpcWebInterceptor`]: gRPC-Web, with status in a trailers frame of the body.
//!
//! The header names and helpers here are shared with the server side.
use http::{HeaderMap, HeaderName, HeaderValue, header::USER_AGENT};
use std::time::Duration;

mod completion;
mod connect;
mod grpc;
mod grpc_web;

pub(crate) use completion::{
    encode_trailers_block, has_status, parse_completion, parse_trailers_block,
    percent_decode_bytes, write_status,
};
pub(crate) use connect::{EndStreamPayload, ErrorPayload, headers_to_metadata};
pub use connect::ConnectInterceptor;
pub use grpc::GrpcInterceptor;
pub use grpc_web::GrpcWebInterceptor;

pub use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE, TE};

pub const CONNECT_CONTENT_ENCODING: HeaderName = HeaderName::from_static("connect-content-encoding");
pub const CONNECT_ACCEPT_ENCODING: HeaderName = HeaderName::from_static("connect-accept-encoding");
pub const CONNECT_PROTOCOL_VERSION: HeaderName = HeaderName::from_static("connect-protocol-version");
pub const CONNECT_TIMEOUT_MS: HeaderName = HeaderName::from_static("connect-timeout-ms");
pub const GRPC_ACCEPT_ENCODING: HeaderName = HeaderName::from_static("grpc-accept-encoding");
pub const GRPC_ENCODING: HeaderName = HeaderName::from_static("grpc-encoding");
pub const GRPC_MESSAGE: HeaderName = HeaderName::from_static("grpc-message");
pub const GRPC_STATUS: HeaderName = HeaderName::from_static("grpc-status");
pub const GRPC_STATUS_DETAILS_BIN: HeaderName = HeaderName::from_static("grpc-status-details-bin");
pub const GRPC_TIMEOUT: HeaderName = HeaderName::from_static("grpc-timeout");
pub const X_USER_AGENT: HeaderName = HeaderName::from_static("x-user-agent");

pub const CONNECT_PROTOCOL_VERSION_VALUE: &str = "1";

/// Prefix of unary Connect response headers that are really trailers.
pub(crate) const CONNECT_TRAILER_PREFIX: &str = "trailer-";

/// Envelope flag of the Connect end-of-stream message.
pub(crate) const CONNECT_END_STREAM_FLAG: u8 = 0b0000_0010;

/// Envelope flag of the gRPC-Web trailers frame.
pub(crate) const GRPC_WEB_TRAILERS_FLAG: u8 = 0b1000_0000;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Sets `name` to `value` unless the caller already did.
pub(crate) fn set_default(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if headers.contains_key(&name) {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

pub(crate) fn insert(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

pub(crate) fn connect_user_agent(headers: &mut HeaderMap) {
    set_default(headers, USER_AGENT, &format!("connectrpc-rust/{VERSION}"));
}

pub(crate) fn grpc_user_agent(headers: &mut HeaderMap) {
    set_default(headers, USER_AGENT, &format!("grpc-rust-connect/{VERSION}"));
}

pub(crate) fn grpc_web_user_agent(headers: &mut HeaderMap) {
    set_default(headers, X_USER_AGENT, &format!("grpc-web-rust-connect/{VERSION}"));
}

/// The value of a header as text, if present and valid.
pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Formats a `grpc-timeout` value: at most eight digits followed by a unit.
pub(crate) fn encode_grpc_timeout(timeout: Duration) -> String {
    const MAX: u128 = 99_999_999;
    let millis = timeout.as_millis();
    if millis <= MAX {
        return format!("{millis}m");
    }
    let seconds = timeout.as_secs() as u128;
    if seconds <= MAX {
        return format!("{seconds}S");
    }
    if seconds / 60 <= MAX {
        return format!("{}M", seconds / 60);
    }
    format!("{}H", (seconds / 3600).min(MAX))
}

/// Parses a `grpc-timeout` value.
pub(crate) fn decode_grpc_timeout(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (amount, unit) = value.split_at(value.len() - 1);
    let amount: u64 = amount.parse().ok()?;
    match unit {
        "H" => Some(Duration::from_secs(amount * 3600)),
        "M" => Some(Duration::from_secs(amount * 60)),
        "S" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_millis(amount)),
        "u" => Some(Duration::from_micros(amount)),
        "n" => Some(Duration::from_nanos(amount)),
        _ => None,
    }
}
