//! # Connect Protocol
//!
//! * **Unary**: the body is the bare message. Errors come back as a JSON body with
//!   a non-200 status; trailers are sent as `trailer-` prefixed headers. Side-effect
//!   free methods may be called with GET, the message being carried in the query.
//! * **Streaming**: messages are enveloped. The last envelope, flagged
//!   end-of-stream, holds a JSON object with the error (if any) and the trailers.
use super::{
    ACCEPT_ENCODING, CONNECT_ACCEPT_ENCODING, CONNECT_CONTENT_ENCODING, CONNECT_END_STREAM_FLAG,
    CONNECT_PROTOCOL_VERSION, CONNECT_PROTOCOL_VERSION_VALUE, CONNECT_TIMEOUT_MS,
    CONNECT_TRAILER_PREFIX, CONTENT_ENCODING, connect_user_agent, header_str, insert,
};
use crate::{
    Code, ConnectError, GetConfiguration, Idempotency, Interceptor, ProtocolClientConfig,
    StreamType,
    compression::{CompressionPool, RequestCompression, find_pool, pool_names},
    envelope,
    error::{ErrorDetail, decode_base64, encode_base64},
    http::{HttpRequest, HttpResponse, StreamResult, UnaryHttpRequest},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, uri::PathAndQuery};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, warn};

/// JSON body of a Connect error.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct ErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<ErrorDetailPayload>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ErrorDetailPayload {
    #[serde(rename = "type", default)]
    pub type_url: String,
    #[serde(default)]
    pub value: String,
}

/// JSON body of the Connect end-of-stream message.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct EndStreamPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, Vec<String>>>,
}

impl ErrorPayload {
    pub(crate) fn from_error(error: &ConnectError) -> Self {
        Self {
            code: Some(error.code.name().to_string()),
            message: error.message.clone(),
            details: error
                .details
                .iter()
                .map(|detail| ErrorDetailPayload {
                    type_url: detail.message_name().to_string(),
                    value: encode_base64(&detail.value),
                })
                .collect(),
        }
    }

    /// Converts the payload, using `fallback` when the code is absent or unknown.
    pub(crate) fn into_error(self, fallback: Code, metadata: HeaderMap) -> ConnectError {
        let code = Code::from_name_or(self.code.as_deref(), fallback);
        let details = self
            .details
            .into_iter()
            .filter_map(|detail| match decode_base64(&detail.value) {
                Ok(value) => Some(ErrorDetail::new(detail.type_url, value)),
                Err(err) => {
                    warn!(detail = %detail.type_url, error = %err, "dropping undecodable error detail");
                    None
                }
            })
            .collect();

        let mut error = ConnectError::new(code)
            .with_details(details)
            .with_metadata(metadata);
        error.message = self.message.filter(|message| !message.is_empty());
        error
    }
}

pub(crate) fn headers_to_metadata(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut metadata: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            metadata
                .entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    metadata
}

fn metadata_to_headers(metadata: BTreeMap<String, Vec<String>>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, values) in metadata {
        let Ok(name) = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.append(name.clone(), value);
            }
        }
    }
    headers
}

/// Splits unary response headers into headers and `trailer-` prefixed trailers.
fn split_trailers(headers: HeaderMap) -> (HeaderMap, HeaderMap) {
    let mut plain = HeaderMap::new();
    let mut trailers = HeaderMap::new();
    let mut current: Option<HeaderName> = None;
    for (name, value) in headers {
        if let Some(name) = name {
            current = Some(name);
        }
        let Some(name) = current.as_ref() else {
            continue;
        };
        match name.as_str().strip_prefix(CONNECT_TRAILER_PREFIX) {
            Some(stripped) => {
                if let Ok(trailer) = HeaderName::from_bytes(stripped.as_bytes()) {
                    trailers.append(trailer, value);
                }
            }
            None => {
                plain.append(name.clone(), value);
            }
        }
    }
    (plain, trailers)
}

/// Client side of the Connect protocol.
pub struct ConnectInterceptor {
    request_compression: Option<RequestCompression>,
    compression_pools: Vec<Arc<dyn CompressionPool>>,
    get_configuration: GetConfiguration,
    response_pool: Option<Arc<dyn CompressionPool>>,
    end_stream_received: bool,
}

impl ConnectInterceptor {
    pub fn new(config: &ProtocolClientConfig) -> Self {
        Self {
            request_compression: config.request_compression().cloned(),
            compression_pools: config.compression_pools().to_vec(),
            get_configuration: config.get_configuration(),
            response_pool: None,
            end_stream_received: false,
        }
    }

    fn common_headers(&self, head: &mut HttpRequest, accept_header: HeaderName) {
        let headers = &mut head.headers;
        insert(headers, CONNECT_PROTOCOL_VERSION, CONNECT_PROTOCOL_VERSION_VALUE);
        if !self.compression_pools.is_empty() {
            insert(headers, accept_header, &pool_names(&self.compression_pools));
        }
        connect_user_agent(headers);
        if let Some(timeout) = head.timeout {
            insert(headers, CONNECT_TIMEOUT_MS, &timeout.as_millis().to_string());
        }
    }

    fn use_get(&self, head: &HttpRequest, len: usize) -> bool {
        head.spec.stream_type == StreamType::Unary
            && head.spec.idempotency == Idempotency::NoSideEffects
            && self.get_configuration.use_get(len)
    }

    fn parse_end_stream(&self, payload: &[u8]) -> StreamResult<Bytes> {
        let end_stream: EndStreamPayload = match serde_json::from_slice(payload) {
            Ok(end_stream) => end_stream,
            Err(err) => {
                return StreamResult::failed(ConnectError::from_source(Code::Unknown, err));
            }
        };
        let trailers = end_stream
            .metadata
            .map(metadata_to_headers)
            .unwrap_or_default();
        let error = end_stream
            .error
            .map(|payload| payload.into_error(Code::Unknown, trailers.clone()));
        StreamResult::Complete { error, trailers }
    }

    fn decompress_unary(
        &self,
        headers: &HeaderMap,
        message: Bytes,
    ) -> Result<Bytes, ConnectError> {
        match header_str(headers, &CONTENT_ENCODING) {
            None | Some("identity") | Some("") => Ok(message),
            Some(name) => {
                let pool = find_pool(&self.compression_pools, name).ok_or_else(|| {
                    ConnectError::new(Code::Internal)
                        .with_message(format!("unknown compression '{name}'"))
                })?;
                if message.is_empty() {
                    return Ok(message);
                }
                pool.decompress(&message, None)
                    .map_err(|err| ConnectError::from_source(Code::Internal, err))
            }
        }
    }
}

fn get_request(
    mut request: UnaryHttpRequest,
    body: Bytes,
    compression: Option<&str>,
) -> Result<UnaryHttpRequest, ConnectError> {
    let mut query = vec![
        ("base64", "1".to_string()),
        ("connect", "v1".to_string()),
        ("encoding", request.head.encoding.to_string()),
        ("message", URL_SAFE_NO_PAD.encode(&body)),
    ];
    if let Some(compression) = compression {
        query.push(("compression", compression.to_string()));
    }
    query.sort_by(|a, b| a.0.cmp(b.0));
    let query = query
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&");

    let mut parts = request.head.url.into_parts();
    let path = parts
        .path_and_query
        .as_ref()
        .map_or("/", |path_and_query| path_and_query.path())
        .to_string();
    parts.path_and_query = Some(
        PathAndQuery::try_from(format!("{path}?{query}"))
            .map_err(|err| ConnectError::from_source(Code::Internal, err))?,
    );
    request.head.url =
        Uri::from_parts(parts).map_err(|err| ConnectError::from_source(Code::Internal, err))?;
    request.head.method = Method::GET;
    request.head.headers.remove(CONNECT_PROTOCOL_VERSION);
    request.head.headers.remove(CONTENT_ENCODING);
    request.message = Bytes::new();
    Ok(request)
}

impl Interceptor for ConnectInterceptor {
    fn unary_request(
        &mut self,
        mut request: UnaryHttpRequest,
    ) -> Result<UnaryHttpRequest, ConnectError> {
        request.head.content_type = format!("application/{}", request.head.encoding);
        self.common_headers(&mut request.head, ACCEPT_ENCODING);

        let mut compression = None;
        let mut body = std::mem::take(&mut request.message);
        if let Some(rc) = &self.request_compression {
            if rc.should_compress(body.len()) {
                body = rc
                    .pool
                    .compress(&body)
                    .map_err(|err| ConnectError::from_source(Code::Internal, err))?;
                insert(&mut request.head.headers, CONTENT_ENCODING, rc.pool.name());
                compression = Some(rc.pool.name());
            }
        }

        if self.use_get(&request.head, body.len()) {
            debug!(path = %request.head.spec.path, "sending connect unary call with GET");
            return get_request(request, body, compression);
        }
        request.message = body;
        Ok(request)
    }

    fn unary_response(&mut self, response: HttpResponse) -> HttpResponse {
        if response.cause.is_some() {
            return response;
        }
        let HttpResponse {
            status,
            headers,
            message,
            trailers: http_trailers,
            ..
        } = response;
        let (headers, mut trailers) = split_trailers(headers);
        trailers.extend(http_trailers);

        let message = match self.decompress_unary(&headers, message) {
            Ok(message) => message,
            Err(err) => {
                return HttpResponse {
                    status,
                    headers,
                    trailers,
                    cause: Some(err),
                    ..Default::default()
                };
            }
        };

        if status == Some(StatusCode::OK) {
            return HttpResponse {
                status,
                headers,
                message,
                trailers,
                cause: None,
            };
        }

        let http_code = Code::from_http_status(status.map(|status| status.as_u16()));
        let mut metadata = headers.clone();
        metadata.extend(trailers.clone());
        let cause = match serde_json::from_slice::<ErrorPayload>(&message) {
            Ok(payload) => payload.into_error(http_code, metadata),
            Err(err) => {
                let text = String::from_utf8_lossy(&message).into_owned();
                let text = if text.is_empty() {
                    format!(
                        "unexpected HTTP status: {}",
                        status.map_or(0, |status| status.as_u16())
                    )
                } else {
                    text
                };
                ConnectError::new(http_code)
                    .with_message(text)
                    .with_metadata(metadata)
                    .with_source(err)
            }
        };

        HttpResponse {
            status,
            headers,
            trailers,
            cause: Some(cause),
            ..Default::default()
        }
    }

    fn stream_request(&mut self, mut request: HttpRequest) -> HttpRequest {
        request.content_type = format!("application/connect+{}", request.encoding);
        self.common_headers(&mut request, CONNECT_ACCEPT_ENCODING);
        if let Some(rc) = &self.request_compression {
            insert(&mut request.headers, CONNECT_CONTENT_ENCODING, rc.pool.name());
        }
        request
    }

    fn stream_request_body(&mut self, body: Bytes) -> Result<Bytes, ConnectError> {
        let compression = self.request_compression.as_ref();
        envelope::pack(
            &body,
            compression.map(|rc| rc.pool.as_ref()),
            compression.map(|rc| rc.min_bytes),
        )
        .map_err(|err| ConnectError::from_source(Code::Internal, err))
    }

    fn stream_result(&mut self, result: StreamResult<Bytes>) -> StreamResult<Bytes> {
        match result {
            StreamResult::Headers(headers) => {
                let (headers, _) = split_trailers(headers);
                self.response_pool = header_str(&headers, &CONNECT_CONTENT_ENCODING)
                    .and_then(|name| find_pool(&self.compression_pools, name));
                StreamResult::Headers(headers)
            }
            StreamResult::Message(frame) => {
                match envelope::unpack(&frame, self.response_pool.as_deref()) {
                    Ok((flags, payload)) if flags & CONNECT_END_STREAM_FLAG != 0 => {
                        self.end_stream_received = true;
                        self.parse_end_stream(&payload)
                    }
                    Ok((_, payload)) => StreamResult::Message(payload),
                    Err(err) => StreamResult::failed(ConnectError::from_source(Code::Internal, err)),
                }
            }
            StreamResult::Complete { error, trailers } => {
                if error.is_some() || self.end_stream_received {
                    return StreamResult::Complete { error, trailers };
                }
                StreamResult::Complete {
                    error: Some(
                        ConnectError::new(Code::Internal)
                            .with_message("protocol error: missing end-of-stream message"),
                    ),
                    trailers,
                }
            }
        }
    }
}
