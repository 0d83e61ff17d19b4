//! Connect unary calls: a bare message in, a bare message or a JSON error out.
use super::{
    Handler, HandlerSpec, RequestReader, ServerConfig, ServerContext, ServerInterceptorChain,
    ServerResponse, join, reader::too_large, with_deadline,
};
use crate::{
    BoxError, Code, ConnectError, NetworkProtocol,
    compression::{CompressionError, CompressionPool, find_pool, negotiate, pool_names},
    http::FullBody,
    protocols::{
        ACCEPT_ENCODING, CONNECT_PROTOCOL_VERSION, CONNECT_PROTOCOL_VERSION_VALUE,
        CONNECT_TIMEOUT_MS, CONNECT_TRAILER_PREFIX, CONTENT_ENCODING, CONTENT_TYPE, ErrorPayload,
        header_str, insert, percent_decode_bytes,
    },
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, request::Parts};
use http_body::Body as HttpBody;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{debug, warn};

/// The request of a unary call, once read and decompressed.
struct UnaryRequest {
    message: Bytes,
    encoding: String,
    timeout: Option<Duration>,
}

/// Serves a Connect unary call. `encoding` is `None` for GET requests, which carry
/// it in the query.
pub(super) async fn serve_unary<B>(
    config: &ServerConfig,
    mut parts: Parts,
    body: B,
    spec: HandlerSpec,
    encoding: Option<String>,
) -> ServerResponse
where
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError> + Send,
{
    let interceptors = ServerInterceptorChain::new(config);
    let request = async {
        parts.headers = interceptors.request(&spec.procedure, std::mem::take(&mut parts.headers))?;
        let mut request = read_request(config, &parts, body, encoding, spec.encoding).await?;
        request.message = interceptors.request_message(request.message)?;
        Ok::<_, ConnectError>(request)
    };
    let request = match request.await {
        Ok(request) => request,
        Err(error) => {
            debug!(procedure = %spec.procedure, code = %error.code, "rejecting unary request");
            return error_response(&interceptors.response_error(error), HeaderMap::new());
        }
    };
    let Handler::Unary(handler) = &spec.handler else {
        let error = ConnectError::new(Code::Internal).with_message("handler is not unary");
        return error_response(&error, HeaderMap::new());
    };

    let response_pool = if config.compress_responses {
        negotiate(
            &config.compression_pools,
            header_str(&parts.headers, &ACCEPT_ENCODING),
        )
    } else {
        None
    };
    let ctx = ServerContext::new(
        spec.procedure.clone(),
        NetworkProtocol::Connect,
        parts.headers,
        request.timeout,
    );

    let call = handler(ctx.clone(), request.message);
    let result = join(tokio::spawn(with_deadline(request.timeout, call))).await;
    let mut headers = ctx.response_headers();
    for (name, value) in ctx.response_trailers().iter() {
        let prefixed = format!("{CONNECT_TRAILER_PREFIX}{name}");
        if let Ok(name) = HeaderName::from_bytes(prefixed.as_bytes()) {
            headers.append(name, value.clone());
        }
    }

    let message = match result {
        Ok(message) => interceptors.response_message(message),
        Err(error) => {
            debug!(procedure = %spec.procedure, code = %error.code, "unary handler failed");
            return error_response(&interceptors.response_error(error), headers);
        }
    };

    let message = compress_response(
        message,
        response_pool,
        config.compression_min_bytes,
        &mut headers,
    );
    insert(
        &mut headers,
        CONTENT_TYPE,
        &format!("application/{}", request.encoding),
    );

    let mut response = http::Response::new(tonic::body::Body::new(FullBody::new(message)));
    *response.headers_mut() = headers;
    response
}

/// Compresses `message` when it is at least `min_bytes` long, naming the encoding
/// in `headers`.
fn compress_response(
    message: Bytes,
    pool: Option<Arc<dyn CompressionPool>>,
    min_bytes: usize,
    headers: &mut HeaderMap,
) -> Bytes {
    let Some(pool) = pool.filter(|_| message.len() >= min_bytes) else {
        return message;
    };
    match pool.compress(&message) {
        Ok(compressed) => {
            insert(headers, CONTENT_ENCODING, pool.name());
            compressed
        }
        Err(err) => {
            warn!(error = %err, "sending response uncompressed");
            message
        }
    }
}

async fn read_request<B>(
    config: &ServerConfig,
    parts: &Parts,
    body: B,
    encoding: Option<String>,
    expected_encoding: &str,
) -> Result<UnaryRequest, ConnectError>
where
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError> + Send,
{
    let timeout = parse_timeout(&parts.headers)?;

    let (message, encoding, compression) = match encoding {
        Some(encoding) => {
            check_version(header_str(&parts.headers, &CONNECT_PROTOCOL_VERSION))?;
            let message = RequestReader::new(body, None, config.read_max_bytes)
                .read_to_end()
                .await?;
            let compression = header_str(&parts.headers, &CONTENT_ENCODING).map(str::to_string);
            (message, encoding, compression)
        }
        None => {
            let mut query = parse_query(parts.uri.query().unwrap_or_default());
            if let Some(version) = query.get("connect") {
                if version.as_slice() != b"v1" {
                    return Err(ConnectError::new(Code::InvalidArgument).with_message(format!(
                        "connect must be \"v1\": got \"{}\"",
                        String::from_utf8_lossy(version)
                    )));
                }
            }
            let encoding = query
                .remove("encoding")
                .map(|encoding| String::from_utf8_lossy(&encoding).into_owned())
                .ok_or_else(|| missing_param("encoding"))?;
            let raw = query.remove("message").ok_or_else(|| missing_param("message"))?;
            let message = if query.get("base64").is_some_and(|flag| flag.as_slice() == b"1") {
                let text = String::from_utf8_lossy(&raw);
                URL_SAFE_NO_PAD
                    .decode(text.trim_end_matches('='))
                    .map_err(|err| ConnectError::from_source(Code::InvalidArgument, err))?
            } else {
                raw
            };
            let compression = query
                .remove("compression")
                .map(|name| String::from_utf8_lossy(&name).into_owned());
            (Bytes::from(message), encoding, compression)
        }
    };

    if encoding != expected_encoding {
        return Err(ConnectError::new(Code::InvalidArgument).with_message(format!(
            "unsupported encoding \"{encoding}\": the procedure expects \"{expected_encoding}\""
        )));
    }

    let message = match compression.as_deref() {
        None | Some("") | Some("identity") => message,
        Some(name) => {
            let pool = find_pool(&config.compression_pools, name).ok_or_else(|| {
                ConnectError::new(Code::Unimplemented).with_message(format!(
                    "unknown compression \"{name}\": supported encodings are {}",
                    pool_names(&config.compression_pools)
                ))
            })?;
            if message.is_empty() {
                message
            } else {
                pool.decompress(&message, config.read_max_bytes)
                    .map_err(|err| match err {
                        CompressionError::TooLarge { limit } => too_large(limit),
                        err => ConnectError::from_source(Code::InvalidArgument, err),
                    })?
            }
        }
    };

    Ok(UnaryRequest {
        message,
        encoding,
        timeout,
    })
}

fn missing_param(name: &str) -> ConnectError {
    ConnectError::new(Code::InvalidArgument)
        .with_message(format!("missing \"{name}\" query parameter"))
}

fn check_version(version: Option<&str>) -> Result<(), ConnectError> {
    match version {
        None => Ok(()),
        Some(version) if version == CONNECT_PROTOCOL_VERSION_VALUE => Ok(()),
        Some(version) => Err(ConnectError::new(Code::InvalidArgument).with_message(format!(
            "connect-protocol-version must be \"{CONNECT_PROTOCOL_VERSION_VALUE}\": got \"{version}\""
        ))),
    }
}

/// Reads `connect-timeout-ms`: at most ten digits.
pub(super) fn parse_timeout(headers: &HeaderMap) -> Result<Option<Duration>, ConnectError> {
    let Some(value) = header_str(headers, &CONNECT_TIMEOUT_MS) else {
        return Ok(None);
    };
    let invalid = || {
        ConnectError::new(Code::InvalidArgument)
            .with_message(format!("invalid connect-timeout-ms \"{value}\""))
    };
    if value.is_empty() || value.len() > 10 {
        return Err(invalid());
    }
    value
        .parse::<u64>()
        .map(|millis| Some(Duration::from_millis(millis)))
        .map_err(|_| invalid())
}

/// Query parameters, values percent-decoded to raw bytes.
fn parse_query(query: &str) -> HashMap<String, Vec<u8>> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (
                String::from_utf8_lossy(&percent_decode_bytes(key.as_bytes())).into_owned(),
                percent_decode_bytes(value.as_bytes()),
            )
        })
        .collect()
}

/// A Connect unary error: a JSON body and an HTTP status derived from the code.
pub(super) fn error_response(error: &ConnectError, mut headers: HeaderMap) -> ServerResponse {
    let body = serde_json::to_vec(&ErrorPayload::from_error(error)).unwrap_or_default();
    for (name, value) in error.metadata.iter() {
        headers.append(name.clone(), value.clone());
    }
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    let mut response = http::Response::new(tonic::body::Body::new(FullBody::new(Bytes::from(body))));
    *response.status_mut() = StatusCode::from_u16(error.code.to_http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    *response.headers_mut() = headers;
    response
}
