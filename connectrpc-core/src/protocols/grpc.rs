//! # gRPC Protocol
//!
//! Every message is enveloped, and the outcome of the call travels in HTTP
//! trailers (`grpc-status`, `grpc-message`, `grpc-status-details-bin`). A server
//! failing before sending anything may put the status in the headers instead and
//! send no body ("trailers-only" response).
use super::{
    GRPC_ACCEPT_ENCODING, GRPC_ENCODING, GRPC_TIMEOUT, TE, encode_grpc_timeout, grpc_user_agent,
    has_status, header_str, insert, parse_completion,
};
use crate::{
    Code, ConnectError, Interceptor, ProtocolClientConfig,
    compression::{CompressionPool, RequestCompression, find_pool, pool_names},
    envelope,
    http::{HttpRequest, HttpResponse, StreamResult, UnaryHttpRequest},
};
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::sync::Arc;

/// Request headers and envelope handling shared by gRPC and gRPC-Web.
pub(crate) struct GrpcCommon {
    request_compression: Option<RequestCompression>,
    compression_pools: Vec<Arc<dyn CompressionPool>>,
    pub(crate) response_pool: Option<Arc<dyn CompressionPool>>,
}

impl GrpcCommon {
    pub(crate) fn new(config: &ProtocolClientConfig) -> Self {
        Self {
            request_compression: config.request_compression().cloned(),
            compression_pools: config.compression_pools().to_vec(),
            response_pool: None,
        }
    }

    pub(crate) fn request_headers(&self, request: &mut HttpRequest) {
        let headers = &mut request.headers;
        insert(headers, TE, "trailers");
        if let Some(rc) = &self.request_compression {
            insert(headers, GRPC_ENCODING, rc.pool.name());
        }
        if !self.compression_pools.is_empty() {
            insert(headers, GRPC_ACCEPT_ENCODING, &pool_names(&self.compression_pools));
        }
        if let Some(timeout) = request.timeout {
            insert(headers, GRPC_TIMEOUT, &encode_grpc_timeout(timeout));
        }
    }

    pub(crate) fn pack(&self, message: &[u8]) -> Result<Bytes, ConnectError> {
        let compression = self.request_compression.as_ref();
        envelope::pack(
            message,
            compression.map(|rc| rc.pool.as_ref()),
            compression.map(|rc| rc.min_bytes),
        )
        .map_err(|err| ConnectError::from_source(Code::Internal, err))
    }

    pub(crate) fn select_response_pool(&mut self, headers: &HeaderMap) {
        self.response_pool = header_str(headers, &GRPC_ENCODING)
            .and_then(|name| find_pool(&self.compression_pools, name));
    }

    pub(crate) fn unpack(&self, frame: &[u8]) -> Result<(u8, Bytes), ConnectError> {
        envelope::unpack(frame, self.response_pool.as_deref())
            .map_err(|err| ConnectError::from_source(Code::Internal, err))
    }
}

pub(crate) fn unexpected_status(status: Option<StatusCode>) -> ConnectError {
    let status = status.map(|status| status.as_u16());
    ConnectError::new(Code::from_http_status(status))
        .with_message(format!("unexpected HTTP status: {}", status.unwrap_or(0)))
}

pub(crate) fn missing_message() -> ConnectError {
    ConnectError::new(Code::Internal).with_message("protocol error: missing response message")
}

/// Client side of the gRPC protocol.
pub struct GrpcInterceptor {
    common: GrpcCommon,
}

impl GrpcInterceptor {
    pub fn new(config: &ProtocolClientConfig) -> Self {
        Self {
            common: GrpcCommon::new(config),
        }
    }
}

impl Interceptor for GrpcInterceptor {
    fn unary_request(
        &mut self,
        mut request: UnaryHttpRequest,
    ) -> Result<UnaryHttpRequest, ConnectError> {
        request.head = self.stream_request(request.head);
        request.message = self.common.pack(&request.message)?;
        Ok(request)
    }

    fn unary_response(&mut self, response: HttpResponse) -> HttpResponse {
        if response.cause.is_some() {
            return response;
        }
        if response.status != Some(StatusCode::OK) && !has_status(&response.headers) {
            let cause = unexpected_status(response.status).with_metadata(response.headers.clone());
            return HttpResponse {
                cause: Some(cause),
                message: Bytes::new(),
                ..response
            };
        }

        let completion = parse_completion(&response.headers, &response.trailers);
        if let Some(error) = completion.into_error() {
            return HttpResponse {
                cause: Some(error),
                message: Bytes::new(),
                ..response
            };
        }

        self.common.select_response_pool(&response.headers);
        let unpacked = if response.message.is_empty() {
            Err(missing_message())
        } else {
            self.common.unpack(&response.message)
        };
        match unpacked {
            Ok((_, message)) => HttpResponse {
                message,
                ..response
            },
            Err(error) => HttpResponse {
                cause: Some(error),
                message: Bytes::new(),
                ..response
            },
        }
    }

    fn stream_request(&mut self, mut request: HttpRequest) -> HttpRequest {
        request.content_type = format!("application/grpc+{}", request.encoding);
        grpc_user_agent(&mut request.headers);
        self.common.request_headers(&mut request);
        request
    }

    fn stream_request_body(&mut self, body: Bytes) -> Result<Bytes, ConnectError> {
        self.common.pack(&body)
    }

    fn stream_result(&mut self, result: StreamResult<Bytes>) -> StreamResult<Bytes> {
        match result {
            StreamResult::Headers(headers) => {
                if has_status(&headers) {
                    let completion = parse_completion(&headers, &HeaderMap::new());
                    return StreamResult::Complete {
                        error: completion.into_error(),
                        trailers: headers,
                    };
                }
                self.common.select_response_pool(&headers);
                StreamResult::Headers(headers)
            }
            StreamResult::Message(frame) => match self.common.unpack(&frame) {
                Ok((_, payload)) => StreamResult::Message(payload),
                Err(error) => StreamResult::failed(error),
            },
            StreamResult::Complete { error, trailers } => {
                if error.is_some() {
                    return StreamResult::Complete { error, trailers };
                }
                let completion = parse_completion(&HeaderMap::new(), &trailers);
                StreamResult::Complete {
                    error: completion.into_error(),
                    trailers,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MethodSpec, compression::GzipCompressionPool};
    use http::{HeaderValue, Method, header::USER_AGENT};
    use std::time::Duration;

    fn grpc(compress: bool) -> GrpcInterceptor {
        let mut builder = ProtocolClientConfig::builder("http://localhost:50051");
        if compress {
            builder = builder.request_compression(0, Arc::new(GzipCompressionPool));
        }
        GrpcInterceptor::new(&builder.build().unwrap())
    }

    fn request() -> UnaryHttpRequest {
        UnaryHttpRequest {
            head: HttpRequest {
                method: Method::POST,
                url: "http://localhost:50051/a.B/C".parse().unwrap(),
                content_type: String::new(),
                encoding: "proto",
                headers: HeaderMap::new(),
                spec: MethodSpec::unary("a.B/C"),
                timeout: Some(Duration::from_secs(2)),
            },
            message: Bytes::from_static(b"hello"),
        }
    }

    #[test]
    fn request_is_enveloped_with_grpc_headers() {
        let request = grpc(false).unary_request(request()).unwrap();
        let headers = &request.head.headers;
        assert_eq!(request.head.content_type, "application/grpc+proto");
        assert_eq!(headers.get(TE).unwrap(), "trailers");
        assert_eq!(headers.get(GRPC_TIMEOUT).unwrap(), "2000m");
        assert_eq!(headers.get(GRPC_ACCEPT_ENCODING).unwrap(), "gzip");
        assert!(headers.get(GRPC_ENCODING).is_none());
        assert!(
            headers
                .get(USER_AGENT)
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("grpc-rust-connect/")
        );
        assert_eq!(request.message.as_ref(), b"\0\0\0\0\x05hello");
    }

    #[test]
    fn compressed_request_sets_grpc_encoding() {
        let request = grpc(true).unary_request(request()).unwrap();
        assert_eq!(request.head.headers.get(GRPC_ENCODING).unwrap(), "gzip");
        assert_eq!(request.message[0], envelope::COMPRESSED_FLAG);
    }

    #[test]
    fn unary_response_reads_message_and_status() {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("0"));
        let response = grpc(false).unary_response(HttpResponse {
            status: Some(StatusCode::OK),
            message: envelope::pack_with_flags(b"reply", 0).unwrap(),
            trailers,
            ..Default::default()
        });
        assert!(response.cause.is_none());
        assert_eq!(response.message.as_ref(), b"reply");
    }

    #[test]
    fn trailers_only_error() {
        let mut headers = HeaderMap::new();
        headers.insert("grpc-status", HeaderValue::from_static("16"));
        headers.insert("grpc-message", HeaderValue::from_static("who%20are%20you"));
        let response = grpc(false).unary_response(HttpResponse {
            status: Some(StatusCode::OK),
            headers,
            ..Default::default()
        });
        let error = response.cause.unwrap();
        assert_eq!(error.code, Code::Unauthenticated);
        assert_eq!(error.message(), Some("who are you"));
    }

    #[test]
    fn missing_status_is_internal() {
        let response = grpc(false).unary_response(HttpResponse {
            status: Some(StatusCode::OK),
            message: envelope::pack_with_flags(b"reply", 0).unwrap(),
            ..Default::default()
        });
        assert_eq!(response.cause.unwrap().code, Code::Internal);
    }

    #[test]
    fn stream_headers_with_status_complete_the_stream() {
        let mut headers = HeaderMap::new();
        headers.insert("grpc-status", HeaderValue::from_static("12"));
        let result = grpc(false).stream_result(StreamResult::Headers(headers));
        assert_eq!(result.connect_error().unwrap().code, Code::Unimplemented);
    }
}
