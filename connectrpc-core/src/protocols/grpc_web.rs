//! # gRPC-Web Protocol
//!
//! Like gRPC, but usable without HTTP trailers: the status is sent as the last
//! envelope of the body, flagged `0x80`, whose payload is a block of
//! `name: value\r\n` lines.
use super::{
    GRPC_WEB_TRAILERS_FLAG, grpc::GrpcCommon, grpc::missing_message, grpc::unexpected_status,
    grpc_web_user_agent, has_status, parse_completion, parse_trailers_block,
};
use crate::{
    Code, ConnectError, Interceptor, ProtocolClientConfig,
    envelope::EnvelopeDecoder,
    http::{HttpRequest, HttpResponse, StreamResult, UnaryHttpRequest},
};
use bytes::Bytes;
use http::{HeaderMap, StatusCode};

/// Client side of the gRPC-Web protocol.
pub struct GrpcWebInterceptor {
    common: GrpcCommon,
}

impl GrpcWebInterceptor {
    pub fn new(config: &ProtocolClientConfig) -> Self {
        Self {
            common: GrpcCommon::new(config),
        }
    }

    /// Splits a unary body into its message and trailers block.
    fn read_unary_body(&self, body: &[u8]) -> Result<(Option<Bytes>, HeaderMap), ConnectError> {
        let mut decoder = EnvelopeDecoder::new();
        decoder.push(body);
        let mut message = None;
        let mut trailers = HeaderMap::new();

        while let Some(frame) = decoder.next_frame() {
            let (flags, payload) = self.common.unpack(&frame)?;
            if flags & GRPC_WEB_TRAILERS_FLAG != 0 {
                trailers = parse_trailers_block(&payload);
                break;
            }
            if message.is_none() {
                message = Some(payload);
            }
        }

        if trailers.is_empty() && decoder.remaining() > 0 {
            return Err(ConnectError::new(Code::Internal)
                .with_message("protocol error: response body ended mid-envelope"));
        }

        Ok((message, trailers))
    }
}

impl Interceptor for GrpcWebInterceptor {
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

        self.common.select_response_pool(&response.headers);

        // Trailers-only: the status is in the headers and the body is empty.
        let (message, body_trailers) = if response.message.is_empty() {
            (None, HeaderMap::new())
        } else {
            match self.read_unary_body(&response.message) {
                Ok(parts) => parts,
                Err(error) => {
                    return HttpResponse {
                        cause: Some(error),
                        message: Bytes::new(),
                        ..response
                    };
                }
            }
        };

        let mut trailers = response.trailers.clone();
        trailers.extend(body_trailers);
        let completion = parse_completion(&response.headers, &trailers);
        let cause = match (completion.into_error(), &message) {
            (Some(error), _) => Some(error),
            (None, None) => Some(missing_message()),
            (None, Some(_)) => None,
        };

        HttpResponse {
            status: response.status,
            headers: response.headers,
            message: if cause.is_some() {
                Bytes::new()
            } else {
                message.unwrap_or_default()
            },
            trailers,
            cause,
        }
    }

    fn stream_request(&mut self, mut request: HttpRequest) -> HttpRequest {
        request.content_type = format!("application/grpc-web+{}", request.encoding);
        grpc_web_user_agent(&mut request.headers);
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
                Ok((flags, payload)) if flags & GRPC_WEB_TRAILERS_FLAG != 0 => {
                    let trailers = parse_trailers_block(&payload);
                    let completion = parse_completion(&HeaderMap::new(), &trailers);
                    StreamResult::Complete {
                        error: completion.into_error(),
                        trailers,
                    }
                }
                Ok((_, payload)) => StreamResult::Message(payload),
                Err(error) => StreamResult::failed(error),
            },
            StreamResult::Complete { error, trailers } => {
                if error.is_some() {
                    return StreamResult::Complete { error, trailers };
                }
                // No trailers frame: fall back to HTTP trailers, if any.
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
    use crate::{MethodSpec, envelope, protocols::X_USER_AGENT};
    use http::{HeaderValue, Method};

    fn grpc_web() -> GrpcWebInterceptor {
        let config = ProtocolClientConfig::builder("http://localhost:8080")
            .build()
            .unwrap();
        GrpcWebInterceptor::new(&config)
    }

    fn trailers_frame(block: &[u8]) -> Bytes {
        envelope::pack_with_flags(block, GRPC_WEB_TRAILERS_FLAG).unwrap()
    }

    #[test]
    fn request_uses_grpc_web_content_type() {
        let request = grpc_web()
            .unary_request(UnaryHttpRequest {
                head: HttpRequest {
                    method: Method::POST,
                    url: "http://localhost:8080/a.B/C".parse().unwrap(),
                    content_type: String::new(),
                    encoding: "json",
                    headers: HeaderMap::new(),
                    spec: MethodSpec::unary("a.B/C"),
                    timeout: None,
                },
                message: Bytes::from_static(b"{}"),
            })
            .unwrap();
        assert_eq!(request.head.content_type, "application/grpc-web+json");
        assert!(request.head.headers.contains_key(X_USER_AGENT));
        assert_eq!(request.message.len(), 7);
    }

    #[test]
    fn unary_body_with_message_and_trailers() {
        let mut body = envelope::pack_with_flags(b"reply", 0).unwrap().to_vec();
        body.extend_from_slice(&trailers_frame(b"Grpc-Status: 0\r\nx-extra: yes\r\n"));
        let response = grpc_web().unary_response(HttpResponse {
            status: Some(StatusCode::OK),
            message: Bytes::from(body),
            ..Default::default()
        });
        assert!(response.cause.is_none());
        assert_eq!(response.message.as_ref(), b"reply");
        assert_eq!(response.trailers.get("x-extra").unwrap(), "yes");
    }

    #[test]
    fn unary_trailers_only_body() {
        let body = trailers_frame(b"grpc-status: 9\r\ngrpc-message: not ready\r\n");
        let response = grpc_web().unary_response(HttpResponse {
            status: Some(StatusCode::OK),
            message: body,
            ..Default::default()
        });
        let error = response.cause.unwrap();
        assert_eq!(error.code, Code::FailedPrecondition);
        assert_eq!(error.message(), Some("not ready"));
    }

    #[test]
    fn unary_empty_body_reads_status_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("grpc-status", HeaderValue::from_static("5"));
        let response = grpc_web().unary_response(HttpResponse {
            status: Some(StatusCode::OK),
            headers,
            ..Default::default()
        });
        assert_eq!(response.cause.unwrap().code, Code::NotFound);
    }

    #[test]
    fn stream_trailers_frame_completes() {
        let mut interceptor = grpc_web();
        let message = interceptor.stream_result(StreamResult::Message(envelope::pack_with_flags(
            b"one", 0,
        )
        .unwrap()));
        assert!(matches!(message, StreamResult::Message(ref m) if m.as_ref() == b"one"));

        let done = interceptor.stream_result(StreamResult::Message(trailers_frame(
            b"grpc-status: 0\r\n",
        )));
        assert!(matches!(done, StreamResult::Complete { error: None, .. }));
    }
}
