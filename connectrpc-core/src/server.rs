//! # Connect Server
//!
//! [`ConnectServer`] is a `tower` service that routes HTTP requests to registered
//! [`HandlerSpec`]s, speaking Connect, gRPC and gRPC-Web on the same routes.
//!
//! ## How it works
//!
//! 1. The protocol is detected from the request's method and content type:
//!    `application/grpc-web*` is gRPC-Web, `application/grpc*` is gRPC,
//!    `application/connect+*` is a Connect stream, any other `application/*` (or a
//!    GET) is a Connect unary call.
//! 2. The procedure is looked up from the path. Unknown procedures fail with
//!    `unimplemented`; a codec or stream type mismatch is answered with HTTP 415.
//! 3. Connect unary calls are answered with a bare message or a JSON error. Every
//!    other call runs its handler in a task and streams enveloped responses, the
//!    final status going in trailers (gRPC), a trailers frame (gRPC-Web) or an
//!    end-of-stream message (Connect).
//!
//! It can be served by `hyper`/`tonic` or used directly as the transport of a
//! [`ProtocolClient`](crate::ProtocolClient) for in-process calls.
use crate::{
    BoxError, Code, ConnectError, Idempotency, NetworkProtocol, StreamType,
    http::FullBody,
    protocols::{CONTENT_TYPE, header_str},
};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{Method, StatusCode, header::ALLOW};
use http_body::Body as HttpBody;
use std::{
    collections::HashMap,
    convert::Infallible,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

mod config;
mod connect;
mod context;
mod handler;
mod health;
mod interceptor;
mod reader;
mod streaming;

pub use config::{DEFAULT_COMPRESSION_MIN_BYTES, DEFAULT_READ_MAX_BYTES, ServerConfig};
pub use context::ServerContext;
pub use handler::{HandlerSpec, RequestStream, ResponseStream};
pub use health::{HealthCheckRequest, HealthCheckResponse, HealthService, ServingStatus};
pub use interceptor::{ServerInterceptor, ServerInterceptorFactory};

use handler::Handler;
use interceptor::ServerInterceptorChain;
use reader::RequestReader;

/// The response of every call served by a [`ConnectServer`].
pub type ServerResponse = http::Response<tonic::body::Body>;

/// Serves registered handlers over Connect, gRPC and gRPC-Web.
#[derive(Debug, Clone, Default)]
pub struct ConnectServer {
    config: Arc<ServerConfig>,
    handlers: Arc<HashMap<String, HandlerSpec>>,
}

/// How a request asks to be served.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RequestKind {
    ConnectUnary { encoding: String },
    ConnectGet,
    Stream {
        protocol: NetworkProtocol,
        encoding: String,
    },
}

impl RequestKind {
    fn detect(method: &Method, content_type: &str) -> Option<Self> {
        if method == Method::GET {
            return Some(RequestKind::ConnectGet);
        }
        let content_type = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        let grpc = |protocol, rest: &str| {
            let encoding = match rest {
                "" => Some("proto"),
                rest => rest.strip_prefix('+'),
            };
            encoding.map(|encoding| RequestKind::Stream {
                protocol,
                encoding: encoding.to_string(),
            })
        };
        if let Some(rest) = content_type.strip_prefix("application/grpc-web") {
            return grpc(NetworkProtocol::GrpcWeb, rest);
        }
        if let Some(rest) = content_type.strip_prefix("application/grpc") {
            return grpc(NetworkProtocol::Grpc, rest);
        }
        if let Some(encoding) = content_type.strip_prefix("application/connect+") {
            return Some(RequestKind::Stream {
                protocol: NetworkProtocol::Connect,
                encoding: encoding.to_string(),
            });
        }
        content_type
            .strip_prefix("application/")
            .filter(|encoding| !encoding.is_empty())
            .map(|encoding| RequestKind::ConnectUnary {
                encoding: encoding.to_string(),
            })
    }
}

impl ConnectServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            handlers: Arc::default(),
        }
    }

    /// Adds a handler, replacing any previous one for the same procedure.
    pub fn register(mut self, spec: HandlerSpec) -> Self {
        debug!(procedure = %spec.procedure, stream_type = ?spec.stream_type, "registering handler");
        Arc::make_mut(&mut self.handlers).insert(spec.procedure.clone(), spec);
        self
    }

    pub fn register_all(self, specs: impl IntoIterator<Item = HandlerSpec>) -> Self {
        specs.into_iter().fold(self, Self::register)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn find_handler(&self, procedure: &str) -> Option<&HandlerSpec> {
        self.handlers.get(procedure.trim_start_matches('/'))
    }

    /// Registered procedures, sorted.
    pub fn procedures(&self) -> Vec<&str> {
        let mut procedures: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        procedures.sort_unstable();
        procedures
    }

    /// Serves one request. Failures are reported in the response, never as `Err`.
    pub async fn handle<B>(&self, request: http::Request<B>) -> ServerResponse
    where
        B: HttpBody<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError> + Send,
    {
        let (parts, body) = request.into_parts();
        let content_type = header_str(&parts.headers, &CONTENT_TYPE).unwrap_or_default();
        let procedure = parts.uri.path().trim_start_matches('/').to_string();

        if parts.method != Method::POST && parts.method != Method::GET {
            return method_not_allowed(&parts.method);
        }
        let Some(kind) = RequestKind::detect(&parts.method, content_type) else {
            warn!(%procedure, content_type, "unsupported content type");
            return plain_status(StatusCode::UNSUPPORTED_MEDIA_TYPE);
        };

        let Some(spec) = self.handlers.get(&procedure).cloned() else {
            debug!(%procedure, "no handler registered");
            let error = ConnectError::new(Code::Unimplemented)
                .with_message(format!("procedure '{procedure}' is not implemented"));
            return match kind {
                RequestKind::Stream { protocol, encoding } => {
                    streaming::immediate_error(protocol, &encoding, &error)
                }
                _ => connect::error_response(&error, Default::default()),
            };
        };

        match kind {
            RequestKind::ConnectGet => {
                if spec.stream_type != StreamType::Unary
                    || spec.idempotency != Idempotency::NoSideEffects
                {
                    return method_not_allowed(&parts.method);
                }
                connect::serve_unary(&self.config, parts, body, spec, None).await
            }
            RequestKind::ConnectUnary { encoding } => {
                if spec.stream_type != StreamType::Unary || encoding != spec.encoding {
                    return plain_status(StatusCode::UNSUPPORTED_MEDIA_TYPE);
                }
                connect::serve_unary(&self.config, parts, body, spec, Some(encoding)).await
            }
            RequestKind::Stream { protocol, encoding } => {
                let connect_unary =
                    protocol == NetworkProtocol::Connect && spec.stream_type == StreamType::Unary;
                if connect_unary || encoding != spec.encoding {
                    return plain_status(StatusCode::UNSUPPORTED_MEDIA_TYPE);
                }
                streaming::serve(&self.config, protocol, parts, body, spec).await
            }
        }
    }
}

impl<B> tower_service::Service<http::Request<B>> for ConnectServer
where
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError> + Send,
{
    type Response = ServerResponse;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<ServerResponse, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<B>) -> Self::Future {
        let server = self.clone();
        Box::pin(async move { Ok(server.handle(request).await) })
    }
}

/// Runs a handler future under the client's deadline.
pub(crate) async fn with_deadline<T>(
    timeout: Option<std::time::Duration>,
    call: impl Future<Output = Result<T, ConnectError>>,
) -> Result<T, ConnectError> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, call).await.unwrap_or_else(|_| {
            Err(ConnectError::new(Code::DeadlineExceeded).with_message("the call timed out"))
        }),
        None => call.await,
    }
}

/// Awaits a handler task. A panic is reported as `internal`.
pub(crate) async fn join<T>(task: JoinHandle<Result<T, ConnectError>>) -> Result<T, ConnectError> {
    match task.await {
        Ok(result) => result,
        Err(err) if err.is_panic() => {
            warn!(error = %err, "handler panicked");
            Err(ConnectError::new(Code::Internal).with_message("handler panicked"))
        }
        Err(err) => Err(ConnectError::from_source(Code::Canceled, err)),
    }
}

fn plain_status(status: StatusCode) -> ServerResponse {
    let mut response = http::Response::new(tonic::body::Body::new(FullBody::default()));
    *response.status_mut() = status;
    response
}

fn method_not_allowed(method: &Method) -> ServerResponse {
    debug!(%method, "method not allowed");
    let mut response = plain_status(StatusCode::METHOD_NOT_ALLOWED);
    response
        .headers_mut()
        .insert(ALLOW, http::HeaderValue::from_static("GET, POST"));
    response
}
