//! # Protocol Client
//!
//! [`ProtocolClient`] performs RPCs with any [`Codec`] over any `tonic` compatible
//! transport, speaking the protocol chosen in its [`ProtocolClientConfig`].
//!
//! ## How it works
//!
//! 1. The request message is encoded by the codec (deterministically when GET
//!    requests are enabled, so equal requests map to equal URLs).
//! 2. A fresh [`InterceptorChain`](crate::InterceptorChain) is created for the call.
//!    User interceptors run first, the protocol interceptor last, which frames the
//!    request for the wire.
//! 3. The [`HttpClient`] sends it. The response flows back through the chain in
//!    reverse order and is decoded by the codec.
//!
//! ## Access Patterns
//!
//! * [`ProtocolClient::unary`]: single request, single response.
//! * [`ProtocolClient::server_stream`]: single request, stream of responses.
//! * [`ProtocolClient::client_stream`]: stream of requests, single response.
//! * [`ProtocolClient::bidi_stream`]: stream of requests, stream of responses.
use crate::{
    BoxError, Code, ConnectError, MethodSpec, ProtocolClientConfig,
    codec::Codec,
    http::{HttpClient, HttpRequest, StreamResult, UnaryHttpRequest},
};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use http_body::Body as HttpBody;
use std::{sync::Arc, time::Duration};
use tonic::{
    client::GrpcService,
    transport::{Channel, Endpoint},
};
use tracing::debug;

mod stream;

pub use stream::{BidiStream, ClientStream, ServerStream};

/// Errors that can occur when connecting to a server.
#[derive(Debug, thiserror::Error)]
pub enum ClientConnectError {
    #[error("Invalid URL '{0}': {1}")]
    InvalidUrl(String, #[source] tonic::transport::Error),
    #[error("Failed to connect to '{0}': {1}")]
    ConnectionFailed(String, #[source] tonic::transport::Error),
}

/// Per-call settings.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub headers: HeaderMap,
    /// Overrides the timeout computed by the config's timeout oracle.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// The outcome of a successful unary or client streaming call.
#[derive(Debug, Clone)]
pub struct UnaryResponse<T> {
    pub message: T,
    pub headers: HeaderMap,
    pub trailers: HeaderMap,
}

impl<T> UnaryResponse<T> {
    pub fn into_inner(self) -> T {
        self.message
    }
}

/// An RPC client for the Connect, gRPC and gRPC-Web protocols.
#[derive(Debug, Clone)]
pub struct ProtocolClient<S = Channel> {
    http: HttpClient<S>,
    config: Arc<ProtocolClientConfig>,
}

impl ProtocolClient<Channel> {
    /// Connects to the configured host over HTTP/2.
    ///
    /// # Returns
    ///
    /// * `Ok(ProtocolClient)` - The connected client.
    /// * `Err(ClientConnectError)` - If the URL is invalid or connection fails.
    pub async fn connect(config: ProtocolClientConfig) -> Result<Self, ClientConnectError> {
        let addr = config.host().to_string();
        let endpoint = Endpoint::new(addr.clone())
            .map_err(|e| ClientConnectError::InvalidUrl(addr.clone(), e))?;

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| ClientConnectError::ConnectionFailed(addr, e))?;

        Ok(Self::new(channel, config))
    }
}

impl<S> ProtocolClient<S>
where
    S: GrpcService<tonic::body::Body> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    /// Creates a client over an existing transport, e.g. a `Channel` or an
    /// in-process [`ConnectServer`](crate::ConnectServer).
    pub fn new(service: S, config: ProtocolClientConfig) -> Self {
        Self {
            http: HttpClient::new(service),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ProtocolClientConfig {
        &self.config
    }

    /// Performs a unary call.
    ///
    /// # Returns
    ///
    /// * `Ok(UnaryResponse)` - The response message with its headers and trailers.
    /// * `Err(ConnectError)` - The call failed, locally or on the server.
    pub async fn unary<C: Codec>(
        &self,
        spec: &MethodSpec,
        codec: C,
        request: C::Encode,
        options: CallOptions,
    ) -> Result<UnaryResponse<C::Decode>, ConnectError> {
        let message = if self.config.get_configuration().is_enabled() {
            codec.encode_deterministic(&request)
        } else {
            codec.encode(&request)
        }
        .map_err(|err| ConnectError::from_source(Code::Internal, err))?;

        let head = self.head(spec, codec.encoding_name(), options)?;
        let mut chain = self.config.interceptor_chain();
        let request = chain.unary_request(UnaryHttpRequest { head, message })?;

        debug!(path = %spec.path, method = %request.head.method, "dispatching unary call");
        let response = chain.unary_response(self.http.unary(request).await);

        if let Some(mut error) = response.cause {
            if error.metadata.is_empty() {
                error.metadata = response.headers;
                error.metadata.extend(response.trailers);
            }
            debug!(path = %spec.path, code = %error.code, "unary call failed");
            return Err(error);
        }

        let message = codec
            .decode(response.message)
            .map_err(|err| ConnectError::from_source(Code::Internal, err))?;
        Ok(UnaryResponse {
            message,
            headers: response.headers,
            trailers: response.trailers,
        })
    }

    /// Starts a server streaming call by sending its only request.
    pub async fn server_stream<C: Codec>(
        &self,
        spec: &MethodSpec,
        codec: C,
        request: C::Encode,
        options: CallOptions,
    ) -> Result<ServerStream<C::Decode>, ConnectError> {
        let mut stream = self.bidi_stream(spec, codec, options)?;
        stream.send(&request).await?;
        stream.close_send();
        Ok(ServerStream::new(stream))
    }

    /// Starts a client streaming call.
    pub fn client_stream<C: Codec>(
        &self,
        spec: &MethodSpec,
        codec: C,
        options: CallOptions,
    ) -> Result<ClientStream<C::Encode, C::Decode>, ConnectError> {
        Ok(ClientStream::new(self.bidi_stream(spec, codec, options)?))
    }

    /// Starts a bidirectional streaming call.
    pub fn bidi_stream<C: Codec>(
        &self,
        spec: &MethodSpec,
        codec: C,
        options: CallOptions,
    ) -> Result<BidiStream<C::Encode, C::Decode>, ConnectError> {
        let head = self.head(spec, codec.encoding_name(), options)?;
        let mut chain = self.config.interceptor_chain();
        let head = chain.stream_request(head);

        debug!(path = %spec.path, stream_type = ?spec.stream_type, "opening stream");
        let http = self.http.stream(head);
        Ok(BidiStream::new(Arc::new(codec), chain, http))
    }

    fn head(
        &self,
        spec: &MethodSpec,
        encoding: &'static str,
        options: CallOptions,
    ) -> Result<HttpRequest, ConnectError> {
        let url = self
            .config
            .url_for(spec)
            .map_err(|err| ConnectError::from_source(Code::Internal, err))?;
        Ok(HttpRequest {
            method: Method::POST,
            url,
            content_type: format!("application/{encoding}"),
            encoding,
            headers: options.headers,
            spec: spec.clone(),
            timeout: options.timeout.or_else(|| self.config.timeout_for(spec)),
        })
    }
}

/// Converts a missing stream completion into an error.
pub(crate) fn stream_ended_early() -> StreamResult<Bytes> {
    StreamResult::failed(
        ConnectError::new(Code::Unknown).with_message("stream ended without a status"),
    )
}
