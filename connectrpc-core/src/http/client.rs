//! # HTTP Client
//!
//! Moves already encoded requests over any service implementing
//! `tonic::client::GrpcService`, such as a `tonic::transport::Channel` or an
//! in-process [`ConnectServer`](crate::ConnectServer).
//!
//! ## How it works
//!
//! * **Unary**: the body is sent in one chunk; the response body and its HTTP
//!   trailers are collected in full.
//! * **Streams**: the request body is fed through a channel. A background task
//!   drives the exchange and splits the response body into envelopes, emitting
//!   headers first, then one [`StreamResult::Message`] per envelope, then a
//!   completion with the HTTP trailers.
//!
//! Transport failures are reported as `unavailable`, elapsed timeouts as
//! `deadline_exceeded`.
use super::{ChannelBody, FullBody, HttpRequest, HttpResponse, StreamResult, UnaryHttpRequest};
use crate::{BoxError, Code, ConnectError, envelope::EnvelopeDecoder};
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode, header::CONTENT_TYPE};
use http_body::{Body as HttpBody, Frame};
use std::{future::poll_fn, pin::pin};
use tokio::{sync::mpsc, task::JoinHandle};
use tonic::client::GrpcService;
use tracing::{debug, trace};

const STREAM_BUFFER: usize = 16;

/// Sends HTTP requests through a `tonic` compatible service.
#[derive(Debug, Clone)]
pub struct HttpClient<S> {
    service: S,
}

impl<S> HttpClient<S>
where
    S: GrpcService<tonic::body::Body> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    pub fn new(service: S) -> Self {
        Self { service }
    }

    /// Performs a request with a fully buffered body and response.
    ///
    /// Never fails: problems are reported through [`HttpResponse::cause`].
    pub async fn unary(&self, request: UnaryHttpRequest) -> HttpResponse {
        let timeout = request.head.timeout;
        let exchange = self.execute_unary(request);
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, exchange)
                .await
                .unwrap_or_else(|_| HttpResponse::failed(deadline_exceeded())),
            None => exchange.await,
        }
    }

    async fn execute_unary(&self, request: UnaryHttpRequest) -> HttpResponse {
        let UnaryHttpRequest { head, message } = request;
        let http_request = build_request(head, tonic::body::Body::new(FullBody::new(message)));

        let mut service = self.service.clone();
        let response = match send(&mut service, http_request).await {
            Ok(response) => response,
            Err(err) => return HttpResponse::failed(err),
        };

        let (parts, body) = response.into_parts();
        match collect(body).await {
            Ok((message, trailers)) => HttpResponse {
                status: Some(parts.status),
                headers: parts.headers,
                message,
                trailers,
                cause: None,
            },
            Err(err) => HttpResponse {
                status: Some(parts.status),
                headers: parts.headers,
                cause: Some(err),
                ..Default::default()
            },
        }
    }

    /// Opens a bidirectional exchange.
    pub fn stream(&self, request: HttpRequest) -> HttpStream {
        let (body_tx, body_rx) = mpsc::channel(STREAM_BUFFER);
        let (result_tx, result_rx) = mpsc::channel(STREAM_BUFFER);
        let service = self.service.clone();

        let task = tokio::spawn(async move {
            let timeout = request.timeout;
            let exchange = run_stream(service, request, body_rx, result_tx.clone());
            match timeout {
                Some(timeout) => {
                    if tokio::time::timeout(timeout, exchange).await.is_err() {
                        let _ = result_tx
                            .send(StreamResult::failed(deadline_exceeded()))
                            .await;
                    }
                }
                None => exchange.await,
            }
        });

        HttpStream {
            body: Some(body_tx),
            results: result_rx,
            task,
        }
    }
}

/// The client half of a streaming exchange.
///
/// Dropping it aborts the exchange.
#[derive(Debug)]
pub struct HttpStream {
    body: Option<mpsc::Sender<Frame<Bytes>>>,
    results: mpsc::Receiver<StreamResult<Bytes>>,
    task: JoinHandle<()>,
}

impl HttpStream {
    /// Writes a chunk of the request body.
    pub async fn send(&mut self, chunk: Bytes) -> Result<(), ConnectError> {
        let sender = self.body.as_ref().ok_or_else(|| {
            ConnectError::new(Code::FailedPrecondition).with_message("request stream is closed")
        })?;
        sender.send(Frame::data(chunk)).await.map_err(|_| {
            ConnectError::new(Code::Unavailable).with_message("request stream was closed by the peer")
        })
    }

    /// Ends the request body.
    pub fn close_send(&mut self) {
        self.body = None;
    }

    pub fn is_send_closed(&self) -> bool {
        self.body.as_ref().is_none_or(|sender| sender.is_closed())
    }

    /// The next response event, or `None` once the exchange is over.
    pub async fn recv(&mut self) -> Option<StreamResult<Bytes>> {
        self.results.recv().await
    }

    /// Stops the exchange, discarding anything not yet received.
    pub fn abort(&mut self) {
        self.body = None;
        self.results.close();
        self.task.abort();
    }
}

impl Drop for HttpStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_stream<S>(
    mut service: S,
    head: HttpRequest,
    body_rx: mpsc::Receiver<Frame<Bytes>>,
    results: mpsc::Sender<StreamResult<Bytes>>,
) where
    S: GrpcService<tonic::body::Body>,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = Bytes>,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError>,
{
    let path = head.url.path().to_string();
    let request = build_request(head, tonic::body::Body::new(ChannelBody::new(body_rx)));

    let response = match send(&mut service, request).await {
        Ok(response) => response,
        Err(err) => {
            let _ = results.send(StreamResult::failed(err)).await;
            return;
        }
    };

    let (parts, body) = response.into_parts();
    debug!(path = %path, status = %parts.status, "stream response received");
    if results
        .send(StreamResult::Headers(parts.headers.clone()))
        .await
        .is_err()
    {
        return;
    }

    if parts.status != StatusCode::OK {
        let code = Code::from_http_status(Some(parts.status.as_u16()));
        let error = ConnectError::new(code)
            .with_message(format!("unexpected HTTP status: {}", parts.status));
        let _ = results
            .send(StreamResult::Complete {
                error: Some(error),
                trailers: parts.headers,
            })
            .await;
        return;
    }

    let mut body = pin!(body);
    let mut decoder = EnvelopeDecoder::new();
    let mut trailers = HeaderMap::new();

    while let Some(frame) = poll_fn(|cx| body.as_mut().poll_frame(cx)).await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                let error = ConnectError::from_boxed(Code::Unavailable, err.into());
                let _ = results.send(StreamResult::failed(error)).await;
                return;
            }
        };

        match frame.into_data() {
            Ok(chunk) => {
                decoder.push(&chunk);
                while let Some(envelope) = decoder.next_frame() {
                    trace!(path = %path, len = envelope.len(), "stream envelope received");
                    if results.send(StreamResult::Message(envelope)).await.is_err() {
                        return;
                    }
                }
            }
            Err(frame) => {
                if let Ok(frame_trailers) = frame.into_trailers() {
                    trailers.extend(frame_trailers);
                }
            }
        }
    }

    let error = (decoder.remaining() > 0).then(|| {
        ConnectError::new(Code::Internal)
            .with_message("protocol error: response body ended mid-envelope")
    });
    let _ = results
        .send(StreamResult::Complete { error, trailers })
        .await;
}

fn build_request(head: HttpRequest, body: tonic::body::Body) -> http::Request<tonic::body::Body> {
    let mut request = http::Request::new(body);
    *request.uri_mut() = head.url;
    let headers = request.headers_mut();
    headers.extend(head.headers);
    if head.method != Method::GET {
        if let Ok(content_type) = head.content_type.parse() {
            headers.insert(CONTENT_TYPE, content_type);
        }
    }
    *request.method_mut() = head.method;
    request
}

async fn send<S>(
    service: &mut S,
    request: http::Request<tonic::body::Body>,
) -> Result<http::Response<S::ResponseBody>, ConnectError>
where
    S: GrpcService<tonic::body::Body>,
    S::Error: Into<BoxError>,
{
    poll_fn(|cx| service.poll_ready(cx))
        .await
        .map_err(|err| ConnectError::from_boxed(Code::Unavailable, err.into()))?;
    service
        .call(request)
        .await
        .map_err(|err| ConnectError::from_boxed(Code::Unavailable, err.into()))
}

async fn collect<B>(body: B) -> Result<(Bytes, HeaderMap), ConnectError>
where
    B: HttpBody<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let mut body = pin!(body);
    let mut data = BytesMut::new();
    let mut trailers = HeaderMap::new();

    while let Some(frame) = poll_fn(|cx| body.as_mut().poll_frame(cx)).await {
        let frame = frame.map_err(|err| ConnectError::from_boxed(Code::Unavailable, err.into()))?;
        match frame.into_data() {
            Ok(chunk) => data.extend_from_slice(&chunk),
            Err(frame) => {
                if let Ok(frame_trailers) = frame.into_trailers() {
                    trailers.extend(frame_trailers);
                }
            }
        }
    }

    Ok((data.freeze(), trailers))
}

fn deadline_exceeded() -> ConnectError {
    ConnectError::new(Code::DeadlineExceeded).with_message("the call timed out")
}
