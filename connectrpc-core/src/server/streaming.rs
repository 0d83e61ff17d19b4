//! Enveloped calls: Connect streams and every gRPC and gRPC-Web call.
//!
//! The handler runs in its own task. The response head is held back until the
//! handler produces its first message or finishes, so that a call failing early
//! can be answered trailers-only (gRPC) or with a bare end-of-stream (Connect).
use super::{
    Handler, HandlerSpec, RequestReader, ServerConfig, ServerContext, ServerInterceptorChain,
    ServerResponse, connect::parse_timeout, join, with_deadline,
};
use crate::{
    BoxError, Code, ConnectError, NetworkProtocol,
    compression::{CompressionPool, find_pool, negotiate, pool_names},
    envelope,
    http::{ChannelBody, FullBody},
    protocols::{
        CONNECT_ACCEPT_ENCODING, CONNECT_CONTENT_ENCODING, CONNECT_END_STREAM_FLAG,
        CONNECT_PROTOCOL_VERSION, CONNECT_PROTOCOL_VERSION_VALUE, CONTENT_TYPE, EndStreamPayload,
        ErrorPayload, GRPC_ACCEPT_ENCODING, GRPC_ENCODING, GRPC_TIMEOUT, GRPC_WEB_TRAILERS_FLAG,
        decode_grpc_timeout, encode_trailers_block, header_str, headers_to_metadata, insert,
        write_status,
    },
};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, request::Parts};
use http_body::{Body as HttpBody, Frame};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

const RESPONSE_BUFFER: usize = 16;

/// Protocol specific framing of a streamed response.
struct ResponseWriter {
    protocol: NetworkProtocol,
    encoding: String,
    pool: Option<Arc<dyn CompressionPool>>,
    min_bytes: usize,
}

impl ResponseWriter {
    fn content_type(&self) -> String {
        match self.protocol {
            NetworkProtocol::Connect => format!("application/connect+{}", self.encoding),
            NetworkProtocol::Grpc => format!("application/grpc+{}", self.encoding),
            NetworkProtocol::GrpcWeb => format!("application/grpc-web+{}", self.encoding),
        }
    }

    fn compression_header(&self) -> HeaderName {
        match self.protocol {
            NetworkProtocol::Connect => CONNECT_CONTENT_ENCODING,
            NetworkProtocol::Grpc | NetworkProtocol::GrpcWeb => GRPC_ENCODING,
        }
    }

    fn head(&self, ctx_headers: HeaderMap) -> HeaderMap {
        let mut headers = ctx_headers;
        insert(&mut headers, CONTENT_TYPE, &self.content_type());
        if let Some(pool) = &self.pool {
            insert(&mut headers, self.compression_header(), pool.name());
        }
        headers
    }

    fn message(&self, message: &[u8]) -> Result<Bytes, ConnectError> {
        envelope::pack(message, self.pool.as_deref(), Some(self.min_bytes))
            .map_err(ConnectError::from)
    }

    /// The frame closing the response.
    fn end(
        &self,
        error: Option<&ConnectError>,
        trailers: HeaderMap,
    ) -> Result<Frame<Bytes>, ConnectError> {
        Ok(match self.protocol {
            NetworkProtocol::Connect => Frame::data(end_stream_frame(error, trailers)?),
            NetworkProtocol::Grpc => Frame::trailers(status_trailers(error, trailers)),
            NetworkProtocol::GrpcWeb => {
                let block = encode_trailers_block(&status_trailers(error, trailers));
                Frame::data(envelope::pack_with_flags(&block, GRPC_WEB_TRAILERS_FLAG)?)
            }
        })
    }
}

fn end_stream_frame(
    error: Option<&ConnectError>,
    mut trailers: HeaderMap,
) -> Result<Bytes, ConnectError> {
    if let Some(error) = error {
        trailers.extend(error.metadata.clone());
    }
    let payload = EndStreamPayload {
        error: error.map(ErrorPayload::from_error),
        metadata: (!trailers.is_empty()).then(|| headers_to_metadata(&trailers)),
    };
    let json = serde_json::to_vec(&payload).unwrap_or_else(|_| b"{}".to_vec());
    Ok(envelope::pack_with_flags(&json, CONNECT_END_STREAM_FLAG)?)
}

fn status_trailers(error: Option<&ConnectError>, mut trailers: HeaderMap) -> HeaderMap {
    if let Some(error) = error {
        trailers.extend(error.metadata.clone());
    }
    write_status(&mut trailers, error);
    trailers
}

/// Answers a call that failed before its handler ran.
pub(super) fn immediate_error(
    protocol: NetworkProtocol,
    encoding: &str,
    error: &ConnectError,
) -> ServerResponse {
    let writer = ResponseWriter {
        protocol,
        encoding: encoding.to_string(),
        pool: None,
        min_bytes: 0,
    };
    finished_response(&writer, HeaderMap::new(), Some(error), HeaderMap::new())
}

/// A response for a call that produced no message: trailers-only for gRPC and
/// gRPC-Web, a lone end-of-stream message for Connect.
fn finished_response(
    writer: &ResponseWriter,
    headers: HeaderMap,
    error: Option<&ConnectError>,
    trailers: HeaderMap,
) -> ServerResponse {
    let mut headers = writer.head(headers);
    let body = match writer.protocol {
        NetworkProtocol::Connect => end_stream_frame(error, trailers).unwrap_or_else(|err| {
            warn!(error = %err, "dropping end-of-stream message");
            Bytes::new()
        }),
        NetworkProtocol::Grpc | NetworkProtocol::GrpcWeb => {
            headers.extend(status_trailers(error, trailers));
            Bytes::new()
        }
    };
    let mut response = http::Response::new(tonic::body::Body::new(FullBody::new(body)));
    *response.headers_mut() = headers;
    response
}

fn request_settings(
    config: &ServerConfig,
    protocol: NetworkProtocol,
    headers: &HeaderMap,
) -> Result<(Option<Arc<dyn CompressionPool>>, Option<Duration>), ConnectError> {
    let (encoding_header, timeout) = match protocol {
        NetworkProtocol::Connect => {
            if let Some(version) = header_str(headers, &CONNECT_PROTOCOL_VERSION) {
                if version != CONNECT_PROTOCOL_VERSION_VALUE {
                    return Err(ConnectError::new(Code::InvalidArgument).with_message(format!(
                        "connect-protocol-version must be \"{CONNECT_PROTOCOL_VERSION_VALUE}\": got \"{version}\""
                    )));
                }
            }
            (CONNECT_CONTENT_ENCODING, parse_timeout(headers)?)
        }
        NetworkProtocol::Grpc | NetworkProtocol::GrpcWeb => {
            let timeout = match header_str(headers, &GRPC_TIMEOUT) {
                None => None,
                Some(value) => Some(decode_grpc_timeout(value).ok_or_else(|| {
                    ConnectError::new(Code::InvalidArgument)
                        .with_message(format!("invalid grpc-timeout \"{value}\""))
                })?),
            };
            (GRPC_ENCODING, timeout)
        }
    };

    let pool = match header_str(headers, &encoding_header) {
        None | Some("") | Some("identity") => None,
        Some(name) => Some(find_pool(&config.compression_pools, name).ok_or_else(|| {
            ConnectError::new(Code::Unimplemented).with_message(format!(
                "unknown compression \"{name}\": supported encodings are {}",
                pool_names(&config.compression_pools)
            ))
        })?),
    };
    Ok((pool, timeout))
}

/// Serves an enveloped call.
pub(super) async fn serve<B>(
    config: &ServerConfig,
    protocol: NetworkProtocol,
    parts: Parts,
    body: B,
    spec: HandlerSpec,
) -> ServerResponse
where
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError> + Send,
{
    let accept_header = match protocol {
        NetworkProtocol::Connect => CONNECT_ACCEPT_ENCODING,
        NetworkProtocol::Grpc | NetworkProtocol::GrpcWeb => GRPC_ACCEPT_ENCODING,
    };
    let response_pool = if config.compress_responses {
        negotiate(
            &config.compression_pools,
            header_str(&parts.headers, &accept_header),
        )
    } else {
        None
    };
    let writer = ResponseWriter {
        protocol,
        encoding: spec.encoding.to_string(),
        pool: response_pool,
        min_bytes: config.compression_min_bytes,
    };
    let interceptors = ServerInterceptorChain::new(config);

    let settings = interceptors
        .request(&spec.procedure, parts.headers)
        .and_then(|headers| {
            let settings = request_settings(config, protocol, &headers)?;
            Ok((headers, settings))
        });
    let (headers, (request_pool, timeout)) = match settings {
        Ok(settings) => settings,
        Err(error) => {
            debug!(procedure = %spec.procedure, code = %error.code, "rejecting stream");
            let error = interceptors.response_error(error);
            return finished_response(&writer, HeaderMap::new(), Some(&error), HeaderMap::new());
        }
    };

    let ctx = ServerContext::new(spec.procedure.clone(), protocol, headers, timeout);
    let reader = RequestReader::new(body, request_pool, config.read_max_bytes)
        .with_interceptors(interceptors.clone());
    let (out_tx, mut out_rx) = mpsc::channel(RESPONSE_BUFFER);
    let task = tokio::spawn(run_handler(spec.handler, ctx.clone(), reader, out_tx, timeout));

    let Some(first) = out_rx.recv().await else {
        let result = join(task).await.map_err(|error| interceptors.response_error(error));
        if let Err(error) = &result {
            debug!(procedure = %spec.procedure, code = %error.code, "stream failed before responding");
        }
        return finished_response(
            &writer,
            ctx.response_headers(),
            result.as_ref().err(),
            ctx.response_trailers(),
        );
    };

    let headers = writer.head(ctx.response_headers());
    let (frame_tx, frame_rx) = mpsc::channel(RESPONSE_BUFFER);
    let procedure = spec.procedure;
    tokio::spawn(async move {
        let mut next = Some(first);
        while let Some(message) = next {
            let message = interceptors.response_message(message);
            let frame = match writer.message(&message) {
                Ok(frame) => frame,
                Err(error) => {
                    task.abort();
                    let error = interceptors.response_error(error);
                    if let Ok(end) = writer.end(Some(&error), ctx.response_trailers()) {
                        let _ = frame_tx.send(end).await;
                    }
                    return;
                }
            };
            if frame_tx.send(Frame::data(frame)).await.is_err() {
                debug!(%procedure, "client went away, canceling handler");
                task.abort();
                return;
            }
            next = tokio::select! {
                message = out_rx.recv() => message,
                _ = frame_tx.closed() => {
                    debug!(%procedure, "client went away, canceling handler");
                    task.abort();
                    return;
                }
            };
        }

        let result = join(task).await.map_err(|error| interceptors.response_error(error));
        trace!(%procedure, ok = result.is_ok(), "stream finished");
        match writer.end(result.as_ref().err(), ctx.response_trailers()) {
            Ok(end) => {
                let _ = frame_tx.send(end).await;
            }
            Err(err) => warn!(%procedure, error = %err, "dropping the end of the stream"),
        }
    });

    let mut response = http::Response::new(tonic::body::Body::new(ChannelBody::new(frame_rx)));
    *response.headers_mut() = headers;
    response
}

async fn run_handler<B>(
    handler: Handler,
    ctx: ServerContext,
    mut reader: RequestReader<B>,
    out: mpsc::Sender<Bytes>,
    timeout: Option<Duration>,
) -> Result<(), ConnectError>
where
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError> + Send,
{
    let call = async move {
        match handler {
            Handler::Unary(handler) => {
                let request = reader.single_message().await?;
                let response = handler(ctx, request).await?;
                send_response(&out, response).await
            }
            Handler::ServerStreaming(handler) => {
                let request = reader.single_message().await?;
                handler(ctx, request, out).await
            }
            Handler::ClientStreaming(handler) => {
                let response = handler(ctx, reader.spawn()).await?;
                send_response(&out, response).await
            }
            Handler::BidiStreaming(handler) => handler(ctx, reader.spawn(), out).await,
        }
    };
    with_deadline(timeout, call).await
}

async fn send_response(out: &mpsc::Sender<Bytes>, response: Bytes) -> Result<(), ConnectError> {
    out.send(response)
        .await
        .map_err(|_| ConnectError::new(Code::Canceled).with_message("client disconnected"))
}
