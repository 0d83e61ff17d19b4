//! # Handlers
//!
//! A [`HandlerSpec`] binds a procedure to an async function. The typed
//! constructors wrap the function with its [`Codec`] so that the server itself
//! only moves bytes around.
use super::ServerContext;
use crate::{Code, CodecError, ConnectError, Idempotency, StreamType, codec::Codec};
use bytes::Bytes;
use futures_util::{Stream, future::BoxFuture};
use std::{fmt, future::Future, sync::Arc};
use tokio::sync::mpsc;

pub(crate) type RequestReceiver = mpsc::Receiver<Result<Bytes, ConnectError>>;

type UnaryFn =
    dyn Fn(ServerContext, Bytes) -> BoxFuture<'static, Result<Bytes, ConnectError>> + Send + Sync;
type ServerStreamingFn = dyn Fn(ServerContext, Bytes, mpsc::Sender<Bytes>) -> BoxFuture<'static, Result<(), ConnectError>>
    + Send
    + Sync;
type ClientStreamingFn = dyn Fn(ServerContext, RequestReceiver) -> BoxFuture<'static, Result<Bytes, ConnectError>>
    + Send
    + Sync;
type BidiStreamingFn = dyn Fn(
        ServerContext,
        RequestReceiver,
        mpsc::Sender<Bytes>,
    ) -> BoxFuture<'static, Result<(), ConnectError>>
    + Send
    + Sync;

/// A handler with its codec erased.
#[derive(Clone)]
pub(crate) enum Handler {
    Unary(Arc<UnaryFn>),
    ServerStreaming(Arc<ServerStreamingFn>),
    ClientStreaming(Arc<ClientStreamingFn>),
    BidiStreaming(Arc<BidiStreamingFn>),
}

/// A procedure served by a [`ConnectServer`](crate::ConnectServer).
#[derive(Clone)]
pub struct HandlerSpec {
    pub(crate) procedure: String,
    pub(crate) stream_type: StreamType,
    pub(crate) idempotency: Idempotency,
    pub(crate) encoding: &'static str,
    pub(crate) handler: Handler,
}

fn decode_error(err: CodecError) -> ConnectError {
    ConnectError::from_source(Code::InvalidArgument, err)
}

fn encode_error(err: CodecError) -> ConnectError {
    ConnectError::from_source(Code::Internal, err)
}

impl HandlerSpec {
    fn new(
        procedure: impl Into<String>,
        stream_type: StreamType,
        encoding: &'static str,
        handler: Handler,
    ) -> Self {
        Self {
            procedure: procedure.into().trim_start_matches('/').to_string(),
            stream_type,
            idempotency: Idempotency::Unknown,
            encoding,
            handler,
        }
    }

    /// A single request, single response procedure.
    pub fn unary<C, F, Fut>(procedure: impl Into<String>, codec: C, handler: F) -> Self
    where
        C: Codec,
        F: Fn(ServerContext, C::Decode) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C::Encode, ConnectError>> + Send + 'static,
    {
        let encoding = codec.encoding_name();
        let codec = Arc::new(codec);
        let handler = Arc::new(handler);
        let erased: Arc<UnaryFn> = Arc::new(move |ctx, bytes| {
            let codec = codec.clone();
            let handler = handler.clone();
            Box::pin(async move {
                let request = codec.decode(bytes).map_err(decode_error)?;
                let response = handler(ctx, request).await?;
                codec.encode(&response).map_err(encode_error)
            })
        });
        Self::new(procedure, StreamType::Unary, encoding, Handler::Unary(erased))
    }

    /// A single request, many responses procedure.
    pub fn server_streaming<C, F, Fut>(procedure: impl Into<String>, codec: C, handler: F) -> Self
    where
        C: Codec,
        F: Fn(ServerContext, C::Decode, ResponseStream<C::Encode>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ConnectError>> + Send + 'static,
    {
        let encoding = codec.encoding_name();
        let codec = Arc::new(codec);
        let handler = Arc::new(handler);
        let erased: Arc<ServerStreamingFn> = Arc::new(move |ctx, bytes, tx| {
            let codec = codec.clone();
            let handler = handler.clone();
            Box::pin(async move {
                let request = codec.decode(bytes).map_err(decode_error)?;
                handler(ctx, request, ResponseStream::new(tx, codec)).await
            })
        });
        Self::new(
            procedure,
            StreamType::Server,
            encoding,
            Handler::ServerStreaming(erased),
        )
    }

    /// A many requests, single response procedure.
    pub fn client_streaming<C, F, Fut>(procedure: impl Into<String>, codec: C, handler: F) -> Self
    where
        C: Codec,
        F: Fn(ServerContext, RequestStream<C::Decode>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C::Encode, ConnectError>> + Send + 'static,
    {
        let encoding = codec.encoding_name();
        let codec = Arc::new(codec);
        let handler = Arc::new(handler);
        let erased: Arc<ClientStreamingFn> = Arc::new(move |ctx, rx| {
            let codec = codec.clone();
            let handler = handler.clone();
            Box::pin(async move {
                let response = handler(ctx, RequestStream::new(rx, codec.clone())).await?;
                codec.encode(&response).map_err(encode_error)
            })
        });
        Self::new(
            procedure,
            StreamType::Client,
            encoding,
            Handler::ClientStreaming(erased),
        )
    }

    /// A many requests, many responses procedure.
    pub fn bidi_streaming<C, F, Fut>(procedure: impl Into<String>, codec: C, handler: F) -> Self
    where
        C: Codec,
        F: Fn(ServerContext, RequestStream<C::Decode>, ResponseStream<C::Encode>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<(), ConnectError>> + Send + 'static,
    {
        let encoding = codec.encoding_name();
        let codec = Arc::new(codec);
        let handler = Arc::new(handler);
        let erased: Arc<BidiStreamingFn> = Arc::new(move |ctx, rx, tx| {
            let codec = codec.clone();
            let handler = handler.clone();
            Box::pin(async move {
                let requests = RequestStream::new(rx, codec.clone());
                handler(ctx, requests, ResponseStream::new(tx, codec)).await
            })
        });
        Self::new(
            procedure,
            StreamType::Bidi,
            encoding,
            Handler::BidiStreaming(erased),
        )
    }

    /// Marks the procedure side-effect free, allowing Connect GET requests.
    pub fn with_idempotency(mut self, idempotency: Idempotency) -> Self {
        self.idempotency = idempotency;
        self
    }

    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn idempotency(&self) -> Idempotency {
        self.idempotency
    }

    /// The codec name requests must be encoded with, e.g. `proto`.
    pub fn encoding(&self) -> &'static str {
        self.encoding
    }
}

impl fmt::Debug for HandlerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSpec")
            .field("procedure", &self.procedure)
            .field("stream_type", &self.stream_type)
            .field("idempotency", &self.idempotency)
            .field("encoding", &self.encoding)
            .finish_non_exhaustive()
    }
}

/// The request messages of a client or bidi streaming call.
pub struct RequestStream<I> {
    rx: RequestReceiver,
    decode: Box<dyn Fn(Bytes) -> Result<I, CodecError> + Send + Sync>,
}

impl<I: Send + 'static> RequestStream<I> {
    fn new<C>(rx: RequestReceiver, codec: Arc<C>) -> Self
    where
        C: Codec<Decode = I>,
    {
        Self {
            rx,
            decode: Box::new(move |bytes| codec.decode(bytes)),
        }
    }

    /// The next request message.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(message))` - A request message.
    /// * `Ok(None)` - The client closed its side of the stream.
    /// * `Err(ConnectError)` - The request body was malformed or could not be read.
    pub async fn message(&mut self) -> Result<Option<I>, ConnectError> {
        match self.rx.recv().await {
            None => Ok(None),
            Some(Err(error)) => Err(error),
            Some(Ok(bytes)) => (self.decode)(bytes).map(Some).map_err(decode_error),
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<I, ConnectError>> {
        futures_util::stream::unfold(self, |mut requests| async move {
            match requests.message().await {
                Ok(Some(message)) => Some((Ok(message), requests)),
                Ok(None) => None,
                Err(error) => Some((Err(error), requests)),
            }
        })
    }
}

/// The sending half of a server or bidi streaming call.
pub struct ResponseStream<O> {
    tx: mpsc::Sender<Bytes>,
    encode: Box<dyn Fn(&O) -> Result<Bytes, CodecError> + Send + Sync>,
}

impl<O: 'static> ResponseStream<O> {
    fn new<C>(tx: mpsc::Sender<Bytes>, codec: Arc<C>) -> Self
    where
        C: Codec<Encode = O>,
    {
        Self {
            tx,
            encode: Box::new(move |message| codec.encode(message)),
        }
    }

    /// Sends a response message, waiting while the client is slow to read.
    ///
    /// Fails with `canceled` once the client has gone away.
    pub async fn send(&self, message: &O) -> Result<(), ConnectError> {
        let encoded = (self.encode)(message).map_err(encode_error)?;
        self.tx.send(encoded).await.map_err(|_| {
            ConnectError::new(Code::Canceled).with_message("client disconnected")
        })
    }
}
