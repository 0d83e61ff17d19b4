use super::{ServerInterceptorChain, handler::RequestReceiver};
use crate::{
    BoxError, Code, ConnectError,
    compression::{CompressionError, CompressionPool},
    envelope::{self, EnvelopeDecoder, EnvelopeError},
};
use bytes::{Bytes, BytesMut};
use http_body::Body as HttpBody;
use std::{future::poll_fn, pin::Pin, sync::Arc};
use tokio::sync::mpsc;
use tracing::debug;

/// Reads request messages from an incoming body.
pub(crate) struct RequestReader<B> {
    body: Pin<Box<B>>,
    decoder: EnvelopeDecoder,
    pool: Option<Arc<dyn CompressionPool>>,
    read_max_bytes: Option<usize>,
    interceptors: ServerInterceptorChain,
}

pub(crate) fn too_large(limit: usize) -> ConnectError {
    ConnectError::new(Code::ResourceExhausted)
        .with_message(format!("message is larger than configured max {limit}"))
}

fn envelope_error(err: EnvelopeError) -> ConnectError {
    match err {
        EnvelopeError::Compression(CompressionError::TooLarge { limit }) => too_large(limit),
        EnvelopeError::MissingCompression => ConnectError::from_source(Code::Internal, err),
        EnvelopeError::TooLarge { .. } => ConnectError::from_source(Code::ResourceExhausted, err),
        err => ConnectError::from_source(Code::InvalidArgument, err),
    }
}

impl<B> RequestReader<B>
where
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError> + Send,
{
    pub(crate) fn new(
        body: B,
        pool: Option<Arc<dyn CompressionPool>>,
        read_max_bytes: Option<usize>,
    ) -> Self {
        Self {
            body: Box::pin(body),
            decoder: EnvelopeDecoder::new(),
            pool,
            read_max_bytes,
            interceptors: ServerInterceptorChain::default(),
        }
    }

    /// Passes every request message through `interceptors`.
    pub(crate) fn with_interceptors(mut self, interceptors: ServerInterceptorChain) -> Self {
        self.interceptors = interceptors;
        self
    }

    /// The next data chunk of the body. Trailers are skipped.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ConnectError> {
        loop {
            let frame = poll_fn(|cx| self.body.as_mut().poll_frame(cx)).await;
            match frame {
                None => return Ok(None),
                Some(Err(err)) => {
                    return Err(ConnectError::from_boxed(Code::Canceled, err.into()));
                }
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        return Ok(Some(data));
                    }
                }
            }
        }
    }

    /// The whole body, as sent by Connect unary requests.
    pub(crate) async fn read_to_end(&mut self) -> Result<Bytes, ConnectError> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            buffer.extend_from_slice(&chunk);
            if let Some(limit) = self.read_max_bytes {
                if buffer.len() > limit {
                    return Err(too_large(limit));
                }
            }
        }
        Ok(buffer.freeze())
    }

    /// The next enveloped message, decompressed.
    pub(crate) async fn next_message(&mut self) -> Result<Option<Bytes>, ConnectError> {
        loop {
            if let (Some(limit), Some(len)) = (self.read_max_bytes, self.decoder.pending_len()) {
                if len > limit {
                    return Err(too_large(limit));
                }
            }
            if let Some(frame) = self.decoder.next_frame() {
                let (_, payload) =
                    envelope::unpack_limited(&frame, self.pool.as_deref(), self.read_max_bytes)
                        .map_err(envelope_error)?;
                return self.interceptors.request_message(payload).map(Some);
            }
            match self.next_chunk().await? {
                Some(chunk) => self.decoder.push(&chunk),
                None if self.decoder.remaining() == 0 => return Ok(None),
                None => {
                    return Err(ConnectError::new(Code::InvalidArgument).with_message(format!(
                        "protocol error: request body ended with {} bytes of an incomplete envelope",
                        self.decoder.remaining()
                    )));
                }
            }
        }
    }

    /// Exactly one message, for unary and server streaming calls.
    pub(crate) async fn single_message(&mut self) -> Result<Bytes, ConnectError> {
        let Some(message) = self.next_message().await? else {
            return Err(ConnectError::new(Code::InvalidArgument)
                .with_message("protocol error: missing request message"));
        };
        if self.next_message().await?.is_some() {
            return Err(ConnectError::new(Code::InvalidArgument)
                .with_message("protocol error: unary request has multiple messages"));
        }
        Ok(message)
    }

    /// Moves the reader to a task feeding a channel. A failure is the last item.
    pub(crate) fn spawn(mut self) -> RequestReceiver {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            loop {
                match self.next_message().await {
                    Ok(Some(message)) => {
                        if tx.send(Ok(message)).await.is_err() {
                            debug!("handler stopped reading requests");
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(error) => {
                        let _ = tx.send(Err(error)).await;
                        return;
                    }
                }
            }
        });
        rx
    }
}
