//! # Client Streams
//!
//! The handles returned by streaming calls. Each owns the call's interceptor
//! chain: outgoing messages are encoded then framed by the chain, incoming events
//! are unframed by the chain then decoded.
//!
//! Response events are processed lazily, when the caller asks for the next message,
//! the headers or the trailers. Asking for headers or trailers first buffers the
//! messages received meanwhile.
use super::{UnaryResponse, stream_ended_early};
use crate::{
    Code, CodecError, ConnectError,
    codec::Codec,
    http::{HttpStream, StreamResult},
    interceptor::InterceptorChain,
};
use bytes::Bytes;
use futures_util::Stream;
use http::HeaderMap;
use std::{collections::VecDeque, sync::Arc};

type Decoder<O> = Box<dyn Fn(Bytes) -> Result<O, CodecError> + Send + Sync>;

/// The response side of a stream, plus what is needed to keep sending.
struct ResponseReader<O> {
    decode: Decoder<O>,
    chain: InterceptorChain,
    http: HttpStream,
    headers: Option<HeaderMap>,
    trailers: Option<HeaderMap>,
    pending: VecDeque<O>,
    outcome: Option<Result<(), ConnectError>>,
    receive_closed: bool,
}

impl<O> ResponseReader<O> {
    async fn send_encoded(&mut self, encoded: Bytes) -> Result<(), ConnectError> {
        let framed = self.chain.stream_request_body(encoded)?;
        self.http.send(framed).await
    }

    fn close_receive(&mut self) {
        self.receive_closed = true;
        self.pending.clear();
        self.http.abort();
    }

    fn is_receive_closed(&self) -> bool {
        self.receive_closed || (self.outcome.is_some() && self.pending.is_empty())
    }

    async fn message(&mut self) -> Result<Option<O>, ConnectError> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Ok(Some(message));
            }
            if self.receive_closed {
                return Ok(None);
            }
            if self.outcome.is_some() {
                return match self.outcome.replace(Ok(())) {
                    Some(Err(error)) => Err(error),
                    _ => Ok(None),
                };
            }
            self.process_next().await;
        }
    }

    async fn response_headers(&mut self) -> &HeaderMap {
        while self.headers.is_none() && self.outcome.is_none() && !self.receive_closed {
            self.process_next().await;
        }
        self.headers.get_or_insert_with(HeaderMap::new)
    }

    async fn response_trailers(&mut self) -> &HeaderMap {
        while self.outcome.is_none() && !self.receive_closed {
            self.process_next().await;
        }
        self.trailers.get_or_insert_with(HeaderMap::new)
    }

    async fn process_next(&mut self) {
        let raw = self.http.recv().await.unwrap_or_else(stream_ended_early);
        match self.chain.stream_result(raw) {
            StreamResult::Headers(headers) => {
                self.headers.get_or_insert(headers);
            }
            StreamResult::Message(bytes) => {
                // A message before any headers means the headers were empty.
                self.headers.get_or_insert_with(HeaderMap::new);
                match (self.decode)(bytes) {
                    Ok(message) => self.pending.push_back(message),
                    Err(err) => self.finish(
                        Some(ConnectError::from_source(Code::Internal, err)),
                        HeaderMap::new(),
                    ),
                }
            }
            StreamResult::Complete { error, trailers } => self.finish(error, trailers),
        }
    }

    fn finish(&mut self, error: Option<ConnectError>, trailers: HeaderMap) {
        self.headers.get_or_insert_with(HeaderMap::new);
        self.trailers = Some(trailers);
        self.outcome = Some(match error {
            Some(error) => Err(error),
            None => Ok(()),
        });
        self.http.close_send();
    }

    fn into_stream(self) -> impl Stream<Item = Result<O, ConnectError>> {
        futures_util::stream::unfold(self, |mut reader| async move {
            match reader.message().await {
                Ok(Some(message)) => Some((Ok(message), reader)),
                Ok(None) => None,
                Err(error) => Some((Err(error), reader)),
            }
        })
    }
}

/// A bidirectional stream: any number of requests, any number of responses.
pub struct BidiStream<I, O> {
    codec: Arc<dyn Codec<Encode = I, Decode = O>>,
    reader: ResponseReader<O>,
}

impl<I, O> BidiStream<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub(crate) fn new(
        codec: Arc<dyn Codec<Encode = I, Decode = O>>,
        chain: InterceptorChain,
        http: HttpStream,
    ) -> Self {
        let decoding = codec.clone();
        Self {
            codec,
            reader: ResponseReader {
                decode: Box::new(move |bytes| decoding.decode(bytes)),
                chain,
                http,
                headers: None,
                trailers: None,
                pending: VecDeque::new(),
                outcome: None,
                receive_closed: false,
            },
        }
    }

    /// Sends a request message.
    pub async fn send(&mut self, message: &I) -> Result<(), ConnectError> {
        let encoded = self
            .codec
            .encode(message)
            .map_err(|err| ConnectError::from_source(Code::Internal, err))?;
        self.reader.send_encoded(encoded).await
    }

    /// Signals that no more requests will be sent.
    pub fn close_send(&mut self) {
        self.reader.http.close_send();
    }

    pub fn is_send_closed(&self) -> bool {
        self.reader.http.is_send_closed()
    }

    /// Cancels the call. Buffered and future responses are discarded.
    pub fn close_receive(&mut self) {
        self.reader.close_receive();
    }

    pub fn is_receive_closed(&self) -> bool {
        self.reader.is_receive_closed()
    }

    /// The next response message.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(message))` - A response message.
    /// * `Ok(None)` - The stream ended successfully, or was closed.
    /// * `Err(ConnectError)` - The stream failed. Reported once; later calls return `Ok(None)`.
    pub async fn message(&mut self) -> Result<Option<O>, ConnectError> {
        self.reader.message().await
    }

    /// The response headers, waiting for them if needed.
    pub async fn response_headers(&mut self) -> &HeaderMap {
        self.reader.response_headers().await
    }

    /// The response trailers, waiting for the end of the stream if needed.
    pub async fn response_trailers(&mut self) -> &HeaderMap {
        self.reader.response_trailers().await
    }

    /// Turns the response side into a `futures` stream. Sending is no longer possible.
    pub fn into_stream(self) -> impl Stream<Item = Result<O, ConnectError>> {
        self.reader.into_stream()
    }
}

/// A server streaming call whose request has been sent.
pub struct ServerStream<O> {
    reader: ResponseReader<O>,
}

impl<O: Send + 'static> ServerStream<O> {
    pub(crate) fn new<I>(stream: BidiStream<I, O>) -> Self {
        Self {
            reader: stream.reader,
        }
    }

    /// See [`BidiStream::message`].
    pub async fn message(&mut self) -> Result<Option<O>, ConnectError> {
        self.reader.message().await
    }

    pub async fn response_headers(&mut self) -> &HeaderMap {
        self.reader.response_headers().await
    }

    pub async fn response_trailers(&mut self) -> &HeaderMap {
        self.reader.response_trailers().await
    }

    pub fn close_receive(&mut self) {
        self.reader.close_receive();
    }

    pub fn is_receive_closed(&self) -> bool {
        self.reader.is_receive_closed()
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<O, ConnectError>> {
        self.reader.into_stream()
    }
}

/// A client streaming call: many requests, exactly one response.
pub struct ClientStream<I, O> {
    inner: BidiStream<I, O>,
}

impl<I, O> ClientStream<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub(crate) fn new(inner: BidiStream<I, O>) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, message: &I) -> Result<(), ConnectError> {
        self.inner.send(message).await
    }

    pub fn is_send_closed(&self) -> bool {
        self.inner.is_send_closed()
    }

    /// Cancels the call.
    pub fn cancel(&mut self) {
        self.inner.close_receive();
    }

    /// Closes the request side and waits for the response.
    ///
    /// # Returns
    ///
    /// * `Ok(UnaryResponse)` - The single response message.
    /// * `Err(ConnectError)` - The call failed, returned no message (`unknown`), or
    ///   returned more than one (`unimplemented`). A failure reported by the server
    ///   takes precedence.
    pub async fn close_and_receive(mut self) -> Result<UnaryResponse<O>, ConnectError> {
        self.inner.close_send();

        let mut first = None;
        let mut count = 0usize;
        while let Some(message) = self.inner.message().await? {
            count += 1;
            if first.is_none() {
                first = Some(message);
            }
        }

        let reader = &mut self.inner.reader;
        let headers = reader.headers.take().unwrap_or_default();
        let trailers = reader.trailers.take().unwrap_or_default();
        match first {
            None => Err(ConnectError::new(Code::Unknown)
                .with_message("missing response message")
                .with_metadata(trailers)),
            Some(_) if count > 1 => Err(ConnectError::new(Code::Unimplemented)
                .with_message(format!("unary stream has {count} response messages"))
                .with_metadata(trailers)),
            Some(message) => Ok(UnaryResponse {
                message,
                headers,
                trailers,
            }),
        }
    }
}
