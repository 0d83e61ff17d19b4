use crate::NetworkProtocol;
use http::{HeaderMap, HeaderName, HeaderValue};
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

/// What a handler knows about the call it serves.
///
/// Cloning is cheap; clones share the response metadata, so headers and trailers
/// may be set from any task spawned by the handler. Response headers are sent with
/// the first response message, so later changes to them are lost.
#[derive(Debug, Clone)]
pub struct ServerContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    procedure: String,
    protocol: NetworkProtocol,
    request_headers: HeaderMap,
    timeout: Option<Duration>,
    response: Mutex<ResponseMetadata>,
}

#[derive(Debug, Default)]
struct ResponseMetadata {
    headers: HeaderMap,
    trailers: HeaderMap,
}

impl ServerContext {
    pub(crate) fn new(
        procedure: String,
        protocol: NetworkProtocol,
        request_headers: HeaderMap,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                procedure,
                protocol,
                request_headers,
                timeout,
                response: Mutex::default(),
            }),
        }
    }

    /// The called procedure, e.g. `connectrpc.eliza.v1.ElizaService/Say`.
    pub fn procedure(&self) -> &str {
        &self.inner.procedure
    }

    /// The protocol the client speaks.
    pub fn protocol(&self) -> NetworkProtocol {
        self.inner.protocol
    }

    pub fn request_headers(&self) -> &HeaderMap {
        &self.inner.request_headers
    }

    /// The deadline requested by the client, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    pub fn append_response_header(&self, name: HeaderName, value: HeaderValue) {
        self.lock().headers.append(name, value);
    }

    pub fn append_response_trailer(&self, name: HeaderName, value: HeaderValue) {
        self.lock().trailers.append(name, value);
    }

    pub fn response_headers(&self) -> HeaderMap {
        self.lock().headers.clone()
    }

    pub fn response_trailers(&self) -> HeaderMap {
        self.lock().trailers.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ResponseMetadata> {
        self.inner
            .response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
