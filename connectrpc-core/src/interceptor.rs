//! # Interceptors
//!
//! An [`Interceptor`] observes and rewrites a single call at the HTTP level. A fresh
//! set of interceptors is created for every call from the
//! [`InterceptorFactory`]s registered on the
//! [`ProtocolClientConfig`](crate::ProtocolClientConfig), so an interceptor may keep
//! per-call state in `&mut self`.
//!
//! The wire protocol itself (Connect, gRPC, gRPC-Web) is implemented as the last
//! interceptor of every chain. Outgoing data flows through the chain in
//! registration order, incoming data in reverse order, so user interceptors always
//! see protocol-neutral messages on the way in and on the way out.
use crate::{
    ConnectError, ProtocolClientConfig,
    http::{HttpRequest, HttpResponse, StreamResult, UnaryHttpRequest},
};
use bytes::Bytes;
use std::sync::Arc;

/// Hooks invoked around a single call. Every hook defaults to passing its input through.
pub trait Interceptor: Send {
    fn unary_request(&mut self, request: UnaryHttpRequest) -> Result<UnaryHttpRequest, ConnectError> {
        Ok(request)
    }

    fn unary_response(&mut self, response: HttpResponse) -> HttpResponse {
        response
    }

    fn stream_request(&mut self, request: HttpRequest) -> HttpRequest {
        request
    }

    /// Invoked for each outgoing message of a stream.
    fn stream_request_body(&mut self, body: Bytes) -> Result<Bytes, ConnectError> {
        Ok(body)
    }

    fn stream_result(&mut self, result: StreamResult<Bytes>) -> StreamResult<Bytes> {
        result
    }
}

/// Creates the interceptor instance of one call.
pub type InterceptorFactory =
    Arc<dyn Fn(&ProtocolClientConfig) -> Box<dyn Interceptor> + Send + Sync>;

/// The interceptors of one call, applied as a unit.
pub struct InterceptorChain {
    interceptors: Vec<Box<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<Box<dyn Interceptor>>) -> Self {
        Self { interceptors }
    }

    pub fn unary_request(
        &mut self,
        request: UnaryHttpRequest,
    ) -> Result<UnaryHttpRequest, ConnectError> {
        self.interceptors
            .iter_mut()
            .try_fold(request, |request, interceptor| interceptor.unary_request(request))
    }

    pub fn unary_response(&mut self, response: HttpResponse) -> HttpResponse {
        self.interceptors
            .iter_mut()
            .rev()
            .fold(response, |response, interceptor| interceptor.unary_response(response))
    }

    pub fn stream_request(&mut self, request: HttpRequest) -> HttpRequest {
        self.interceptors
            .iter_mut()
            .fold(request, |request, interceptor| interceptor.stream_request(request))
    }

    pub fn stream_request_body(&mut self, body: Bytes) -> Result<Bytes, ConnectError> {
        self.interceptors
            .iter_mut()
            .try_fold(body, |body, interceptor| interceptor.stream_request_body(body))
    }

    pub fn stream_result(&mut self, result: StreamResult<Bytes>) -> StreamResult<Bytes> {
        self.interceptors
            .iter_mut()
            .rev()
            .fold(result, |result, interceptor| interceptor.stream_result(result))
    }
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("len", &self.interceptors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MethodSpec;
    use http::{HeaderMap, HeaderValue, Method};
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn record(&self, hook: &str) {
            self.log.lock().unwrap().push(format!("{}:{hook}", self.name));
        }
    }

    impl Interceptor for Recorder {
        fn unary_request(
            &mut self,
            mut request: UnaryHttpRequest,
        ) -> Result<UnaryHttpRequest, ConnectError> {
            self.record("request");
            request
                .head
                .headers
                .append("x-seen-by", HeaderValue::from_static(self.name));
            Ok(request)
        }

        fn unary_response(&mut self, response: HttpResponse) -> HttpResponse {
            self.record("response");
            response
        }

        fn stream_request_body(&mut self, body: Bytes) -> Result<Bytes, ConnectError> {
            self.record("body");
            let mut next = body.to_vec();
            next.extend_from_slice(self.name.as_bytes());
            Ok(Bytes::from(next))
        }

        fn stream_result(&mut self, result: StreamResult<Bytes>) -> StreamResult<Bytes> {
            self.record("result");
            result
        }
    }

    fn chain(log: &Arc<Mutex<Vec<String>>>) -> InterceptorChain {
        InterceptorChain::new(vec![
            Box::new(Recorder {
                name: "a",
                log: log.clone(),
            }),
            Box::new(Recorder {
                name: "b",
                log: log.clone(),
            }),
        ])
    }

    fn request() -> UnaryHttpRequest {
        UnaryHttpRequest {
            head: HttpRequest {
                method: Method::POST,
                url: "http://localhost/svc/Method".parse().unwrap(),
                content_type: "application/proto".to_string(),
                encoding: "proto",
                headers: HeaderMap::new(),
                spec: MethodSpec::unary("svc/Method"),
                timeout: None,
            },
            message: Bytes::new(),
        }
    }

    #[test]
    fn requests_run_in_order_and_responses_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = chain(&log);

        let request = chain.unary_request(request()).unwrap();
        let seen: Vec<_> = request.head.headers.get_all("x-seen-by").iter().collect();
        assert_eq!(seen, vec!["a", "b"]);
        chain.unary_response(HttpResponse::default());

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:request", "b:request", "b:response", "a:response"]
        );
    }

    #[test]
    fn stream_hooks_follow_the_same_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = chain(&log);

        let body = chain.stream_request_body(Bytes::from_static(b">")).unwrap();
        assert_eq!(body.as_ref(), b">ab");
        chain.stream_result(StreamResult::Headers(HeaderMap::new()));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:body", "b:body", "b:result", "a:result"]
        );
    }
}
