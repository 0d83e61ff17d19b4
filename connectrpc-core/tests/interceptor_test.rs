use bytes::Bytes;
use connectrpc_core::{
    CallOptions, Code, ConnectError, ConnectServer, Interceptor, MethodSpec, NetworkProtocol,
    ProtoCodec, ProtocolClient, ProtocolClientConfig, ServerConfig, ServerInterceptor,
    ServerInterceptorFactory,
    http::{HttpRequest, HttpResponse, StreamResult, UnaryHttpRequest},
};
use eliza_service::{
    Encoding, INTRODUCE, SAY,
    pb::{IntroduceRequest, IntroduceResponse, SayRequest, SayResponse},
};
use http::{HeaderMap, HeaderName, HeaderValue};
use std::sync::{Arc, Mutex};
use support::{HOST, PROTOCOLS, client_with, eliza_server};

mod support;

/// Tags requests with `x-echo` and records what it sees on the way back.
struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Interceptor for Recorder {
    fn unary_request(
        &mut self,
        mut request: UnaryHttpRequest,
    ) -> Result<UnaryHttpRequest, ConnectError> {
        request
            .head
            .headers
            .insert("x-echo", HeaderValue::from_static("intercepted"));
        self.events.lock().unwrap().push("unary request".to_string());
        Ok(request)
    }

    fn unary_response(&mut self, response: HttpResponse) -> HttpResponse {
        self.events
            .lock()
            .unwrap()
            .push(format!("unary response {}", response.cause.is_none()));
        response
    }

    fn stream_request(&mut self, request: HttpRequest) -> HttpRequest {
        self.events
            .lock()
            .unwrap()
            .push(format!("stream request {}", request.spec.method_name()));
        request
    }

    fn stream_result(&mut self, result: StreamResult<Bytes>) -> StreamResult<Bytes> {
        let event = match &result {
            StreamResult::Headers(_) => "headers",
            StreamResult::Message(_) => "message",
            StreamResult::Complete { error: None, .. } => "complete",
            StreamResult::Complete { error: Some(_), .. } => "failed",
        };
        self.events.lock().unwrap().push(event.to_string());
        result
    }
}

fn recording_client(
    protocol: NetworkProtocol,
) -> (ProtocolClient<ConnectServer>, Arc<Mutex<Vec<String>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let recorded = events.clone();
    let client = client_with(
        eliza_server(Encoding::Proto),
        ProtocolClientConfig::builder(HOST)
            .protocol(protocol)
            .interceptor(move |_config| {
                Box::new(Recorder {
                    events: recorded.clone(),
                })
            }),
    );
    (client, events)
}

#[tokio::test]
async fn test_unary_interceptor_sees_request_and_response() {
    for protocol in PROTOCOLS {
        let (client, events) = recording_client(protocol);
        let response = client
            .unary(
                &MethodSpec::unary(SAY),
                ProtoCodec::<SayRequest, SayResponse>::new(),
                SayRequest {
                    sentence: "hello".to_string(),
                },
                CallOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(response.headers["x-echo"], "intercepted", "{protocol:?}");
        assert_eq!(
            *events.lock().unwrap(),
            ["unary request", "unary response true"]
        );
    }
}

#[tokio::test]
async fn test_stream_interceptor_sees_unframed_events() {
    for protocol in PROTOCOLS {
        let (client, events) = recording_client(protocol);
        let mut stream = client
            .server_stream(
                &MethodSpec::server_streaming(INTRODUCE),
                ProtoCodec::<IntroduceRequest, IntroduceResponse>::new(),
                IntroduceRequest {
                    name: "Ada".to_string(),
                },
                CallOptions::new(),
            )
            .await
            .unwrap();
        while stream.message().await.unwrap().is_some() {}

        assert_eq!(
            *events.lock().unwrap(),
            [
                "stream request Introduce",
                "headers",
                "message",
                "message",
                "message",
                "complete"
            ],
            "{protocol:?}"
        );
    }
}

/// Records the hooks of every served call, and rejects calls carrying `x-deny`.
struct ServerRecorder {
    name: &'static str,
    events: Arc<Mutex<Vec<String>>>,
}

impl ServerRecorder {
    fn record(&self, event: impl std::fmt::Display) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{}: {event}", self.name));
    }
}

impl ServerInterceptor for ServerRecorder {
    fn request(&mut self, procedure: &str, headers: HeaderMap) -> Result<HeaderMap, ConnectError> {
        self.record(format_args!("request {procedure}"));
        if headers.contains_key("x-deny") {
            return Err(ConnectError::new(Code::PermissionDenied).with_message("denied"));
        }
        Ok(headers)
    }

    fn request_message(&mut self, message: Bytes) -> Result<Bytes, ConnectError> {
        self.record("request message");
        Ok(message)
    }

    fn response_message(&mut self, message: Bytes) -> Bytes {
        self.record("response message");
        message
    }

    fn response_error(&mut self, error: ConnectError) -> ConnectError {
        self.record(format_args!("error {}", error.code));
        error
    }
}

fn intercepted_client(
    protocol: NetworkProtocol,
) -> (ProtocolClient<ConnectServer>, Arc<Mutex<Vec<String>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let factory = |name: &'static str| -> ServerInterceptorFactory {
        let events = events.clone();
        Arc::new(move |_config: &ServerConfig| {
            Box::new(ServerRecorder {
                name,
                events: events.clone(),
            }) as Box<dyn ServerInterceptor>
        })
    };
    let config = ServerConfig::default().with_interceptors(vec![factory("outer"), factory("inner")]);
    let server = ConnectServer::new(config).register_all(eliza_service::handlers(Encoding::Proto));
    let client = client_with(server, ProtocolClientConfig::builder(HOST).protocol(protocol));
    (client, events)
}

#[tokio::test]
async fn test_server_interceptors_wrap_unary_calls() {
    for protocol in PROTOCOLS {
        let (client, events) = intercepted_client(protocol);
        client
            .unary(
                &MethodSpec::unary(SAY),
                ProtoCodec::<SayRequest, SayResponse>::new(),
                SayRequest {
                    sentence: "hello".to_string(),
                },
                CallOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            [
                format!("outer: request {SAY}"),
                format!("inner: request {SAY}"),
                "outer: request message".to_string(),
                "inner: request message".to_string(),
                "inner: response message".to_string(),
                "outer: response message".to_string(),
            ],
            "{protocol:?}"
        );
    }
}

#[tokio::test]
async fn test_server_interceptors_see_every_streamed_message() {
    for protocol in PROTOCOLS {
        let (client, events) = intercepted_client(protocol);
        let mut stream = client
            .server_stream(
                &MethodSpec::server_streaming(INTRODUCE),
                ProtoCodec::<IntroduceRequest, IntroduceResponse>::new(),
                IntroduceRequest {
                    name: "Ada".to_string(),
                },
                CallOptions::new(),
            )
            .await
            .unwrap();
        while stream.message().await.unwrap().is_some() {}

        let events = events.lock().unwrap();
        assert_eq!(events[0], format!("outer: request {INTRODUCE}"), "{protocol:?}");
        assert_eq!(events[2..4], ["outer: request message", "inner: request message"]);
        let responses: Vec<_> = events[4..].iter().map(String::as_str).collect();
        assert_eq!(
            responses,
            ["inner: response message", "outer: response message"].repeat(3),
            "{protocol:?}"
        );
    }
}

#[tokio::test]
async fn test_server_interceptor_rejects_calls() {
    for protocol in PROTOCOLS {
        let (client, events) = intercepted_client(protocol);
        let options = CallOptions::new()
            .with_header(HeaderName::from_static("x-deny"), HeaderValue::from_static("1"));
        let error = client
            .unary(
                &MethodSpec::unary(SAY),
                ProtoCodec::<SayRequest, SayResponse>::new(),
                SayRequest {
                    sentence: "hello".to_string(),
                },
                options.clone(),
            )
            .await
            .unwrap_err();

        assert_eq!(error.code, Code::PermissionDenied, "{protocol:?}");
        assert_eq!(
            *events.lock().unwrap(),
            [
                format!("outer: request {SAY}"),
                "inner: error permission_denied".to_string(),
                "outer: error permission_denied".to_string(),
            ],
            "{protocol:?}"
        );

        let streamed = match client
            .server_stream(
                &MethodSpec::server_streaming(INTRODUCE),
                ProtoCodec::<IntroduceRequest, IntroduceResponse>::new(),
                IntroduceRequest {
                    name: "Ada".to_string(),
                },
                options,
            )
            .await
        {
            Ok(mut stream) => stream.message().await.map(|_| ()),
            Err(error) => Err(error),
        };
        assert_eq!(streamed.unwrap_err().code, Code::PermissionDenied, "{protocol:?}");
    }
}
