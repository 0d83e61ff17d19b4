#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use connectrpc_core::{
    ConnectServer, NetworkProtocol, ProtocolClient, ProtocolClientConfig,
    ProtocolClientConfigBuilder, ServerConfig,
};
use eliza_service::Encoding;
use http::{HeaderMap, Method};
use http_body::Body as HttpBody;
use std::{
    future::poll_fn,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

pub const PROTOCOLS: [NetworkProtocol; 3] = [
    NetworkProtocol::Connect,
    NetworkProtocol::Grpc,
    NetworkProtocol::GrpcWeb,
];

pub const HOST: &str = "http://eliza.test";

pub fn eliza_server(encoding: Encoding) -> ConnectServer {
    ConnectServer::new(ServerConfig::default()).register_all(eliza_service::handlers(encoding))
}

pub fn client(protocol: NetworkProtocol) -> ProtocolClient<ConnectServer> {
    client_with(
        eliza_server(Encoding::Proto),
        ProtocolClientConfig::builder(HOST).protocol(protocol),
    )
}

pub fn client_with<S>(service: S, builder: ProtocolClientConfigBuilder) -> ProtocolClient<S>
where
    S: tonic::client::GrpcService<tonic::body::Body> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    S::ResponseBody: HttpBody<Data = Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
{
    ProtocolClient::new(service, builder.build().unwrap())
}

/// Reads a response body to its end, returning its data and trailers.
pub async fn read_body<B>(body: B) -> (Bytes, HeaderMap)
where
    B: HttpBody<Data = Bytes> + Unpin,
    B::Error: std::fmt::Debug,
{
    let mut body = body;
    let mut data = BytesMut::new();
    let mut trailers = HeaderMap::new();
    while let Some(frame) = poll_fn(|cx| Pin::new(&mut body).poll_frame(cx)).await {
        let frame = frame.unwrap();
        match frame.into_data() {
            Ok(chunk) => data.extend_from_slice(&chunk),
            Err(frame) => {
                if let Ok(map) = frame.into_trailers() {
                    trailers.extend(map);
                }
            }
        }
    }
    (data.freeze(), trailers)
}

/// Records the HTTP method of every request passing through.
#[derive(Clone)]
pub struct MethodRecorder {
    inner: ConnectServer,
    pub methods: Arc<Mutex<Vec<Method>>>,
}

impl MethodRecorder {
    pub fn new(inner: ConnectServer) -> Self {
        Self {
            inner,
            methods: Arc::default(),
        }
    }

    pub fn recorded(&self) -> Vec<Method> {
        self.methods.lock().unwrap().clone()
    }
}

impl tower_service::Service<http::Request<tonic::body::Body>> for MethodRecorder {
    type Response = <ConnectServer as tower_service::Service<http::Request<tonic::body::Body>>>::Response;
    type Error = <ConnectServer as tower_service::Service<http::Request<tonic::body::Body>>>::Error;
    type Future = <ConnectServer as tower_service::Service<http::Request<tonic::body::Body>>>::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        tower_service::Service::<http::Request<tonic::body::Body>>::poll_ready(&mut self.inner, cx)
    }

    fn call(&mut self, request: http::Request<tonic::body::Body>) -> Self::Future {
        self.methods.lock().unwrap().push(request.method().clone());
        self.inner.call(request)
    }
}
