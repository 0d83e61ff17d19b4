//! # Connectrpc Core
//!
//! `connectrpc-core` is an RPC library speaking three wire protocols over HTTP: the
//! [Connect protocol](https://connectrpc.com/docs/protocol), gRPC and gRPC-Web. It
//! powers the `connectrpc` CLI and can be embedded in any `tokio` application.
//!
//! ## Key Components
//!
//! * **[`ProtocolClient`]:** The client. It is generic over its transport: any
//!   `tonic::client::GrpcService`, such as a `tonic` [`Channel`](tonic::transport::Channel)
//!   or an in-process [`ConnectServer`].
//! * **[`Codec`]:** Message serialization. [`ProtoCodec`] and [`JsonCodec`] work with
//!   typed messages, [`DynamicCodec`] with `prost_reflect::DynamicMessage`s built from
//!   runtime descriptors.
//! * **[`Interceptor`]:** Per-call hooks that see requests and responses at the HTTP
//!   level. The wire protocols themselves are interceptors.
//! * **[`ConnectError`]:** The error of every failed call, with a [`Code`], a message,
//!   typed details and metadata.
//! * **[`ConnectServer`]:** A `tower` service routing Connect, gRPC and gRPC-Web
//!   requests to async handlers, with a built-in [`HealthService`].
//!
//! ## Example
//!
//! ```rust,no_run
//! # use connectrpc_core::*;
//! # #[derive(Clone, PartialEq, prost::Message)]
//! # struct SayRequest { #[prost(string, tag = "1")] sentence: String }
//! # #[derive(Clone, PartialEq, prost::Message)]
//! # struct SayResponse { #[prost(string, tag = "1")] sentence: String }
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ProtocolClientConfig::builder("http://localhost:8080").build()?;
//! let client = ProtocolClient::connect(config).await?;
//!
//! let spec = MethodSpec::unary("connectrpc.eliza.v1.ElizaService/Say");
//! let request = SayRequest { sentence: "hello".to_string() };
//! let response = client
//!     .unary(&spec, ProtoCodec::<SayRequest, SayResponse>::new(), request, CallOptions::new())
//!     .await?;
//! println!("{}", response.message.sentence);
//! # Ok(())
//! # }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports `prost`, `prost-reflect`, and `tonic` to ensure that consumers
//! use compatible versions of these underlying dependencies.
pub mod client;
pub mod code;
pub mod codec;
pub mod compression;
pub mod config;
pub mod envelope;
pub mod error;
pub mod http;
pub mod interceptor;
pub mod method;
pub mod protocols;
pub mod server;

pub use client::{
    BidiStream, CallOptions, ClientConnectError, ClientStream, ProtocolClient, ServerStream,
    UnaryResponse,
};
pub use code::Code;
pub use codec::{Codec, CodecError, DynamicCodec, JsonCodec, ProtoCodec, WireFormat};
pub use compression::{CompressionPool, GzipCompressionPool, RequestCompression};
pub use config::{
    ConfigError, GetConfiguration, NetworkProtocol, ProtocolClientConfig,
    ProtocolClientConfigBuilder, TimeoutOracle, simple_timeouts,
};
pub use error::{ConnectError, ErrorDetail, RpcStatus};
pub use interceptor::{Interceptor, InterceptorChain, InterceptorFactory};
pub use method::{Idempotency, MethodSpec, StreamType};
pub use server::{
    ConnectServer, HandlerSpec, HealthService, RequestStream, ResponseStream, ServerConfig,
    ServerContext, ServerInterceptor, ServerInterceptorFactory, ServingStatus,
};

// Re-exports
pub use prost;
pub use prost_reflect;
pub use tonic;

/// Type alias for the standard boxed error used in generic bounds.
pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
