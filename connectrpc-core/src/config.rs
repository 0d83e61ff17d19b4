//! # Client Configuration
//!
//! [`ProtocolClientConfig`] captures everything a
//! [`ProtocolClient`](crate::ProtocolClient) needs besides its transport: the target
//! host, the wire protocol, compression, HTTP GET support, interceptors and timeouts.
//! It is created with [`ProtocolClientConfig::builder`] and validated on `build()`.
use crate::{
    MethodSpec, StreamType,
    compression::{CompressionPool, GzipCompressionPool, RequestCompression, find_pool},
    interceptor::{Interceptor, InterceptorChain, InterceptorFactory},
    protocols::{ConnectInterceptor, GrpcInterceptor, GrpcWebInterceptor},
};
use http::Uri;
use std::{fmt, sync::Arc, time::Duration};

/// Largest message sent with GET by [`GetConfiguration::enabled_with_fallback`].
pub const DEFAULT_GET_MAX_MESSAGE_BYTES: usize = 50_000;

/// Applied to every call unless a timeout oracle says otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Invalid host '{host}': '{source}'")]
    InvalidHost {
        host: String,
        source: http::uri::InvalidUri,
    },
    #[error("Unsupported scheme in host '{0}', expected 'http' or 'https'")]
    UnsupportedScheme(String),
}

/// The wire protocol spoken by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkProtocol {
    #[default]
    Connect,
    Grpc,
    GrpcWeb,
}

/// When Connect unary calls to side-effect free methods may use HTTP GET.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GetConfiguration {
    #[default]
    Disabled,
    /// Always use GET for eligible methods.
    Enabled,
    /// Use GET for eligible methods whose encoded message is smaller than
    /// `max_message_bytes`, POST otherwise.
    EnabledWithFallback { max_message_bytes: usize },
}

impl GetConfiguration {
    pub fn enabled_with_fallback() -> Self {
        GetConfiguration::EnabledWithFallback {
            max_message_bytes: DEFAULT_GET_MAX_MESSAGE_BYTES,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, GetConfiguration::Disabled)
    }

    /// Whether a message of `len` bytes may be sent with GET.
    pub fn use_get(&self, len: usize) -> bool {
        match self {
            GetConfiguration::Disabled => false,
            GetConfiguration::Enabled => true,
            GetConfiguration::EnabledWithFallback { max_message_bytes } => len < *max_message_bytes,
        }
    }
}

/// Computes the timeout of a call from its method.
pub type TimeoutOracle = Arc<dyn Fn(&MethodSpec) -> Option<Duration> + Send + Sync>;

/// A timeout oracle with one value for unary calls and another for streams.
pub fn simple_timeouts(unary: Option<Duration>, stream: Option<Duration>) -> TimeoutOracle {
    Arc::new(move |spec: &MethodSpec| match spec.stream_type {
        StreamType::Unary => unary,
        _ => stream,
    })
}

/// Validated client settings.
#[derive(Clone)]
pub struct ProtocolClientConfig {
    host: Uri,
    base_url: String,
    protocol: NetworkProtocol,
    request_compression: Option<RequestCompression>,
    get_configuration: GetConfiguration,
    interceptors: Vec<InterceptorFactory>,
    compression_pools: Vec<Arc<dyn CompressionPool>>,
    timeout_oracle: TimeoutOracle,
}

impl ProtocolClientConfig {
    /// Starts a configuration for `host`, e.g. `https://demo.connectrpc.com`.
    /// A path on the host is kept as a prefix of every call.
    pub fn builder(host: impl Into<String>) -> ProtocolClientConfigBuilder {
        ProtocolClientConfigBuilder {
            host: host.into(),
            protocol: NetworkProtocol::default(),
            request_compression: None,
            get_configuration: GetConfiguration::default(),
            interceptors: Vec::new(),
            compression_pools: vec![Arc::new(GzipCompressionPool)],
            timeout_oracle: Arc::new(|_: &MethodSpec| Some(DEFAULT_TIMEOUT)),
        }
    }

    pub fn host(&self) -> &Uri {
        &self.host
    }

    pub fn protocol(&self) -> NetworkProtocol {
        self.protocol
    }

    pub fn request_compression(&self) -> Option<&RequestCompression> {
        self.request_compression.as_ref()
    }

    pub fn get_configuration(&self) -> GetConfiguration {
        self.get_configuration
    }

    /// Pools in preference order.
    pub fn compression_pools(&self) -> &[Arc<dyn CompressionPool>] {
        &self.compression_pools
    }

    pub fn compression_pool(&self, name: &str) -> Option<Arc<dyn CompressionPool>> {
        find_pool(&self.compression_pools, name)
    }

    pub fn timeout_for(&self, spec: &MethodSpec) -> Option<Duration> {
        (self.timeout_oracle)(spec)
    }

    /// The URL of a method: the host, its path prefix, then `package.Service/Method`.
    pub fn url_for(&self, spec: &MethodSpec) -> Result<Uri, http::uri::InvalidUri> {
        format!("{}{}", self.base_url, spec.path).parse()
    }

    /// The interceptors of a new call: user interceptors first, then the protocol.
    pub fn interceptor_chain(&self) -> InterceptorChain {
        let mut interceptors: Vec<Box<dyn Interceptor>> = self
            .interceptors
            .iter()
            .map(|factory| factory(self))
            .collect();
        interceptors.push(match self.protocol {
            NetworkProtocol::Connect => Box::new(ConnectInterceptor::new(self)),
            NetworkProtocol::Grpc => Box::new(GrpcInterceptor::new(self)),
            NetworkProtocol::GrpcWeb => Box::new(GrpcWebInterceptor::new(self)),
        });
        InterceptorChain::new(interceptors)
    }
}

impl fmt::Debug for ProtocolClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolClientConfig")
            .field("host", &self.host)
            .field("protocol", &self.protocol)
            .field("request_compression", &self.request_compression)
            .field("get_configuration", &self.get_configuration)
            .field("interceptors", &self.interceptors.len())
            .field("compression_pools", &self.compression_pools)
            .finish_non_exhaustive()
    }
}

pub struct ProtocolClientConfigBuilder {
    host: String,
    protocol: NetworkProtocol,
    request_compression: Option<RequestCompression>,
    get_configuration: GetConfiguration,
    interceptors: Vec<InterceptorFactory>,
    compression_pools: Vec<Arc<dyn CompressionPool>>,
    timeout_oracle: TimeoutOracle,
}

impl ProtocolClientConfigBuilder {
    pub fn protocol(mut self, protocol: NetworkProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Compresses outgoing messages of at least `min_bytes` with `pool`.
    pub fn request_compression(mut self, min_bytes: usize, pool: Arc<dyn CompressionPool>) -> Self {
        self.request_compression = Some(RequestCompression::new(min_bytes, pool));
        self
    }

    pub fn get_configuration(mut self, get_configuration: GetConfiguration) -> Self {
        self.get_configuration = get_configuration;
        self
    }

    pub fn interceptor<F>(mut self, factory: F) -> Self
    where
        F: Fn(&ProtocolClientConfig) -> Box<dyn Interceptor> + Send + Sync + 'static,
    {
        self.interceptors.push(Arc::new(factory));
        self
    }

    /// Replaces the pools used to decompress responses (default: gzip).
    pub fn compression_pools(mut self, pools: Vec<Arc<dyn CompressionPool>>) -> Self {
        self.compression_pools = pools;
        self
    }

    pub fn timeout_oracle(mut self, oracle: TimeoutOracle) -> Self {
        self.timeout_oracle = oracle;
        self
    }

    pub fn build(self) -> Result<ProtocolClientConfig, ConfigError> {
        let host: Uri = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost {
                host: self.host.clone(),
                source,
            })?;

        match host.scheme_str() {
            Some("http") | Some("https") if host.authority().is_some() => {}
            _ => return Err(ConfigError::UnsupportedScheme(self.host)),
        }

        let base_url = if self.host.ends_with('/') {
            self.host
        } else {
            format!("{}/", self.host)
        };

        Ok(ProtocolClientConfig {
            host,
            base_url,
            protocol: self.protocol,
            request_compression: self.request_compression,
            get_configuration: self.get_configuration,
            interceptors: self.interceptors,
            compression_pools: self.compression_pools,
            timeout_oracle: self.timeout_oracle,
        })
    }
}
