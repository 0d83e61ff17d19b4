use super::ServerInterceptorFactory;
use crate::compression::{CompressionPool, GzipCompressionPool};
use std::{fmt, sync::Arc};

/// Requests larger than this are rejected with `resource_exhausted` by default.
pub const DEFAULT_READ_MAX_BYTES: usize = 4 * 1024 * 1024;

/// Responses smaller than this are never compressed by default.
pub const DEFAULT_COMPRESSION_MIN_BYTES: usize = 1024;

/// Settings shared by every handler of a [`ConnectServer`](crate::ConnectServer).
#[derive(Clone)]
pub struct ServerConfig {
    /// Encodings accepted on requests and offered on responses, in order of preference.
    pub compression_pools: Vec<Arc<dyn CompressionPool>>,
    /// Whether responses may be compressed when the client accepts it.
    pub compress_responses: bool,
    pub compression_min_bytes: usize,
    /// Largest request message accepted, after decompression.
    pub read_max_bytes: Option<usize>,
    /// Creates the interceptors of every call, first to last.
    pub interceptors: Vec<ServerInterceptorFactory>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            compression_pools: vec![Arc::new(GzipCompressionPool)],
            compress_responses: true,
            compression_min_bytes: DEFAULT_COMPRESSION_MIN_BYTES,
            read_max_bytes: Some(DEFAULT_READ_MAX_BYTES),
            interceptors: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_compression_pools(mut self, pools: Vec<Arc<dyn CompressionPool>>) -> Self {
        self.compression_pools = pools;
        self
    }

    pub fn with_response_compression(mut self, enabled: bool, min_bytes: usize) -> Self {
        self.compress_responses = enabled;
        self.compression_min_bytes = min_bytes;
        self
    }

    pub fn with_read_max_bytes(mut self, limit: Option<usize>) -> Self {
        self.read_max_bytes = limit;
        self
    }

    pub fn with_interceptors(mut self, interceptors: Vec<ServerInterceptorFactory>) -> Self {
        self.interceptors = interceptors;
        self
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field(
                "compression_pools",
                &crate::compression::pool_names(&self.compression_pools),
            )
            .field("compress_responses", &self.compress_responses)
            .field("compression_min_bytes", &self.compression_min_bytes)
            .field("read_max_bytes", &self.read_max_bytes)
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}
