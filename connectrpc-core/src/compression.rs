//! # Compression
//!
//! Pluggable payload compression. A [`CompressionPool`] is identified by the name
//! advertised in `content-encoding`/`grpc-encoding` style headers. Only gzip ships
//! with the crate; other algorithms can be registered by implementing the trait.
use bytes::Bytes;
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use std::{
    fmt::Debug,
    io::{Read, Write},
    sync::Arc,
};

#[derive(thiserror::Error, Debug)]
pub enum CompressionError {
    #[error("{algorithm} stream is corrupt: '{source}'")]
    Io {
        algorithm: &'static str,
        source: std::io::Error,
    },
    #[error("decompressed message exceeds the {limit} byte limit")]
    TooLarge { limit: usize },
}

/// A compression algorithm.
pub trait CompressionPool: Debug + Send + Sync + 'static {
    /// Name used in encoding headers, e.g. `"gzip"`.
    fn name(&self) -> &'static str;

    fn compress(&self, input: &[u8]) -> Result<Bytes, CompressionError>;

    /// Decompresses `input`, failing once the output grows past `read_max_bytes`.
    fn decompress(
        &self,
        input: &[u8],
        read_max_bytes: Option<usize>,
    ) -> Result<Bytes, CompressionError>;
}

/// Gzip via `flate2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipCompressionPool;

impl CompressionPool for GzipCompressionPool {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, input: &[u8]) -> Result<Bytes, CompressionError> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(input.len() / 2), Compression::default());
        encoder
            .write_all(input)
            .and_then(|_| encoder.finish())
            .map(Bytes::from)
            .map_err(|source| CompressionError::Io {
                algorithm: "gzip",
                source,
            })
    }

    fn decompress(
        &self,
        input: &[u8],
        read_max_bytes: Option<usize>,
    ) -> Result<Bytes, CompressionError> {
        let decoder = GzDecoder::new(input);
        let mut output = Vec::new();
        let io_error = |source| CompressionError::Io {
            algorithm: "gzip",
            source,
        };

        match read_max_bytes {
            Some(limit) => {
                // One byte past the limit is enough to detect an oversized payload.
                decoder
                    .take(limit as u64 + 1)
                    .read_to_end(&mut output)
                    .map_err(io_error)?;
                if output.len() > limit {
                    return Err(CompressionError::TooLarge { limit });
                }
            }
            None => {
                let mut decoder = decoder;
                decoder.read_to_end(&mut output).map_err(io_error)?;
            }
        }

        Ok(Bytes::from(output))
    }
}

/// Client-side policy for compressing outgoing messages.
#[derive(Debug, Clone)]
pub struct RequestCompression {
    pub min_bytes: usize,
    pub pool: Arc<dyn CompressionPool>,
}

impl RequestCompression {
    pub fn new(min_bytes: usize, pool: Arc<dyn CompressionPool>) -> Self {
        Self { min_bytes, pool }
    }

    pub fn should_compress(&self, len: usize) -> bool {
        len >= self.min_bytes
    }
}

/// Looks up a pool by its advertised name.
pub(crate) fn find_pool(
    pools: &[Arc<dyn CompressionPool>],
    name: &str,
) -> Option<Arc<dyn CompressionPool>> {
    pools.iter().find(|pool| pool.name() == name).cloned()
}

/// Comma separated pool names, as sent in accept-encoding style headers.
pub(crate) fn pool_names(pools: &[Arc<dyn CompressionPool>]) -> String {
    pools
        .iter()
        .map(|pool| pool.name())
        .collect::<Vec<_>>()
        .join(",")
}

/// Picks the first advertised encoding the peer accepts that we have a pool for.
pub(crate) fn negotiate(
    pools: &[Arc<dyn CompressionPool>],
    accept: Option<&str>,
) -> Option<Arc<dyn CompressionPool>> {
    accept?
        .split(',')
        .map(str::trim)
        .find_map(|name| find_pool(pools, name))
}
