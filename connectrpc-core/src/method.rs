//! Static description of an RPC method.
use prost_reflect::MethodDescriptor;

/// The cardinality of an RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    /// Single request, single response.
    Unary,
    /// Stream of requests, single response.
    Client,
    /// Single request, stream of responses.
    Server,
    /// Stream of requests, stream of responses.
    Bidi,
}

impl StreamType {
    /// Whether the request side carries at most one message.
    pub fn single_request(self) -> bool {
        matches!(self, StreamType::Unary | StreamType::Server)
    }

    /// Whether the response side carries exactly one message.
    pub fn single_response(self) -> bool {
        matches!(self, StreamType::Unary | StreamType::Client)
    }
}

/// Declared side effects of a method. Only `NoSideEffects` unary methods may use HTTP GET.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Idempotency {
    #[default]
    Unknown,
    NoSideEffects,
    Idempotent,
}

/// Identifies a method (`package.Service/Method`) and how it is called.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSpec {
    pub path: String,
    pub stream_type: StreamType,
    pub idempotency: Idempotency,
}

impl MethodSpec {
    pub fn new(path: impl Into<String>, stream_type: StreamType) -> Self {
        Self {
            path: path.into().trim_start_matches('/').to_string(),
            stream_type,
            idempotency: Idempotency::Unknown,
        }
    }

    pub fn unary(path: impl Into<String>) -> Self {
        Self::new(path, StreamType::Unary)
    }

    pub fn client_streaming(path: impl Into<String>) -> Self {
        Self::new(path, StreamType::Client)
    }

    pub fn server_streaming(path: impl Into<String>) -> Self {
        Self::new(path, StreamType::Server)
    }

    pub fn bidi_streaming(path: impl Into<String>) -> Self {
        Self::new(path, StreamType::Bidi)
    }

    /// Describes a method from its protobuf descriptor, including the
    /// `idempotency_level` method option.
    pub fn from_descriptor(method: &MethodDescriptor) -> Self {
        let stream_type = match (method.is_client_streaming(), method.is_server_streaming()) {
            (false, false) => StreamType::Unary,
            (true, false) => StreamType::Client,
            (false, true) => StreamType::Server,
            (true, true) => StreamType::Bidi,
        };
        let idempotency = match method
            .options()
            .get_field_by_name("idempotency_level")
            .and_then(|level| level.as_enum_number())
        {
            Some(1) => Idempotency::NoSideEffects,
            Some(2) => Idempotency::Idempotent,
            _ => Idempotency::Unknown,
        };
        let path = format!("{}/{}", method.parent_service().full_name(), method.name());
        Self::new(path, stream_type).with_idempotency(idempotency)
    }

    pub fn with_idempotency(mut self, idempotency: Idempotency) -> Self {
        self.idempotency = idempotency;
        self
    }

    /// `package.Service` part of the path.
    pub fn service_name(&self) -> &str {
        self.path
            .split_once('/')
            .map_or(self.path.as_str(), |(service, _)| service)
    }

    /// `Method` part of the path.
    pub fn method_name(&self) -> &str {
        self.path
            .split_once('/')
            .map_or("", |(_, method)| method)
    }
}
