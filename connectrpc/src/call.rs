//! # Dynamic Calls
//!
//! Performs a call to any method found in a file descriptor set, without generated
//! code. The JSON body is turned into `DynamicMessage`s of the method's input type,
//! sent with the cardinality the descriptor declares, and every response message
//! is turned back into JSON.
//!
//! # Error Handling
//!
//! - **`CallError`**: The call could not be attempted: unknown method, a body that
//!   does not match the input message, an invalid header.
//! - **`ConnectError`**: The call was attempted and failed, locally or on the server.
//!   It is part of the [`DynamicResponse`], after the messages received before it.
use connectrpc_core::{
    CallOptions, ConnectError, DynamicCodec, MethodSpec, ProtocolClient, StreamType, WireFormat,
    prost_reflect::{DescriptorError, DescriptorPool, DynamicMessage, MessageDescriptor, MethodDescriptor},
    tonic::client::GrpcService,
};
use http::{HeaderName, HeaderValue};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;


type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("Failed to decode file descriptor set: {0}")]
    InvalidDescriptorSet(#[from] DescriptorError),
    #[error("Service '{0}' not found")]
    ServiceNotFound(String),
    #[error("Method '{method}' not found in service '{service}'")]
    MethodNotFound { service: String, method: String },
    #[error("Invalid header '{0}'")]
    InvalidHeader(String),
    #[error("{0} methods expect a JSON array body")]
    ExpectedArray(&'static str),
    #[error("Body does not match message '{message}': {source}")]
    InvalidBody {
        message: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to render response as JSON: {0}")]
    InvalidResponse(#[source] serde_json::Error),
}

/// A call, as described on the command line.
#[derive(Debug, Clone)]
pub struct DynamicRequest {
    pub service: String,
    pub method: String,
    pub body: Value,
    pub headers: Vec<(String, String)>,
    pub format: WireFormat,
    pub timeout: Option<Duration>,
}

/// Every message received, then the error that ended the call, if any.
#[derive(Debug, Default)]
pub struct DynamicResponse {
    pub messages: Vec<Value>,
    pub error: Option<ConnectError>,
}

impl DynamicResponse {
    fn failed(error: ConnectError) -> Self {
        Self {
            messages: Vec::new(),
            error: Some(error),
        }
    }
}

pub fn load_descriptors(bytes: &[u8]) -> Result<DescriptorPool, CallError> {
    Ok(DescriptorPool::decode(bytes)?)
}

pub fn find_method(
    pool: &DescriptorPool,
    service: &str,
    method: &str,
) -> Result<MethodDescriptor, CallError> {
    let descriptor = pool
        .get_service_by_name(service)
        .ok_or_else(|| CallError::ServiceNotFound(service.to_string()))?;
    descriptor
        .methods()
        .find(|m| m.name() == method)
        .ok_or_else(|| CallError::MethodNotFound {
            service: service.to_string(),
            method: method.to_string(),
        })
}

pub async fn call<S>(
    client: &ProtocolClient<S>,
    pool: &DescriptorPool,
    request: DynamicRequest,
) -> Result<DynamicResponse, CallError>
where
    S: GrpcService<connectrpc_core::tonic::body::Body> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Into<BoxError>,
    S::ResponseBody: http_body::Body<Data = bytes::Bytes> + Send + 'static,
    <S::ResponseBody as http_body::Body>::Error: Into<BoxError> + Send,
{
    let method = find_method(pool, &request.service, &request.method)?;
    let spec = MethodSpec::from_descriptor(&method);
    let codec = DynamicCodec::new(method.input(), method.output(), request.format);
    let options = call_options(&request.headers, request.timeout)?;
    debug!(path = %spec.path, stream_type = ?spec.stream_type, "calling method");

    let response = match spec.stream_type {
        StreamType::Unary => {
            let message = to_message(&method.input(), request.body)?;
            match client.unary(&spec, codec, message, options).await {
                Ok(response) => DynamicResponse {
                    messages: vec![to_json(&response.message)?],
                    error: None,
                },
                Err(error) => DynamicResponse::failed(error),
            }
        }
        StreamType::Server => {
            let message = to_message(&method.input(), request.body)?;
            match client.server_stream(&spec, codec, message, options).await {
                Ok(mut stream) => {
                    let mut response = DynamicResponse::default();
                    loop {
                        match stream.message().await {
                            Ok(Some(message)) => response.messages.push(to_json(&message)?),
                            Ok(None) => break,
                            Err(error) => {
                                response.error = Some(error);
                                break;
                            }
                        }
                    }
                    response
                }
                Err(error) => DynamicResponse::failed(error),
            }
        }
        StreamType::Client => {
            let messages = to_messages(&method.input(), request.body, "Client streaming")?;
            match client.client_stream(&spec, codec, options) {
                Ok(mut stream) => {
                    for message in &messages {
                        // A failed send ends the call; its cause comes with the response.
                        if stream.send(message).await.is_err() {
                            break;
                        }
                    }
                    match stream.close_and_receive().await {
                        Ok(response) => DynamicResponse {
                            messages: vec![to_json(&response.message)?],
                            error: None,
                        },
                        Err(error) => DynamicResponse::failed(error),
                    }
                }
                Err(error) => DynamicResponse::failed(error),
            }
        }
        StreamType::Bidi => {
            let messages = to_messages(&method.input(), request.body, "Bidirectional streaming")?;
            match client.bidi_stream(&spec, codec, options) {
                Ok(mut stream) => {
                    for message in &messages {
                        if stream.send(message).await.is_err() {
                            break;
                        }
                    }
                    stream.close_send();

                    let mut response = DynamicResponse::default();
                    loop {
                        match stream.message().await {
                            Ok(Some(message)) => response.messages.push(to_json(&message)?),
                            Ok(None) => break,
                            Err(error) => {
                                response.error = Some(error);
                                break;
                            }
                        }
                    }
                    response
                }
                Err(error) => DynamicResponse::failed(error),
            }
        }
    };
    Ok(response)
}

fn call_options(
    headers: &[(String, String)],
    timeout: Option<Duration>,
) -> Result<CallOptions, CallError> {
    let mut options = CallOptions::new();
    for (name, value) in headers {
        let invalid = || CallError::InvalidHeader(format!("{name}: {value}"));
        let name = HeaderName::from_bytes(name.to_lowercase().as_bytes()).map_err(|_| invalid())?;
        let value = HeaderValue::from_str(value).map_err(|_| invalid())?;
        options = options.with_header(name, value);
    }
    if let Some(timeout) = timeout {
        options = options.with_timeout(timeout);
    }
    Ok(options)
}

fn to_message(descriptor: &MessageDescriptor, body: Value) -> Result<DynamicMessage, CallError> {
    DynamicMessage::deserialize(descriptor.clone(), body).map_err(|source| {
        CallError::InvalidBody {
            message: descriptor.full_name().to_string(),
            source,
        }
    })
}

fn to_messages(
    descriptor: &MessageDescriptor,
    body: Value,
    kind: &'static str,
) -> Result<Vec<DynamicMessage>, CallError> {
    let Value::Array(items) = body else {
        return Err(CallError::ExpectedArray(kind));
    };
    items
        .into_iter()
        .map(|item| to_message(descriptor, item))
        .collect()
}

fn to_json(message: &DynamicMessage) -> Result<Value, CallError> {
    serde_json::to_value(message).map_err(CallError::InvalidResponse)
}
