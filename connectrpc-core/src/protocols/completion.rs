//! gRPC status handling shared by the gRPC and gRPC-Web protocols.
use super::{GRPC_MESSAGE, GRPC_STATUS, GRPC_STATUS_DETAILS_BIN};
use crate::{
    Code, ConnectError,
    error::{ErrorDetail, decode_base64, encode_base64, parse_status_details},
};
use http::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

/// The final status of a gRPC call.
#[derive(Debug, Clone)]
pub(crate) struct GrpcCompletion {
    /// `None` when the call succeeded.
    pub code: Option<Code>,
    pub message: String,
    pub details: Vec<ErrorDetail>,
    pub metadata: HeaderMap,
}

impl GrpcCompletion {
    fn missing(metadata: HeaderMap) -> Self {
        Self {
            code: Some(Code::Internal),
            message: "protocol error: status is missing from trailers".to_string(),
            details: Vec::new(),
            metadata,
        }
    }

    pub fn into_error(self) -> Option<ConnectError> {
        let code = self.code?;
        let mut error = ConnectError::new(code)
            .with_details(self.details)
            .with_metadata(self.metadata);
        if !self.message.is_empty() {
            error = error.with_message(self.message);
        }
        Some(error)
    }
}

/// Whether `headers` carry a `grpc-status`, i.e. form a trailers-only response.
pub(crate) fn has_status(headers: &HeaderMap) -> bool {
    parse_status(headers).is_some()
}

fn parse_status(map: &HeaderMap) -> Option<i32> {
    map.get(GRPC_STATUS)?.to_str().ok()?.trim().parse().ok()
}

/// Reads the status from `headers` (trailers-only responses), else from `trailers`.
pub(crate) fn parse_completion(headers: &HeaderMap, trailers: &HeaderMap) -> GrpcCompletion {
    let source = if parse_status(headers).is_some() {
        headers
    } else {
        trailers
    };
    let Some(status) = parse_status(source) else {
        return GrpcCompletion::missing(trailers.clone());
    };

    let message = source
        .get(GRPC_MESSAGE)
        .map(|value| percent_decode(value.as_bytes()))
        .unwrap_or_default();

    let details = source
        .get(GRPC_STATUS_DETAILS_BIN)
        .and_then(|value| value.to_str().ok())
        .and_then(|text| match decode_base64(text.trim()) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!(error = %err, "ignoring malformed grpc-status-details-bin");
                None
            }
        })
        .and_then(|bytes| match parse_status_details(&bytes) {
            Ok(details) => Some(details),
            Err(err) => {
                warn!(error = %err, "ignoring undecodable grpc-status-details-bin");
                None
            }
        })
        .unwrap_or_default();

    GrpcCompletion {
        code: Code::from_value(status),
        message,
        details,
        metadata: source.clone(),
    }
}

/// Writes the status of a finished call as `grpc-status`, `grpc-message` and
/// `grpc-status-details-bin` entries.
pub(crate) fn write_status(map: &mut HeaderMap, error: Option<&ConnectError>) {
    let Some(error) = error else {
        map.insert(GRPC_STATUS, HeaderValue::from_static("0"));
        return;
    };

    map.insert(GRPC_STATUS, HeaderValue::from(error.code.value()));
    if let Some(message) = error.message() {
        if let Ok(value) = HeaderValue::from_str(&percent_encode(message)) {
            map.insert(GRPC_MESSAGE, value);
        }
    }
    if !error.details.is_empty() {
        use prost::Message;
        let encoded = encode_base64(&error.to_status_proto().encode_to_vec());
        if let Ok(value) = HeaderValue::from_str(&encoded) {
            map.insert(GRPC_STATUS_DETAILS_BIN, value);
        }
    }
}

/// Decodes `%XX` escapes into text. Malformed escapes are kept literally.
pub(crate) fn percent_decode(input: &[u8]) -> String {
    String::from_utf8_lossy(&percent_decode_bytes(input)).into_owned()
}

pub(crate) fn percent_decode_bytes(input: &[u8]) -> Vec<u8> {
    if !input.contains(&b'%') {
        return input.to_vec();
    }

    let mut output = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'%' && i + 2 < input.len() {
            let hex = std::str::from_utf8(&input[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = hex {
                output.push(byte);
                i += 3;
                continue;
            }
        }
        output.push(input[i]);
        i += 1;
    }
    output
}

/// Escapes `%` and every byte outside printable ASCII.
pub(crate) fn percent_encode(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    for &byte in input.as_bytes() {
        if (0x20..=0x7e).contains(&byte) && byte != b'%' {
            output.push(byte as char);
        } else {
            output.push_str(&format!("%{byte:02X}"));
        }
    }
    output
}

/// Parses the gRPC-Web trailers block: `name: value\r\n` lines.
pub(crate) fn parse_trailers_block(block: &[u8]) -> HeaderMap {
    let mut trailers = HeaderMap::new();
    for line in String::from_utf8_lossy(block).split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = HeaderName::from_bytes(name.trim().to_ascii_lowercase().as_bytes());
        let value = HeaderValue::from_str(value.trim());
        if let (Ok(name), Ok(value)) = (name, value) {
            trailers.append(name, value);
        }
    }
    trailers
}

pub(crate) fn encode_trailers_block(trailers: &HeaderMap) -> Vec<u8> {
    let mut block = Vec::new();
    for (name, value) in trailers {
        block.extend_from_slice(name.as_str().as_bytes());
        block.extend_from_slice(b": ");
        block.extend_from_slice(value.as_bytes());
        block.extend_from_slice(b"\r\n");
    }
    block
}
