//! # Status Codes
//!
//! The sixteen non-OK status codes shared by the Connect, gRPC and gRPC-Web
//! protocols. Success is represented by the absence of a [`Code`], never by a
//! variant, so an error value can never claim to be "OK".
use std::fmt;

/// An RPC failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Canceled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

const ALL: [Code; 16] = [
    Code::Canceled,
    Code::Unknown,
    Code::InvalidArgument,
    Code::DeadlineExceeded,
    Code::NotFound,
    Code::AlreadyExists,
    Code::PermissionDenied,
    Code::ResourceExhausted,
    Code::FailedPrecondition,
    Code::Aborted,
    Code::OutOfRange,
    Code::Unimplemented,
    Code::Internal,
    Code::Unavailable,
    Code::DataLoss,
    Code::Unauthenticated,
];

impl Code {
    /// The name used on the wire by the Connect protocol (e.g. `"invalid_argument"`).
    pub fn name(self) -> &'static str {
        match self {
            Code::Canceled => "canceled",
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid_argument",
            Code::DeadlineExceeded => "deadline_exceeded",
            Code::NotFound => "not_found",
            Code::AlreadyExists => "already_exists",
            Code::PermissionDenied => "permission_denied",
            Code::ResourceExhausted => "resource_exhausted",
            Code::FailedPrecondition => "failed_precondition",
            Code::Aborted => "aborted",
            Code::OutOfRange => "out_of_range",
            Code::Unimplemented => "unimplemented",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
            Code::DataLoss => "data_loss",
            Code::Unauthenticated => "unauthenticated",
        }
    }

    /// The numeric value used by gRPC in `grpc-status`.
    pub fn value(self) -> i32 {
        match self {
            Code::Canceled => 1,
            Code::Unknown => 2,
            Code::InvalidArgument => 3,
            Code::DeadlineExceeded => 4,
            Code::NotFound => 5,
            Code::AlreadyExists => 6,
            Code::PermissionDenied => 7,
            Code::ResourceExhausted => 8,
            Code::FailedPrecondition => 9,
            Code::Aborted => 10,
            Code::OutOfRange => 11,
            Code::Unimplemented => 12,
            Code::Internal => 13,
            Code::Unavailable => 14,
            Code::DataLoss => 15,
            Code::Unauthenticated => 16,
        }
    }

    pub fn from_name(name: &str) -> Option<Code> {
        ALL.into_iter().find(|code| code.name() == name)
    }

    pub fn from_name_or(name: Option<&str>, default: Code) -> Code {
        name.and_then(Code::from_name).unwrap_or(default)
    }

    /// Maps a numeric status to a code.
    ///
    /// # Returns
    ///
    /// * `None` - The value is `0`, meaning the call succeeded.
    /// * `Some(Code::Unknown)` - The value is not a known status.
    /// * `Some(code)` - Otherwise.
    pub fn from_value(value: i32) -> Option<Code> {
        if value == 0 {
            return None;
        }
        Some(
            ALL.into_iter()
                .find(|code| code.value() == value)
                .unwrap_or(Code::Unknown),
        )
    }

    /// Derives a code from an HTTP status when the response carries no better signal.
    pub fn from_http_status(status: Option<u16>) -> Code {
        match status {
            Some(400) => Code::Internal,
            Some(401) => Code::Unauthenticated,
            Some(403) => Code::PermissionDenied,
            Some(404) => Code::Unimplemented,
            Some(429) | Some(502) | Some(503) | Some(504) => Code::Unavailable,
            _ => Code::Unknown,
        }
    }

    /// The HTTP status a Connect server answers with for this code.
    pub fn to_http_status(self) -> u16 {
        match self {
            Code::Canceled => 408,
            Code::Unknown => 500,
            Code::InvalidArgument => 400,
            Code::DeadlineExceeded => 408,
            Code::NotFound => 404,
            Code::AlreadyExists => 409,
            Code::PermissionDenied => 403,
            Code::ResourceExhausted => 429,
            Code::FailedPrecondition => 400,
            Code::Aborted => 409,
            Code::OutOfRange => 400,
            Code::Unimplemented => 404,
            Code::Internal => 500,
            Code::Unavailable => 503,
            Code::DataLoss => 500,
            Code::Unauthenticated => 401,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
