// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Status codes and call faults
//!
//! Every failure that crosses a call boundary is a [`Status`]: a gRPC-compatible
//! [`Code`], an optional message and optional binary details. A status also remembers
//! where it came from, so dispatch can tell a fault raised deliberately by a service
//! apart from an arbitrary error that escaped it.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

macro_rules! codes {
    ($($(#[$doc:meta])* $variant:ident = $value:literal => $wire:literal,)+) => {
        /// Call outcome codes, numbered as in gRPC
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        #[repr(u16)]
        pub enum Code {
            #[default]
            $($(#[$doc])* $variant = $value,)+
        }

        impl Code {
            pub fn from_i32(value: i32) -> Option<Self> {
                match value {
                    $($value => Some(Code::$variant),)+
                    _ => None,
                }
            }

            /// Upper snake case name, as written in trailers and logs
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Code::$variant => $wire,)+
                }
            }
        }
    };
}

codes! {
    Ok = 0 => "OK",
    /// Cancelled by the caller or on its behalf
    Cancelled = 1 => "CANCELLED",
    /// No better code applies; also the code of unstructured failures
    Unknown = 2 => "UNKNOWN",
    InvalidArgument = 3 => "INVALID_ARGUMENT",
    /// The deadline passed first
    DeadlineExceeded = 4 => "DEADLINE_EXCEEDED",
    NotFound = 5 => "NOT_FOUND",
    AlreadyExists = 6 => "ALREADY_EXISTS",
    PermissionDenied = 7 => "PERMISSION_DENIED",
    ResourceExhausted = 8 => "RESOURCE_EXHAUSTED",
    FailedPrecondition = 9 => "FAILED_PRECONDITION",
    Aborted = 10 => "ABORTED",
    OutOfRange = 11 => "OUT_OF_RANGE",
    /// No such operation, or not bound
    Unimplemented = 12 => "UNIMPLEMENTED",
    /// Broken invariant inside the framework or the transport
    Internal = 13 => "INTERNAL",
    Unavailable = 14 => "UNAVAILABLE",
    DataLoss = 15 => "DATA_LOSS",
    Unauthenticated = 16 => "UNAUTHENTICATED",
}

impl Code {
    pub fn is_ok(&self) -> bool {
        *self == Code::Ok
    }

    pub fn as_i32(&self) -> i32 {
        *self as i32
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i32> for Code {
    type Error = StatusError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Code::from_i32(value).ok_or(StatusError::InvalidCode(value))
    }
}

/// Where a status originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Raised deliberately with a code chosen by its author.
    Structured,
    /// Converted from an arbitrary error; the code is a placeholder.
    Unstructured,
    /// A streaming send failed before the peer finished reading.
    IncompleteSend,
}

/// Outcome of a call as seen across the call boundary
#[derive(Clone)]
pub struct Status {
    code: Code,
    message: Option<String>,
    details: Option<Vec<u8>>,
    origin: Origin,
    source: Option<Arc<dyn StdError + Send + Sync + 'static>>,
}

impl Status {
    /// Structured status with a message
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self::with_code(code).message_text(message)
    }

    /// Structured status without a message
    pub fn with_code(code: Code) -> Self {
        Self {
            code,
            message: None,
            details: None,
            origin: Origin::Structured,
            source: None,
        }
    }

    /// Structured status with a message and opaque details, such as an encoded
    /// protobuf `Any`
    pub fn with_details(code: Code, message: impl Into<String>, details: Vec<u8>) -> Self {
        let mut status = Self::new(code, message);
        status.details = Some(details);
        status
    }

    fn message_text(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Wrap an arbitrary error. The resulting status is `UNKNOWN` and unstructured,
    /// so fault translation may still assign it a better code.
    pub fn from_error<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            code: Code::Unknown,
            message: Some(error.to_string()),
            details: None,
            origin: Origin::Unstructured,
            source: Some(Arc::new(error)),
        }
    }

    /// A streaming send that failed before the peer signalled it was done reading.
    pub fn incomplete_send(cause: Status) -> Self {
        let message = match cause.message() {
            Some(message) => format!("incomplete send: {}", message),
            None => "incomplete send".to_string(),
        };
        Self {
            code: cause.code,
            message: Some(message),
            details: None,
            origin: Origin::IncompleteSend,
            source: Some(Arc::new(cause)),
        }
    }

    pub fn ok() -> Self {
        Self::with_code(Code::Ok)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn details(&self) -> Option<&[u8]> {
        self.details.as_deref()
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Returns true if the status was raised with a deliberate code
    pub fn is_structured(&self) -> bool {
        self.origin != Origin::Unstructured
    }

    /// Returns true if a streaming send failed before the peer finished reading
    pub fn is_incomplete_send(&self) -> bool {
        self.origin == Origin::IncompleteSend
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    /// The error this status was converted from, if any
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }
}

macro_rules! shorthands {
    ($($name:ident => $code:ident),+ $(,)?) => {
        impl Status {
            $(
                #[doc = concat!("Structured `", stringify!($code), "` status")]
                pub fn $name(message: impl Into<String>) -> Self {
                    Self::new(Code::$code, message)
                }
            )+
        }
    };
}

shorthands! {
    cancelled => Cancelled,
    unknown => Unknown,
    invalid_argument => InvalidArgument,
    deadline_exceeded => DeadlineExceeded,
    not_found => NotFound,
    permission_denied => PermissionDenied,
    failed_precondition => FailedPrecondition,
    unimplemented => Unimplemented,
    internal => Internal,
    unavailable => Unavailable,
}

impl PartialEq for Status {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
            && self.message == other.message
            && self.details == other.details
            && self.origin == other.origin
    }
}

impl Eq for Status {}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Status");
        s.field("code", &self.code);
        if let Some(message) = &self.message {
            s.field("message", message);
        }
        if self.origin != Origin::Structured {
            s.field("origin", &self.origin);
        }
        s.finish()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {}", self.code, msg),
            None => write!(f, "{}", self.code),
        }
    }
}

impl StdError for Status {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Status {
    fn from(error: std::io::Error) -> Self {
        Status::from_error(error)
    }
}

/// Errors related to status handling
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StatusError {
    #[error("invalid status code: {0}")]
    InvalidCode(i32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_conversion() {
        assert_eq!(Code::from_i32(0), Some(Code::Ok));
        assert_eq!(Code::from_i32(16), Some(Code::Unauthenticated));
        assert_eq!(Code::from_i32(17), None);
        assert_eq!(Code::try_from(-1), Err(StatusError::InvalidCode(-1)));
        assert_eq!(Code::InvalidArgument.as_i32(), 3);
        assert_eq!(Code::DeadlineExceeded.to_string(), "DEADLINE_EXCEEDED");
    }

    #[test]
    fn test_status_constructors() {
        let status = Status::invalid_argument("bad name");
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), Some("bad name"));
        assert!(status.is_structured());
        assert_eq!(status.to_string(), "INVALID_ARGUMENT: bad name");

        let status = Status::with_code(Code::NotFound);
        assert_eq!(status.message(), None);
        assert_eq!(status.to_string(), "NOT_FOUND");
    }

    #[test]
    fn test_from_error_is_unstructured() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let status = Status::from(err);
        assert_eq!(status.code(), Code::Unknown);
        assert!(!status.is_structured());
        assert!(status.cause().is_some());
        assert_eq!(status.message(), Some("missing"));
    }

    #[test]
    fn test_incomplete_send_keeps_code() {
        let status = Status::incomplete_send(Status::unavailable("peer closed"));
        assert!(status.is_incomplete_send());
        assert!(status.is_structured());
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(status.message(), Some("incomplete send: peer closed"));
    }
}
