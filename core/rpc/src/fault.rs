// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Translation of service failures into call status
//!
//! A structured [`Status`] raised by a service method always reaches the caller
//! unchanged. Anything else (a status built from an arbitrary error, a caught
//! panic) is either hidden behind a generic `UNKNOWN`, or, with simplified fault
//! translation enabled, mapped to the closest well-known code.

use std::any::Any;
use std::error::Error as StdError;
use std::io;

use thiserror::Error;

use crate::status::{Code, Status};

/// Message of the status reported for unstructured failures when fault
/// translation is disabled
pub const HANDLER_FAILED: &str = "handler failed with an unexpected error";

/// Well-known failure categories a service can raise without choosing a code
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceFault {
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

impl ServiceFault {
    pub fn code(&self) -> Code {
        match self {
            ServiceFault::Cancelled(_) => Code::Cancelled,
            ServiceFault::InvalidArgument(_) => Code::InvalidArgument,
            ServiceFault::NotImplemented(_) => Code::Unimplemented,
            ServiceFault::PermissionDenied(_) => Code::PermissionDenied,
            ServiceFault::NotFound(_) => Code::NotFound,
            ServiceFault::Timeout(_) => Code::DeadlineExceeded,
        }
    }
}

/// A service fault is an unstructured failure; its code is only applied when
/// simplified fault translation is on.
impl From<ServiceFault> for Status {
    fn from(fault: ServiceFault) -> Self {
        Status::from_error(fault)
    }
}

/// A panic caught while running a service method
#[derive(Error, Debug)]
#[error("service method panicked: {0}")]
pub struct HandlerPanic(String);

impl HandlerPanic {
    pub fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        HandlerPanic(message)
    }

    pub fn into_status(self) -> Status {
        Status::from_error(self)
    }
}

/// Status to report for a failed service method.
///
/// Structured statuses pass through untouched, so translating twice is the same
/// as translating once.
pub fn translate(status: Status, simplified: bool) -> Status {
    if status.is_structured() || status.is_incomplete_send() {
        return status;
    }

    if !simplified {
        tracing::debug!(error = %status, "hiding unstructured handler failure");
        return Status::unknown(HANDLER_FAILED);
    }

    let code = status
        .cause()
        .map_or(Code::Unknown, |cause| classify_error(cause));
    let message = status.message().unwrap_or_default().to_string();
    Status::new(code, message)
}

/// Closest well-known code for an error, looking through its source chain
pub fn classify_error(error: &(dyn StdError + 'static)) -> Code {
    let mut current = Some(error);
    while let Some(err) = current {
        if let Some(code) = direct_code(err) {
            return code;
        }
        current = err.source();
    }
    Code::Unknown
}

fn direct_code(err: &(dyn StdError + 'static)) -> Option<Code> {
    if let Some(fault) = err.downcast_ref::<ServiceFault>() {
        return Some(fault.code());
    }
    if let Some(status) = err.downcast_ref::<Status>() {
        return status.is_structured().then(|| status.code());
    }
    if let Some(io) = err.downcast_ref::<io::Error>() {
        return Some(io_code(io.kind()));
    }
    if err.is::<tokio::time::error::Elapsed>() {
        return Some(Code::DeadlineExceeded);
    }
    if err.is::<std::num::ParseIntError>()
        || err.is::<std::num::ParseFloatError>()
        || err.is::<std::str::ParseBoolError>()
        || err.is::<std::string::FromUtf8Error>()
        || err.is::<std::str::Utf8Error>()
    {
        return Some(Code::InvalidArgument);
    }
    None
}

fn io_code(kind: io::ErrorKind) -> Code {
    match kind {
        io::ErrorKind::NotFound => Code::NotFound,
        io::ErrorKind::PermissionDenied => Code::PermissionDenied,
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Code::InvalidArgument,
        io::ErrorKind::TimedOut => Code::DeadlineExceeded,
        io::ErrorKind::Interrupted => Code::Cancelled,
        io::ErrorKind::Unsupported => Code::Unimplemented,
        io::ErrorKind::AlreadyExists => Code::AlreadyExists,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe => Code::Unavailable,
        _ => Code::Unknown,
    }
}
