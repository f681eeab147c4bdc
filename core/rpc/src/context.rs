// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Call-scoped context
//!
//! [`CallContext`] is what a contract method sees: request headers, a timeout, a
//! cancellation token, behaviour flags and, on the client, an optional capture of
//! response headers, trailers and status. On the server it wraps the transport's
//! [`ServerCallContext`].

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::Status;
use crate::metadata::{DEADLINE_KEY, Metadata};
use crate::transport::{CallOptions, Completion, HeaderSlot};

/// Per-call behaviour switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallFlags {
    /// Record response headers, trailers and status on the context
    pub capture_metadata: bool,
    /// Treat a request stream closed early by the server as success
    pub ignore_stream_termination: bool,
}

#[derive(Debug, Default)]
struct Captured {
    headers: Option<Metadata>,
    trailers: Option<Metadata>,
    status: Option<Status>,
}

/// Response metadata recorded for a client call. Each part is recorded at most
/// once; later writes are ignored.
#[derive(Debug, Clone, Default)]
pub struct MetadataCapture(Arc<Mutex<Captured>>);

impl MetadataCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_headers(&self, headers: Metadata) {
        let mut captured = self.0.lock();
        if captured.headers.is_none() {
            captured.headers = Some(headers);
        }
    }

    pub fn record_completion(&self, completion: &Completion) {
        let mut captured = self.0.lock();
        if captured.status.is_none() {
            captured.status = Some(completion.status.clone());
            captured.trailers = Some(completion.trailers.clone());
        }
    }

    pub fn headers(&self) -> Option<Metadata> {
        self.0.lock().headers.clone()
    }

    pub fn trailers(&self) -> Option<Metadata> {
        self.0.lock().trailers.clone()
    }

    pub fn status(&self) -> Option<Status> {
        self.0.lock().status.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.0.lock().status.is_some()
    }
}

/// Context of one call, as seen by contract methods and client callers
#[derive(Clone, Default)]
pub struct CallContext {
    headers: Metadata,
    timeout: Option<Duration>,
    deadline: Option<SystemTime>,
    cancellation: Option<CancellationToken>,
    flags: CallFlags,
    capture: Option<MetadataCapture>,
    server: Option<ServerCallContext>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context that observes `token`
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn with_headers(mut self, headers: Metadata) -> Self {
        self.headers.merge(headers);
        self
    }

    /// Relative timeout, measured from the moment the call starts
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: SystemTime) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Record response headers, trailers and final status on this context
    pub fn capture_metadata(mut self) -> Self {
        self.flags.capture_metadata = true;
        self.capture.get_or_insert_with(MetadataCapture::new);
        self
    }

    pub fn ignore_stream_termination(mut self) -> Self {
        self.flags.ignore_stream_termination = true;
        self
    }

    pub fn with_flags(mut self, flags: CallFlags) -> Self {
        if flags.capture_metadata {
            self = self.capture_metadata();
        }
        self.flags.ignore_stream_termination |= flags.ignore_stream_termination;
        self
    }

    /// Wrap the server side of a call
    pub fn from_server(server: ServerCallContext) -> Self {
        Self {
            headers: server.request_headers().clone(),
            timeout: None,
            deadline: server.deadline(),
            cancellation: Some(server.cancellation_token()),
            flags: CallFlags::default(),
            capture: None,
            server: Some(server),
        }
    }

    pub fn headers(&self) -> &Metadata {
        &self.headers
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The explicit deadline, else one derived from the timeout
    pub fn deadline(&self) -> Option<SystemTime> {
        self.deadline.or_else(|| {
            self.timeout
                .and_then(|timeout| SystemTime::now().checked_add(timeout))
        })
    }

    /// Time left before the deadline
    pub fn remaining_time(&self) -> Option<Duration> {
        match (self.deadline, self.timeout) {
            (Some(deadline), _) => Some(
                deadline
                    .duration_since(SystemTime::now())
                    .unwrap_or(Duration::ZERO),
            ),
            (None, timeout) => timeout,
        }
    }

    pub fn flags(&self) -> CallFlags {
        self.flags
    }

    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    /// The token observed by this call, or a fresh one that is never cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone().unwrap_or_default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    pub fn check_cancelled(&self) -> Result<(), Status> {
        if self.is_cancelled() {
            Err(Status::cancelled("call cancelled before start"))
        } else {
            Ok(())
        }
    }

    /// The server side of the call, when running inside a handler
    pub fn server(&self) -> Option<&ServerCallContext> {
        self.server.as_ref()
    }

    pub fn capture(&self) -> Option<&MetadataCapture> {
        self.capture.as_ref()
    }

    /// Captured response headers, if capture was requested and they arrived
    pub fn response_headers(&self) -> Option<Metadata> {
        self.capture.as_ref().and_then(MetadataCapture::headers)
    }

    pub fn trailers(&self) -> Option<Metadata> {
        self.capture.as_ref().and_then(MetadataCapture::trailers)
    }

    pub fn status(&self) -> Option<Status> {
        self.capture.as_ref().and_then(MetadataCapture::status)
    }

    /// Fill what the caller left unset from client defaults
    pub(crate) fn with_defaults(mut self, timeout: Option<Duration>, flags: CallFlags) -> Self {
        if self.timeout.is_none() && self.deadline.is_none() {
            self.timeout = timeout;
        }
        self.with_flags(flags)
    }

    /// Transport options for a call made with this context
    pub fn call_options(&self) -> CallOptions {
        let mut headers = self.headers.clone();
        let deadline = self.deadline();
        match deadline {
            Some(deadline) => {
                let seconds = deadline
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs_f64();
                headers.insert(DEADLINE_KEY, seconds.to_string());
            }
            None => {
                headers.remove(DEADLINE_KEY);
            }
        }

        CallOptions {
            headers,
            deadline,
            cancellation: self.cancellation_token(),
        }
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("headers", &self.headers)
            .field("timeout", &self.timeout)
            .field("deadline", &self.deadline)
            .field("cancelled", &self.is_cancelled())
            .field("flags", &self.flags)
            .field("server", &self.server.as_ref().map(ServerCallContext::method))
            .finish()
    }
}

struct ServerState {
    method: String,
    request_headers: Metadata,
    deadline: Option<SystemTime>,
    cancellation: CancellationToken,
    header_slot: HeaderSlot,
    response_headers: Mutex<Metadata>,
    trailers: Mutex<Metadata>,
}

/// Server side of one call, created by the transport
#[derive(Clone)]
pub struct ServerCallContext {
    state: Arc<ServerState>,
}

impl ServerCallContext {
    pub fn new(
        method: impl Into<String>,
        request_headers: Metadata,
        cancellation: CancellationToken,
        header_slot: HeaderSlot,
    ) -> Self {
        let deadline = Self::parse_deadline(&request_headers);
        Self {
            state: Arc::new(ServerState {
                method: method.into(),
                request_headers,
                deadline,
                cancellation,
                header_slot,
                response_headers: Mutex::new(Metadata::new()),
                trailers: Mutex::new(Metadata::new()),
            }),
        }
    }

    /// Full method name, `/service/method`
    pub fn method(&self) -> &str {
        &self.state.method
    }

    pub fn request_headers(&self) -> &Metadata {
        &self.state.request_headers
    }

    pub fn deadline(&self) -> Option<SystemTime> {
        self.state.deadline
    }

    pub fn remaining_time(&self) -> Option<Duration> {
        self.state.deadline.map(|deadline| {
            deadline
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO)
        })
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        self.state
            .deadline
            .is_some_and(|deadline| SystemTime::now() > deadline)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.state.cancellation.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancellation.is_cancelled()
    }

    /// Stage a response header; fails once headers went out
    pub fn add_response_header(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), Status> {
        if self.state.header_slot.is_sent() {
            return Err(Status::failed_precondition("response headers already sent"));
        }
        self.state.response_headers.lock().insert(key, value);
        Ok(())
    }

    /// Send staged headers plus `headers` right away
    pub fn send_response_headers(&self, headers: Metadata) -> Result<(), Status> {
        let mut staged = std::mem::take(&mut *self.state.response_headers.lock());
        staged.merge(headers);
        if self.state.header_slot.send(staged) {
            Ok(())
        } else {
            Err(Status::failed_precondition("response headers already sent"))
        }
    }

    /// Send staged headers unless something was sent already
    pub fn flush_headers(&self) {
        if !self.state.header_slot.is_sent() {
            let staged = std::mem::take(&mut *self.state.response_headers.lock());
            self.state.header_slot.send(staged);
        }
    }

    pub fn set_trailer(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state.trailers.lock().insert(key, value);
    }

    pub fn trailers(&self) -> Metadata {
        self.state.trailers.lock().clone()
    }

    fn parse_deadline(metadata: &Metadata) -> Option<SystemTime> {
        metadata.get(DEADLINE_KEY).and_then(|deadline| {
            let seconds = deadline.parse::<f64>().ok()?;
            let since_epoch = Duration::try_from_secs_f64(seconds).ok()?;
            SystemTime::UNIX_EPOCH.checked_add(since_epoch)
        })
    }
}

impl fmt::Debug for ServerCallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCallContext")
            .field("method", &self.state.method)
            .field("deadline", &self.state.deadline)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
