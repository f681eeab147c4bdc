// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! The seam between bindings and a concrete transport
//!
//! Client bindings drive a [`CallInvoker`]; server bindings register byte-level
//! handlers with a [`ServiceBinder`]. A transport implements one or both.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::Status;
use crate::classifier::CallShape;
use crate::context::ServerCallContext;
use crate::metadata::Metadata;

/// A stream of encoded messages
pub type BoxByteStream = BoxStream<'static, Result<Bytes, Status>>;

/// Transport-level description of one method
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDef {
    service: String,
    name: String,
    shape: CallShape,
}

impl MethodDef {
    pub fn new(service: impl Into<String>, name: impl Into<String>, shape: CallShape) -> Self {
        Self {
            service: service.into(),
            name: name.into(),
            shape,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> CallShape {
        self.shape
    }

    /// `/service/method`
    pub fn full_name(&self) -> String {
        format!("/{}/{}", self.service, self.name)
    }
}

impl fmt::Display for MethodDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.service, self.name)
    }
}

/// Per-call options handed to the transport
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub headers: Metadata,
    pub deadline: Option<SystemTime>,
    pub cancellation: CancellationToken,
}

/// Final status and trailers of a call
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub status: Status,
    pub trailers: Metadata,
}

impl Completion {
    pub fn ok(trailers: Metadata) -> Self {
        Self {
            status: Status::ok(),
            trailers,
        }
    }

    pub fn failed(status: Status) -> Self {
        Self {
            status,
            trailers: Metadata::new(),
        }
    }
}

type HeaderResult = Result<Metadata, Status>;

#[derive(Default)]
struct SlotState {
    tx: Option<oneshot::Sender<HeaderResult>>,
    sent: bool,
}

/// Write-once slot for response headers, shared by the transport and the
/// server-side call context
#[derive(Clone, Default)]
pub struct HeaderSlot(Arc<Mutex<SlotState>>);

impl HeaderSlot {
    fn new(tx: oneshot::Sender<HeaderResult>) -> Self {
        Self(Arc::new(Mutex::new(SlotState {
            tx: Some(tx),
            sent: false,
        })))
    }

    /// Publish headers. Returns false if they were already published.
    pub fn send(&self, headers: Metadata) -> bool {
        let mut state = self.0.lock();
        if state.sent {
            return false;
        }
        state.sent = true;
        if let Some(tx) = state.tx.take() {
            // the client may have stopped listening; that is fine
            let _ = tx.send(Ok(headers));
        }
        true
    }

    pub fn is_sent(&self) -> bool {
        self.0.lock().sent
    }

    /// Stop waiting for headers; readers then resolve from the completion
    fn close(&self) {
        let mut state = self.0.lock();
        state.sent = true;
        state.tx.take();
    }
}

impl fmt::Debug for HeaderSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderSlot")
            .field("sent", &self.is_sent())
            .finish()
    }
}

type SharedHeaders = Shared<BoxFuture<'static, HeaderResult>>;
type SharedCompletion = Shared<BoxFuture<'static, Completion>>;

/// Client-side view of a call in flight.
///
/// Dropping the handle before the call completes cancels the call.
pub struct CallHandle {
    headers: SharedHeaders,
    completion: SharedCompletion,
    cancel: CancellationToken,
}

/// Transport-side counterpart of a [`CallHandle`]
pub struct CallController {
    headers: HeaderSlot,
    completion: Option<oneshot::Sender<Completion>>,
    cancel: CancellationToken,
}

impl CallHandle {
    /// Create the two ends of a call. `cancel` is triggered when the client
    /// gives up on the call.
    pub fn pair(cancel: CancellationToken) -> (CallHandle, CallController) {
        let (completion_tx, completion_rx) = oneshot::channel::<Completion>();
        let completion: SharedCompletion = async move {
            completion_rx.await.unwrap_or_else(|_| {
                Completion::failed(Status::cancelled("call abandoned by transport"))
            })
        }
        .boxed()
        .shared();

        let (headers_tx, headers_rx) = oneshot::channel::<HeaderResult>();
        let on_completion = completion.clone();
        let headers: SharedHeaders = async move {
            match headers_rx.await {
                Ok(headers) => headers,
                // no headers were sent; the call outcome decides
                Err(_) => {
                    let completion = on_completion.await;
                    if completion.status.is_ok() {
                        Ok(Metadata::new())
                    } else {
                        Err(completion.status)
                    }
                }
            }
        }
        .boxed()
        .shared();

        let handle = CallHandle {
            headers,
            completion,
            cancel: cancel.clone(),
        };
        let controller = CallController {
            headers: HeaderSlot::new(headers_tx),
            completion: Some(completion_tx),
            cancel,
        };
        (handle, controller)
    }

    /// Resolves once response headers arrive, or with the call's status if it
    /// fails before sending any
    pub fn response_headers(&self) -> SharedHeaders {
        self.headers.clone()
    }

    pub fn completion(&self) -> SharedCompletion {
        self.completion.clone()
    }

    /// The completion, if the call already finished
    pub fn try_completion(&self) -> Option<Completion> {
        self.completion.clone().now_or_never()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Writer feeding `tx`, whose [`RequestWriter::abort`] cancels this call
    pub fn request_writer(&self, tx: mpsc::Sender<Bytes>) -> RequestWriter {
        RequestWriter {
            tx,
            cancel: self.cancel.clone(),
        }
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        if self.try_completion().is_none() {
            self.cancel.cancel();
        }
    }
}

impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl CallController {
    pub fn header_slot(&self) -> HeaderSlot {
        self.headers.clone()
    }

    /// Triggered when the client cancels or drops the call
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Finish the call. Headers not yet sent are sent empty on success and
    /// never on failure.
    pub fn complete(mut self, status: Status, trailers: Metadata) {
        if status.is_ok() {
            self.headers.send(Metadata::new());
        } else {
            self.headers.close();
        }
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(Completion { status, trailers });
        }
    }
}

impl Drop for CallController {
    fn drop(&mut self) {
        if self.completion.is_some() {
            tracing::debug!("call dropped by transport before completion");
            self.headers.close();
        }
    }
}

/// Client-side writer for streamed requests
pub struct RequestWriter {
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

impl RequestWriter {
    pub async fn write(&mut self, message: Bytes) -> Result<(), Status> {
        self.tx
            .send(message)
            .await
            .map_err(|_| Status::unavailable("request stream closed by server"))
    }

    /// Signal the end of the request stream
    pub fn complete(self) {
        drop(self.tx);
    }

    /// Give up on the call. The server sees cancellation, never a clean end of
    /// the request stream.
    pub fn abort(self) {
        self.cancel.cancel();
        drop(self.tx);
    }
}

/// Server-side sink for streamed responses. Pending response headers are
/// flushed before the first message.
pub struct ResponseSink {
    tx: mpsc::Sender<Bytes>,
    context: ServerCallContext,
}

impl ResponseSink {
    pub fn new(tx: mpsc::Sender<Bytes>, context: ServerCallContext) -> Self {
        Self { tx, context }
    }

    pub async fn send(&mut self, message: Bytes) -> Result<(), Status> {
        self.context.flush_headers();
        self.tx
            .send(message)
            .await
            .map_err(|_| Status::cancelled("response stream closed by client"))
    }
}

pub struct AsyncUnaryCall {
    pub handle: CallHandle,
    pub response: BoxFuture<'static, Result<Bytes, Status>>,
}

pub struct AsyncClientStreamingCall {
    pub handle: CallHandle,
    pub requests: RequestWriter,
    pub response: BoxFuture<'static, Result<Bytes, Status>>,
}

pub struct AsyncServerStreamingCall {
    pub handle: CallHandle,
    /// Ends when the call ends; the outcome is on the handle
    pub responses: BoxByteStream,
}

pub struct AsyncDuplexStreamingCall {
    pub handle: CallHandle,
    pub requests: RequestWriter,
    pub responses: BoxByteStream,
}

/// Starts calls on behalf of client bindings
pub trait CallInvoker: Send + Sync {
    fn unary(&self, method: &MethodDef, options: CallOptions, request: Bytes) -> AsyncUnaryCall;

    fn client_streaming(&self, method: &MethodDef, options: CallOptions)
    -> AsyncClientStreamingCall;

    fn server_streaming(
        &self,
        method: &MethodDef,
        options: CallOptions,
        request: Bytes,
    ) -> AsyncServerStreamingCall;

    fn duplex_streaming(&self, method: &MethodDef, options: CallOptions)
    -> AsyncDuplexStreamingCall;
}

pub type UnaryHandler = Arc<
    dyn Fn(Bytes, ServerCallContext) -> BoxFuture<'static, Result<Bytes, Status>> + Send + Sync,
>;

pub type ClientStreamingHandler = Arc<
    dyn Fn(BoxByteStream, ServerCallContext) -> BoxFuture<'static, Result<Bytes, Status>>
        + Send
        + Sync,
>;

pub type ServerStreamingHandler = Arc<
    dyn Fn(Bytes, ResponseSink, ServerCallContext) -> BoxFuture<'static, Result<(), Status>>
        + Send
        + Sync,
>;

pub type DuplexHandler = Arc<
    dyn Fn(BoxByteStream, ResponseSink, ServerCallContext) -> BoxFuture<'static, Result<(), Status>>
        + Send
        + Sync,
>;

/// Accepts byte-level handlers from server bindings
pub trait ServiceBinder: Send + Sync {
    fn add_unary(&self, method: MethodDef, handler: UnaryHandler);

    fn add_client_streaming(&self, method: MethodDef, handler: ClientStreamingHandler);

    fn add_server_streaming(&self, method: MethodDef, handler: ServerStreamingHandler);

    fn add_duplex(&self, method: MethodDef, handler: DuplexHandler);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Code;

    #[test]
    fn test_full_name() {
        let method = MethodDef::new("greet.Greeter", "SayHello", CallShape::Unary);
        assert_eq!(method.full_name(), "/greet.Greeter/SayHello");
        assert_eq!(method.to_string(), method.full_name());
    }

    #[tokio::test]
    async fn test_headers_then_completion() {
        let (handle, controller) = CallHandle::pair(CancellationToken::new());
        assert!(controller.header_slot().send(Metadata::new().with("a", "1")));
        assert!(!controller.header_slot().send(Metadata::new()));
        controller.complete(Status::ok(), Metadata::new().with("t", "2"));

        let headers = handle.response_headers().await.unwrap();
        assert_eq!(headers.get("a"), Some("1"));
        let completion = handle.completion().await;
        assert!(completion.status.is_ok());
        assert_eq!(completion.trailers.get("t"), Some("2"));
        assert!(!handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_failure_without_headers() {
        let (handle, controller) = CallHandle::pair(CancellationToken::new());
        controller.complete(Status::not_found("nope"), Metadata::new());

        let err = handle.response_headers().await.unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_abandoned_call() {
        let (handle, controller) = CallHandle::pair(CancellationToken::new());
        drop(controller);

        let completion = handle.completion().await;
        assert_eq!(completion.status.code(), Code::Cancelled);
        assert!(handle.response_headers().await.is_err());
    }

    #[test]
    fn test_dropping_incomplete_handle_cancels() {
        let token = CancellationToken::new();
        let (handle, controller) = CallHandle::pair(token.clone());
        assert!(handle.try_completion().is_none());
        drop(handle);
        assert!(token.is_cancelled());
        assert!(controller.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn test_aborted_writer_cancels_call() {
        let (handle, controller) = CallHandle::pair(CancellationToken::new());
        let (tx, mut rx) = mpsc::channel(4);

        let mut writer = handle.request_writer(tx);
        writer.write(Bytes::from_static(b"a")).await.unwrap();
        writer.abort();

        // cancelled before the stream is seen to end
        assert!(controller.cancellation().is_cancelled());
        assert_eq!(&rx.recv().await.unwrap()[..], b"a");
        assert!(rx.recv().await.is_none());
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_completed_writer_does_not_cancel() {
        let (handle, controller) = CallHandle::pair(CancellationToken::new());
        let (tx, mut rx) = mpsc::channel(4);

        handle.request_writer(tx).complete();
        assert!(rx.recv().await.is_none());
        assert!(!controller.cancellation().is_cancelled());
    }

    #[test]
    fn test_dropping_complete_handle_does_not_cancel() {
        let token = CancellationToken::new();
        let (handle, controller) = CallHandle::pair(token.clone());
        controller.complete(Status::ok(), Metadata::new());
        drop(handle);
        assert!(!token.is_cancelled());
    }
}
