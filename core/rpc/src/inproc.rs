// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! In-memory transport
//!
//! [`InProcessChannel`] is both a [`ServiceBinder`] and a [`CallInvoker`]: services
//! bound to it answer calls made through it, with every handler running as its own
//! task on a Tokio runtime.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use crate::Status;
use crate::classifier::CallShape;
use crate::context::ServerCallContext;
use crate::metadata::Metadata;
use crate::transport::{
    AsyncClientStreamingCall, AsyncDuplexStreamingCall, AsyncServerStreamingCall, AsyncUnaryCall,
    BoxByteStream, CallController, CallHandle, CallInvoker, CallOptions, ClientStreamingHandler,
    DuplexHandler, MethodDef, ResponseSink, ServerStreamingHandler, ServiceBinder, UnaryHandler,
};

const DEFAULT_BUFFER: usize = 16;

#[derive(Clone)]
enum Handler {
    Unary(UnaryHandler),
    ClientStreaming(ClientStreamingHandler),
    ServerStreaming(ServerStreamingHandler),
    Duplex(DuplexHandler),
}

impl Handler {
    fn shape(&self) -> CallShape {
        match self {
            Handler::Unary(_) => CallShape::Unary,
            Handler::ClientStreaming(_) => CallShape::ClientStreaming,
            Handler::ServerStreaming(_) => CallShape::ServerStreaming,
            Handler::Duplex(_) => CallShape::DuplexStreaming,
        }
    }
}

/// Client and server ends of the same in-memory channel
#[derive(Clone)]
pub struct InProcessChannel {
    handlers: Arc<RwLock<HashMap<String, Handler>>>,
    runtime: Handle,
    buffer: usize,
}

impl InProcessChannel {
    /// Channel running handlers on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new() -> Self {
        Self::with_runtime(Handle::current())
    }

    pub fn with_runtime(runtime: Handle) -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            runtime,
            buffer: DEFAULT_BUFFER,
        }
    }

    /// Messages buffered per direction of a streaming call
    pub fn with_buffer(self, buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            ..self
        }
    }

    /// Full names of every bound method
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<_> = self.handlers.read().keys().cloned().collect();
        methods.sort();
        methods
    }

    fn register(&self, method: MethodDef, handler: Handler) {
        let full_name = method.full_name();
        tracing::debug!(method = %full_name, shape = %handler.shape(), "registering handler");
        if self.handlers.write().insert(full_name, handler).is_some() {
            tracing::warn!(method = %method, "replaced existing handler");
        }
    }

    /// Set up the server side of a call
    fn accept(&self, method: &MethodDef, options: CallOptions) -> (CallHandle, Accepted) {
        let (handle, controller) = CallHandle::pair(options.cancellation.child_token());
        let server = ServerCallContext::new(
            method.full_name(),
            options.headers,
            controller.cancellation(),
            controller.header_slot(),
        );

        let handler = self.handlers.read().get(&method.full_name()).cloned();
        let accepted = match handler {
            Some(handler) if handler.shape() == method.shape() => Accepted::Call {
                handler,
                controller,
                server,
            },
            Some(handler) => Accepted::Rejected(
                controller,
                Status::unimplemented(format!(
                    "{} is a {} method, called as {}",
                    method,
                    handler.shape(),
                    method.shape()
                )),
            ),
            None => {
                tracing::debug!(method = %method, "no handler bound");
                Accepted::Rejected(
                    controller,
                    Status::unimplemented(format!("method {} is not bound", method)),
                )
            }
        };
        (handle, accepted)
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(task);
    }
}

impl Default for InProcessChannel {
    fn default() -> Self {
        Self::new()
    }
}

enum Accepted {
    Call {
        handler: Handler,
        controller: CallController,
        server: ServerCallContext,
    },
    Rejected(CallController, Status),
}

/// Run one handler to completion, or until the client gives up, and finish
/// the call with its outcome
async fn drive<T, F>(
    controller: CallController,
    server: ServerCallContext,
    call: F,
) -> Result<T, Status>
where
    F: Future<Output = Result<T, Status>>,
{
    let token = controller.cancellation();
    let result = tokio::select! {
        biased;
        _ = token.cancelled() => Err(Status::cancelled("call cancelled by client")),
        result = call => result,
    };

    match &result {
        Ok(_) => {
            server.flush_headers();
            controller.complete(Status::ok(), server.trailers());
        }
        Err(status) => {
            tracing::debug!(method = %server.method(), error = %status, "call failed");
            controller.complete(status.clone(), server.trailers());
        }
    }
    result
}

fn reject(controller: CallController, status: Status) {
    controller.complete(status, Metadata::new());
}

fn reject_with_response(
    controller: CallController,
    response: oneshot::Sender<Result<Bytes, Status>>,
    status: Status,
) {
    reject(controller, status.clone());
    let _ = response.send(Err(status));
}

fn byte_stream(rx: mpsc::Receiver<Bytes>) -> BoxByteStream {
    ReceiverStream::new(rx).map(Ok).boxed()
}

fn unary_response(
    rx: oneshot::Receiver<Result<Bytes, Status>>,
) -> BoxFuture<'static, Result<Bytes, Status>> {
    Box::pin(async move {
        rx.await
            .unwrap_or_else(|_| Err(Status::cancelled("call abandoned by server")))
    })
}

impl CallInvoker for InProcessChannel {
    fn unary(&self, method: &MethodDef, options: CallOptions, request: Bytes) -> AsyncUnaryCall {
        let (handle, accepted) = self.accept(method, options);
        let (tx, rx) = oneshot::channel();

        match accepted {
            Accepted::Call {
                handler: Handler::Unary(handler),
                controller,
                server,
            } => self.spawn(async move {
                let call = handler(request, server.clone());
                let result = drive(controller, server, call).await;
                let _ = tx.send(result);
            }),
            Accepted::Call { controller, .. } => {
                reject_with_response(controller, tx, Status::internal("handler shape mismatch"))
            }
            Accepted::Rejected(controller, status) => reject_with_response(controller, tx, status),
        }

        AsyncUnaryCall {
            handle,
            response: unary_response(rx),
        }
    }

    fn client_streaming(
        &self,
        method: &MethodDef,
        options: CallOptions,
    ) -> AsyncClientStreamingCall {
        let (handle, accepted) = self.accept(method, options);
        let (requests_tx, requests_rx) = mpsc::channel(self.buffer);
        let (tx, rx) = oneshot::channel();

        match accepted {
            Accepted::Call {
                handler: Handler::ClientStreaming(handler),
                controller,
                server,
            } => self.spawn(async move {
                let call = handler(byte_stream(requests_rx), server.clone());
                let result = drive(controller, server, call).await;
                let _ = tx.send(result);
            }),
            Accepted::Call { controller, .. } => {
                reject_with_response(controller, tx, Status::internal("handler shape mismatch"))
            }
            Accepted::Rejected(controller, status) => reject_with_response(controller, tx, status),
        }

        let requests = handle.request_writer(requests_tx);
        AsyncClientStreamingCall {
            handle,
            requests,
            response: unary_response(rx),
        }
    }

    fn server_streaming(
        &self,
        method: &MethodDef,
        options: CallOptions,
        request: Bytes,
    ) -> AsyncServerStreamingCall {
        let (handle, accepted) = self.accept(method, options);
        let (responses_tx, responses_rx) = mpsc::channel(self.buffer);

        match accepted {
            Accepted::Call {
                handler: Handler::ServerStreaming(handler),
                controller,
                server,
            } => self.spawn(async move {
                let sink = ResponseSink::new(responses_tx, server.clone());
                let call = handler(request, sink, server.clone());
                let _ = drive(controller, server, call).await;
            }),
            Accepted::Call { controller, .. } => {
                reject(controller, Status::internal("handler shape mismatch"))
            }
            Accepted::Rejected(controller, status) => reject(controller, status),
        }

        AsyncServerStreamingCall {
            handle,
            responses: byte_stream(responses_rx),
        }
    }

    fn duplex_streaming(
        &self,
        method: &MethodDef,
        options: CallOptions,
    ) -> AsyncDuplexStreamingCall {
        let (handle, accepted) = self.accept(method, options);
        let (requests_tx, requests_rx) = mpsc::channel(self.buffer);
        let (responses_tx, responses_rx) = mpsc::channel(self.buffer);

        match accepted {
            Accepted::Call {
                handler: Handler::Duplex(handler),
                controller,
                server,
            } => self.spawn(async move {
                let sink = ResponseSink::new(responses_tx, server.clone());
                let call = handler(byte_stream(requests_rx), sink, server.clone());
                let _ = drive(controller, server, call).await;
            }),
            Accepted::Call { controller, .. } => {
                reject(controller, Status::internal("handler shape mismatch"))
            }
            Accepted::Rejected(controller, status) => reject(controller, status),
        }

        let requests = handle.request_writer(requests_tx);
        AsyncDuplexStreamingCall {
            handle,
            requests,
            responses: byte_stream(responses_rx),
        }
    }
}

impl ServiceBinder for InProcessChannel {
    fn add_unary(&self, method: MethodDef, handler: UnaryHandler) {
        self.register(method, Handler::Unary(handler));
    }

    fn add_client_streaming(&self, method: MethodDef, handler: ClientStreamingHandler) {
        self.register(method, Handler::ClientStreaming(handler));
    }

    fn add_server_streaming(&self, method: MethodDef, handler: ServerStreamingHandler) {
        self.register(method, Handler::ServerStreaming(handler));
    }

    fn add_duplex(&self, method: MethodDef, handler: DuplexHandler) {
        self.register(method, Handler::Duplex(handler));
    }
}
