// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Client-side reshaping of transport calls
//!
//! Each function here drives one transport call shape and hands the result back
//! as a plain value, future or stream. All of them fail fast when the call is
//! already cancelled, enforce the context's deadline, record response metadata
//! when asked to, and always release the transport call.

use std::future::{self, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_stream::try_stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use futures_timer::Delay;
use tokio_util::sync::CancellationToken;

use crate::Status;
use crate::context::{CallContext, MetadataCapture};
use crate::invoke::{RequestStream, ResponseStream};
use crate::marshaller::Marshaller;
use crate::metadata::Metadata;
use crate::transport::{
    AsyncClientStreamingCall, AsyncDuplexStreamingCall, AsyncServerStreamingCall, BoxByteStream,
    CallHandle, CallInvoker, CallOptions, Completion, MethodDef, RequestWriter,
};

/// Everything needed to start calls of one method
pub struct CallTarget<Req, Res> {
    invoker: Arc<dyn CallInvoker>,
    method: Arc<MethodDef>,
    request: Marshaller<Req>,
    response: Marshaller<Res>,
}

impl<Req, Res> Clone for CallTarget<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            invoker: self.invoker.clone(),
            method: self.method.clone(),
            request: self.request.clone(),
            response: self.response.clone(),
        }
    }
}

impl<Req: Send + 'static, Res: Send + 'static> CallTarget<Req, Res> {
    pub fn new(
        invoker: Arc<dyn CallInvoker>,
        method: MethodDef,
        request: Marshaller<Req>,
        response: Marshaller<Res>,
    ) -> Self {
        Self {
            invoker,
            method: Arc::new(method),
            request,
            response,
        }
    }

    pub fn method(&self) -> &MethodDef {
        &self.method
    }
}

/// Races call steps against cancellation and the deadline
struct CallWatch {
    token: CancellationToken,
    deadline: Option<Delay>,
}

impl CallWatch {
    fn new(options: &CallOptions) -> Self {
        let deadline = options.deadline.map(|deadline| {
            Delay::new(
                deadline
                    .duration_since(SystemTime::now())
                    .unwrap_or(Duration::ZERO),
            )
        });
        Self {
            token: options.cancellation.clone(),
            deadline,
        }
    }

    async fn run<T, F>(&mut self, step: F) -> Result<T, Status>
    where
        F: Future<Output = Result<T, Status>>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Status::cancelled("call cancelled")),
            _ = expired(&mut self.deadline) => Err(Status::deadline_exceeded("deadline exceeded")),
            result = step => result,
        }
    }
}

async fn expired(deadline: &mut Option<Delay>) {
    match deadline {
        Some(delay) => delay.await,
        None => future::pending().await,
    }
}

/// Owns the transport call. Records headers and the final status into the
/// context's capture, exactly once, whichever way the call ends.
struct CallGuard {
    handle: CallHandle,
    capture: Option<MetadataCapture>,
    finished: bool,
}

impl CallGuard {
    fn new(handle: CallHandle, ctx: &CallContext) -> Self {
        Self {
            handle,
            capture: ctx.capture().cloned(),
            finished: false,
        }
    }

    fn capturing(&self) -> bool {
        self.capture.is_some()
    }

    async fn headers(&mut self) -> Result<Metadata, Status> {
        let headers = self.handle.response_headers().await?;
        if let Some(capture) = &self.capture {
            capture.record_headers(headers.clone());
        }
        Ok(headers)
    }

    /// Wait for the call to end; a non-OK status becomes the error
    async fn finish(&mut self) -> Result<(), Status> {
        let completion = self.handle.completion().await;
        self.record(&completion);
        if completion.status.is_ok() {
            Ok(())
        } else {
            Err(completion.status)
        }
    }

    /// Abort the call with `status`, keeping whatever trailers the transport
    /// already reported
    fn fail(&mut self, status: Status) -> Status {
        if !self.finished {
            let trailers = self
                .handle
                .try_completion()
                .map(|completion| completion.trailers)
                .unwrap_or_default();
            self.handle.cancel();
            self.record(&Completion {
                status: status.clone(),
                trailers,
            });
        }
        status
    }

    fn observe<T>(&mut self, result: Result<T, Status>) -> Result<T, Status> {
        result.map_err(|status| self.fail(status))
    }

    fn record(&mut self, completion: &Completion) {
        self.finished = true;
        if let Some(capture) = &self.capture {
            capture.record_completion(completion);
        }
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!("call released before completion");
            self.fail(Status::cancelled("call abandoned by client"));
        }
    }
}

/// Send a unary request and wait for the response
pub async fn unary<Req, Res>(
    target: &CallTarget<Req, Res>,
    request: Req,
    ctx: CallContext,
) -> Result<Res, Status>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    ctx.check_cancelled()?;
    let options = ctx.call_options();
    let payload = target.request.encode(request)?;
    let mut watch = CallWatch::new(&options);

    tracing::trace!(method = %target.method, "starting unary call");
    let call = target.invoker.unary(&target.method, options, payload);
    let mut guard = CallGuard::new(call.handle, &ctx);

    let result = async {
        if guard.capturing() {
            watch.run(guard.headers()).await?;
        }
        let bytes = watch.run(call.response).await?;
        let response = target.response.decode(bytes)?;
        watch.run(guard.finish()).await?;
        Ok::<_, Status>(response)
    }
    .await;

    guard.observe(result)
}

/// [`unary`], blocking the current thread until the call ends
pub fn unary_blocking<Req, Res>(
    target: &CallTarget<Req, Res>,
    request: Req,
    ctx: CallContext,
) -> Result<Res, Status>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    futures::executor::block_on(unary(target, request, ctx))
}

/// Stream requests and wait for the single response
pub async fn client_streaming<Req, Res>(
    target: &CallTarget<Req, Res>,
    requests: RequestStream<Req>,
    ctx: CallContext,
) -> Result<Res, Status>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    ctx.check_cancelled()?;
    let options = ctx.call_options();
    let mut watch = CallWatch::new(&options);

    tracing::trace!(method = %target.method, "starting client-streaming call");
    let AsyncClientStreamingCall {
        handle,
        requests: writer,
        mut response,
    } = target.invoker.client_streaming(&target.method, options);
    let mut guard = CallGuard::new(handle, &ctx);

    let send_token = ctx.cancellation_token().child_token();
    let send = send_all(
        writer,
        requests,
        target.request.clone(),
        send_token.clone(),
        ctx.flags().ignore_stream_termination,
    );
    tokio::pin!(send);

    let result = async {
        let mut sent = None;
        let received = watch
            .run(async {
                loop {
                    tokio::select! {
                        outcome = &mut send, if sent.is_none() => {
                            if let Some(status) = request_failure(&outcome) {
                                return Err(status);
                            }
                            sent = Some(outcome);
                        }
                        received = &mut response => return Ok(received),
                    }
                }
            })
            .await?;

        // the server answered, so it is done reading
        let sent = match sent {
            Some(outcome) => outcome,
            None => {
                send_token.cancel();
                send.as_mut().await
            }
        };

        let bytes = received?;
        sent?;
        if guard.capturing() {
            watch.run(guard.headers()).await?;
        }
        let response = target.response.decode(bytes)?;
        watch.run(guard.finish()).await?;
        Ok::<_, Status>(response)
    }
    .await;

    guard.observe(result)
}

/// Send one request and stream the responses
pub fn server_streaming<Req, Res>(
    target: CallTarget<Req, Res>,
    request: Req,
    ctx: CallContext,
) -> ResponseStream<Res>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    server_stream_items(target, request, ctx).boxed()
}

fn server_stream_items<Req, Res>(
    target: CallTarget<Req, Res>,
    request: Req,
    ctx: CallContext,
) -> impl Stream<Item = Result<Res, Status>> + Send + 'static
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    try_stream! {
        ctx.check_cancelled()?;
        let options = ctx.call_options();
        let payload = target.request.encode(request)?;
        let mut watch = CallWatch::new(&options);

        tracing::trace!(method = %target.method, "starting server-streaming call");
        let AsyncServerStreamingCall { handle, mut responses } =
            target
                .invoker
                .server_streaming(&target.method, options, payload);
        let mut guard = CallGuard::new(handle, &ctx);

        let headers = watch.run(guard.headers()).await;
        guard.observe(headers)?;

        loop {
            let next = watch
                .run(async { Ok::<_, Status>(responses.next().await) })
                .await;
            match guard.observe(next)? {
                Some(Ok(bytes)) => {
                    let item = target.response.decode(bytes);
                    let item = guard.observe(item)?;
                    yield item;
                }
                Some(Err(status)) => {
                    Err::<(), _>(guard.fail(status))?;
                }
                None => break,
            }
        }

        let finished = watch.run(guard.finish()).await;
        guard.observe(finished)?;
    }
}

enum Exchange {
    Sent(Result<(), Status>),
    Received(Option<Result<Bytes, Status>>),
}

async fn next_event<F>(
    send: Pin<&mut F>,
    sending: bool,
    responses: &mut BoxByteStream,
) -> Result<Exchange, Status>
where
    F: Future<Output = Result<(), Status>>,
{
    tokio::select! {
        outcome = send, if sending => Ok(Exchange::Sent(outcome)),
        item = responses.next() => Ok(Exchange::Received(item)),
    }
}

/// Stream requests and responses concurrently
pub fn duplex<Req, Res>(
    target: CallTarget<Req, Res>,
    requests: RequestStream<Req>,
    ctx: CallContext,
) -> ResponseStream<Res>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    duplex_items(target, requests, ctx).boxed()
}

fn duplex_items<Req, Res>(
    target: CallTarget<Req, Res>,
    requests: RequestStream<Req>,
    ctx: CallContext,
) -> impl Stream<Item = Result<Res, Status>> + Send + 'static
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    try_stream! {
        ctx.check_cancelled()?;
        let options = ctx.call_options();
        let mut watch = CallWatch::new(&options);

        tracing::trace!(method = %target.method, "starting duplex call");
        let AsyncDuplexStreamingCall { handle, requests: writer, mut responses } =
            target.invoker.duplex_streaming(&target.method, options);
        let mut guard = CallGuard::new(handle, &ctx);

        let send_token = ctx.cancellation_token().child_token();
        let send = send_all(
            writer,
            requests,
            target.request.clone(),
            send_token.clone(),
            ctx.flags().ignore_stream_termination,
        );
        tokio::pin!(send);

        let mut sent: Option<Result<(), Status>> = None;
        let mut headers_seen = false;
        loop {
            let event = watch
                .run(next_event(send.as_mut(), sent.is_none(), &mut responses))
                .await;
            match guard.observe(event)? {
                Exchange::Sent(outcome) => {
                    if let Some(status) = request_failure(&outcome) {
                        Err::<(), _>(guard.fail(status))?;
                    }
                    sent = Some(outcome);
                }
                Exchange::Received(Some(Ok(bytes))) => {
                    if !headers_seen {
                        headers_seen = true;
                        let headers = watch.run(guard.headers()).await;
                        guard.observe(headers)?;
                    }
                    let item = target.response.decode(bytes);
                    let item = guard.observe(item)?;
                    yield item;
                }
                Exchange::Received(Some(Err(status))) => {
                    Err::<(), _>(guard.fail(status))?;
                }
                Exchange::Received(None) => break,
            }
        }

        // the server finished; stop sending whatever is left
        let sent = match sent {
            Some(outcome) => outcome,
            None => {
                send_token.cancel();
                send.as_mut().await
            }
        };

        if !headers_seen {
            let headers = watch.run(guard.headers()).await;
            guard.observe(headers)?;
        }
        let finished = watch.run(guard.finish()).await;
        guard.observe(finished)?;
        sent?;
    }
}

/// Drain `requests` into the transport, then signal the end of the stream.
/// Stops quietly once `token` is cancelled. A failing request stream aborts the
/// call, so the server never mistakes it for a complete one.
async fn send_all<Req: Send + 'static>(
    mut writer: RequestWriter,
    mut requests: RequestStream<Req>,
    marshaller: Marshaller<Req>,
    token: CancellationToken,
    ignore_termination: bool,
) -> Result<(), Status> {
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            next = requests.next() => next,
        };
        let Some(request) = next else {
            break;
        };
        let message = match request.and_then(|request| marshaller.encode(request)) {
            Ok(message) => message,
            Err(status) => {
                tracing::debug!(error = %status, "request stream failed, aborting call");
                writer.abort();
                return Err(status);
            }
        };

        let written = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            written = writer.write(message) => written,
        };
        if let Err(status) = written {
            if ignore_termination {
                tracing::debug!(error = %status, "request stream closed early, truncating");
                return Ok(());
            }
            return Err(Status::incomplete_send(status));
        }
    }

    writer.complete();
    Ok(())
}

/// The error of a request stream that failed on the client side. Requests the
/// server stopped accepting are left to the call's own outcome.
fn request_failure(outcome: &Result<(), Status>) -> Option<Status> {
    match outcome {
        Err(status) if !status.is_incomplete_send() => Some(status.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Code;
    use crate::classifier::CallShape;
    use crate::codec::Codec;
    use crate::context::ServerCallContext;
    use crate::inproc::InProcessChannel;
    use crate::transport::{
        AsyncUnaryCall, CallController, ClientStreamingHandler, DuplexHandler, ResponseSink,
        ServiceBinder,
    };
    use futures::TryStreamExt;
    use futures::future::{self as fut, FutureExt};
    use futures::stream;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    enum Behaviour {
        Echo,
        Fail(Status),
        Hang,
        StreamForever,
        DropRequests,
    }

    struct Mock {
        calls: AtomicUsize,
        tokens: Mutex<Vec<CancellationToken>>,
        behaviour: Behaviour,
    }

    impl Mock {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                tokens: Mutex::new(Vec::new()),
                behaviour,
            })
        }

        fn start(&self, options: &CallOptions) -> (CallHandle, CallController) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let token = options.cancellation.child_token();
            self.tokens.lock().push(token.clone());
            CallHandle::pair(token)
        }

        fn cancelled(&self) -> bool {
            self.tokens.lock().iter().all(CancellationToken::is_cancelled)
        }
    }

    impl CallInvoker for Mock {
        fn unary(&self, _: &MethodDef, options: CallOptions, request: Bytes) -> AsyncUnaryCall {
            let (handle, controller) = self.start(&options);
            let response = match &self.behaviour {
                Behaviour::Echo => {
                    controller.header_slot().send(Metadata::new().with("x-h", "1"));
                    controller.complete(Status::ok(), Metadata::new().with("x-t", "ok"));
                    fut::ready(Ok(request)).boxed()
                }
                Behaviour::Fail(status) => {
                    controller.complete(status.clone(), Metadata::new().with("x-t", "failed"));
                    fut::ready(Err(status.clone())).boxed()
                }
                _ => async move {
                    let _controller = controller;
                    fut::pending().await
                }
                .boxed(),
            };
            AsyncUnaryCall { handle, response }
        }

        fn client_streaming(
            &self,
            _: &MethodDef,
            options: CallOptions,
        ) -> AsyncClientStreamingCall {
            let (handle, controller) = self.start(&options);
            let (tx, mut rx) = mpsc::channel::<Bytes>(1);
            let response = match &self.behaviour {
                Behaviour::Echo => async move {
                    let mut joined = Vec::new();
                    while let Some(message) = rx.recv().await {
                        joined.extend_from_slice(&message);
                    }
                    controller.header_slot().send(Metadata::new().with("x-h", "1"));
                    controller.complete(Status::ok(), Metadata::new().with("x-t", "ok"));
                    Ok(Bytes::from(joined))
                }
                .boxed(),
                Behaviour::DropRequests => {
                    drop(rx);
                    async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        controller.complete(Status::ok(), Metadata::new());
                        Ok(Bytes::from_static(b"done"))
                    }
                    .boxed()
                }
                _ => async move {
                    let _held = (controller, rx);
                    fut::pending().await
                }
                .boxed(),
            };
            let requests = handle.request_writer(tx);
            AsyncClientStreamingCall {
                handle,
                requests,
                response,
            }
        }

        fn server_streaming(
            &self,
            _: &MethodDef,
            options: CallOptions,
            request: Bytes,
        ) -> AsyncServerStreamingCall {
            let (handle, controller) = self.start(&options);
            controller.header_slot().send(Metadata::new());
            let responses = stream::repeat(Ok(request))
                .map(move |item| {
                    let _keep = &controller;
                    item
                })
                .boxed();
            AsyncServerStreamingCall { handle, responses }
        }

        /// Never reads requests. Echo answers once and finishes, DropRequests
        /// refuses every request then answers once, anything else hangs.
        fn duplex_streaming(
            &self,
            _: &MethodDef,
            options: CallOptions,
        ) -> AsyncDuplexStreamingCall {
            let (handle, controller) = self.start(&options);
            let (tx, rx) = mpsc::channel::<Bytes>(1);
            let responses = match &self.behaviour {
                Behaviour::Echo => {
                    controller.header_slot().send(Metadata::new().with("x-h", "1"));
                    controller.complete(Status::ok(), Metadata::new().with("x-t", "ok"));
                    stream::iter(vec![Ok(Bytes::from_static(b"pong"))])
                        .map(move |item: Result<Bytes, Status>| {
                            let _keep = &rx;
                            item
                        })
                        .boxed()
                }
                Behaviour::DropRequests => {
                    drop(rx);
                    // answer after the client found its requests refused
                    stream::once(async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        controller.complete(Status::ok(), Metadata::new());
                        Ok(Bytes::from_static(b"pong"))
                    })
                    .boxed()
                }
                _ => stream::pending()
                    .map(move |item: Result<Bytes, Status>| {
                        let _keep = (&controller, &rx);
                        item
                    })
                    .boxed(),
            };
            let requests = handle.request_writer(tx);
            AsyncDuplexStreamingCall {
                handle,
                requests,
                responses,
            }
        }
    }

    fn target(mock: &Arc<Mock>, shape: CallShape) -> CallTarget<String, String> {
        CallTarget::new(
            mock.clone(),
            MethodDef::new("test.Echo", "Echo", shape),
            Marshaller::codec(),
            Marshaller::codec(),
        )
    }

    fn failing_requests() -> RequestStream<String> {
        stream::iter(vec![
            Ok("a".to_string()),
            Err(Status::internal("producer failed")),
            Ok("b".to_string()),
        ])
        .boxed()
    }

    fn two_requests() -> RequestStream<String> {
        stream::iter(vec![Ok("a".to_string()), Ok("b".to_string())]).boxed()
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let mock = Mock::new(Behaviour::Echo);
        let token = CancellationToken::new();
        token.cancel();
        let ctx = CallContext::new().with_cancellation(token);

        let err = unary(&target(&mock, CallShape::Unary), "x".to_string(), ctx.clone())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);

        let mut responses = server_streaming(
            target(&mock, CallShape::ServerStreaming),
            "x".to_string(),
            ctx,
        );
        assert_eq!(responses.next().await.unwrap().unwrap_err().code(), Code::Cancelled);
        assert_eq!(mock.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unary_captures_metadata() {
        let mock = Mock::new(Behaviour::Echo);
        let ctx = CallContext::new().capture_metadata();

        let response = unary(&target(&mock, CallShape::Unary), "hi".to_string(), ctx.clone())
            .await
            .unwrap();
        assert_eq!(response, "hi");
        assert_eq!(ctx.response_headers().unwrap().get("x-h"), Some("1"));
        assert_eq!(ctx.trailers().unwrap().get("x-t"), Some("ok"));
        assert!(ctx.status().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unary_failure_still_captures_trailers() {
        let mock = Mock::new(Behaviour::Fail(Status::not_found("no such greeting")));
        let ctx = CallContext::new().capture_metadata();

        let err = unary(&target(&mock, CallShape::Unary), "hi".to_string(), ctx.clone())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
        assert_eq!(ctx.status().unwrap().code(), Code::NotFound);
        assert_eq!(ctx.trailers().unwrap().get("x-t"), Some("failed"));
    }

    #[tokio::test]
    async fn test_deadline_cancels_call() {
        let mock = Mock::new(Behaviour::Hang);
        let ctx = CallContext::new()
            .with_timeout(Duration::from_millis(30))
            .capture_metadata();

        let err = unary(&target(&mock, CallShape::Unary), "hi".to_string(), ctx.clone())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
        assert_eq!(ctx.status().unwrap().code(), Code::DeadlineExceeded);
        assert!(mock.cancelled());
    }

    #[tokio::test]
    async fn test_cancellation_mid_call() {
        let mock = Mock::new(Behaviour::Hang);
        let token = CancellationToken::new();
        let ctx = CallContext::new().with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let err = unary(&target(&mock, CallShape::Unary), "hi".to_string(), ctx)
            .await
            .unwrap_err();
        canceller.await.unwrap();
        assert_eq!(err.code(), Code::Cancelled);
        assert!(mock.cancelled());
    }

    #[tokio::test]
    async fn test_incomplete_send() {
        let mock = Mock::new(Behaviour::DropRequests);
        let requests = || stream::iter(vec![Ok("a".to_string()), Ok("b".to_string())]).boxed();

        let err = client_streaming(
            &target(&mock, CallShape::ClientStreaming),
            requests(),
            CallContext::new(),
        )
        .await
        .unwrap_err();
        assert!(err.is_incomplete_send());

        let response = client_streaming(
            &target(&mock, CallShape::ClientStreaming),
            requests(),
            CallContext::new().ignore_stream_termination(),
        )
        .await
        .unwrap();
        assert_eq!(response, "done");
    }

    #[tokio::test]
    async fn test_client_streaming_captures_metadata() {
        let mock = Mock::new(Behaviour::Echo);
        let ctx = CallContext::new().capture_metadata();

        let response = client_streaming(
            &target(&mock, CallShape::ClientStreaming),
            two_requests(),
            ctx.clone(),
        )
        .await
        .unwrap();
        assert_eq!(response, "ab");
        assert_eq!(ctx.response_headers().unwrap().get("x-h"), Some("1"));
        assert_eq!(ctx.trailers().unwrap().get("x-t"), Some("ok"));
        assert!(ctx.status().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_request_stream_error_aborts_call() {
        let mock = Mock::new(Behaviour::Hang);
        let ctx = CallContext::new().capture_metadata();

        let err = client_streaming(
            &target(&mock, CallShape::ClientStreaming),
            failing_requests(),
            ctx.clone(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert_eq!(err.message(), Some("producer failed"));
        assert_eq!(ctx.status().unwrap().code(), Code::Internal);
        assert!(mock.cancelled());

        let mut responses = duplex(
            target(&mock, CallShape::DuplexStreaming),
            failing_requests(),
            CallContext::new(),
        );
        let err = responses.next().await.unwrap().unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(responses.next().await.is_none());
        assert_eq!(mock.calls.load(Ordering::SeqCst), 2);
        assert!(mock.cancelled());
    }

    #[tokio::test]
    async fn test_duplex_stops_sending_when_responses_end() {
        let mock = Mock::new(Behaviour::Echo);
        let ctx = CallContext::new().capture_metadata();
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let requests = stream::repeat_with(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok("ping".to_string())
        })
        .boxed();

        let responses = duplex(target(&mock, CallShape::DuplexStreaming), requests, ctx.clone());
        let responses: Vec<String> =
            tokio::time::timeout(Duration::from_secs(5), responses.try_collect())
                .await
                .expect("send loop stopped")
                .unwrap();
        assert_eq!(responses, vec!["pong"]);
        assert_eq!(ctx.response_headers().unwrap().get("x-h"), Some("1"));
        assert_eq!(ctx.trailers().unwrap().get("x-t"), Some("ok"));
        assert!(ctx.status().unwrap().is_ok());
        assert!(!mock.cancelled());
        // one buffered request and one waiting for room, nothing after
        assert!(pulled.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_duplex_incomplete_send() {
        let mock = Mock::new(Behaviour::DropRequests);

        let mut responses = duplex(
            target(&mock, CallShape::DuplexStreaming),
            two_requests(),
            CallContext::new(),
        );
        assert_eq!(responses.next().await.unwrap().unwrap(), "pong");
        let err = responses.next().await.unwrap().unwrap_err();
        assert!(err.is_incomplete_send());
        assert!(responses.next().await.is_none());

        let responses: Vec<String> = duplex(
            target(&mock, CallShape::DuplexStreaming),
            two_requests(),
            CallContext::new().ignore_stream_termination(),
        )
        .try_collect()
        .await
        .unwrap();
        assert_eq!(responses, vec!["pong"]);
    }

    #[tokio::test]
    async fn test_duplex_deadline() {
        let mock = Mock::new(Behaviour::Hang);
        let ctx = CallContext::new()
            .with_timeout(Duration::from_millis(30))
            .capture_metadata();

        let mut responses = duplex(
            target(&mock, CallShape::DuplexStreaming),
            stream::pending().boxed(),
            ctx.clone(),
        );
        let err = responses.next().await.unwrap().unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
        assert_eq!(ctx.status().unwrap().code(), Code::DeadlineExceeded);
        assert!(mock.cancelled());
    }

    fn in_process<Req, Res>(
        channel: &Arc<InProcessChannel>,
        method: MethodDef,
    ) -> CallTarget<Req, Res>
    where
        Req: Codec + Send + 'static,
        Res: Codec + Send + 'static,
    {
        CallTarget::new(channel.clone(), method, Marshaller::codec(), Marshaller::codec())
    }

    #[tokio::test]
    async fn test_failed_request_stream_is_never_committed() {
        let channel = Arc::new(InProcessChannel::new());
        let committed: Arc<Mutex<Vec<Vec<String>>>> = Arc::default();

        let seen = committed.clone();
        let collect: ClientStreamingHandler =
            Arc::new(move |mut requests: BoxByteStream, _: ServerCallContext| {
                let seen = seen.clone();
                async move {
                    let mut names = Vec::new();
                    while let Some(request) = requests.next().await {
                        names.push(String::from_utf8_lossy(&request?).into_owned());
                    }
                    seen.lock().push(names);
                    Ok(Bytes::from_static(b"committed"))
                }
                .boxed()
            });
        let method = MethodDef::new("test.Names", "Collect", CallShape::ClientStreaming);
        channel.add_client_streaming(method.clone(), collect);
        let target: CallTarget<String, String> = in_process(&channel, method);

        let response = client_streaming(&target, two_requests(), CallContext::new())
            .await
            .unwrap();
        assert_eq!(response, "committed");

        let err = client_streaming(&target, failing_requests(), CallContext::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*committed.lock(), vec![vec!["a".to_string(), "b".to_string()]]);
    }

    #[tokio::test]
    async fn test_failed_duplex_request_stream_is_never_committed() {
        let channel = Arc::new(InProcessChannel::new());
        let finished = Arc::new(AtomicUsize::new(0));

        let done = finished.clone();
        let echo: DuplexHandler = Arc::new(
            move |mut requests: BoxByteStream, mut sink: ResponseSink, _: ServerCallContext| {
                let done = done.clone();
                async move {
                    while let Some(request) = requests.next().await {
                        sink.send(request?).await?;
                    }
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            },
        );
        let method = MethodDef::new("test.Names", "Echo", CallShape::DuplexStreaming);
        channel.add_duplex(method.clone(), echo);
        let target: CallTarget<String, String> = in_process(&channel, method);

        let echoed: Vec<String> = duplex(target.clone(), two_requests(), CallContext::new())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(echoed, vec!["a", "b"]);
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        let results: Vec<Result<String, Status>> =
            duplex(target, failing_requests(), CallContext::new())
                .collect()
                .await;
        let last = results.last().expect("the failure is reported");
        assert_eq!(last.as_ref().unwrap_err().code(), Code::Internal);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_call() {
        let mock = Mock::new(Behaviour::StreamForever);
        let ctx = CallContext::new().capture_metadata();

        let mut responses = server_streaming(
            target(&mock, CallShape::ServerStreaming),
            "tick".to_string(),
            ctx.clone(),
        );
        assert_eq!(responses.next().await.unwrap().unwrap(), "tick");
        assert_eq!(responses.next().await.unwrap().unwrap(), "tick");
        drop(responses);

        assert!(mock.cancelled());
        assert_eq!(ctx.status().unwrap().code(), Code::Cancelled);
        assert!(ctx.response_headers().is_some());
    }

    #[test]
    fn test_unary_blocking() {
        let mock = Mock::new(Behaviour::Echo);
        let response = unary_blocking(
            &target(&mock, CallShape::Unary),
            "blocking".to_string(),
            CallContext::new(),
        )
        .unwrap();
        assert_eq!(response, "blocking");
    }
}
