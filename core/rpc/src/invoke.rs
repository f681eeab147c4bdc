// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Type-erased method invocation
//!
//! Server dispatch and client proxies never see contract methods directly. They
//! move arguments in as [`CallArgs`] and results out as an [`Outcome`]; the code
//! generated by `#[contract]` converts between these and the typed signatures.

use std::any::type_name;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, Stream};
use futures::{FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::Status;
use crate::context::CallContext;
use crate::descriptor::{Contract, ContractId, Payload};

/// Streamed requests, as a contract method receives them
pub type RequestStream<T> = BoxStream<'static, Result<T, Status>>;

/// Streamed responses, as a contract method produces them
pub type ResponseStream<T> = BoxStream<'static, Result<T, Status>>;

/// A stream of type-erased payloads
pub type PayloadStream = BoxStream<'static, Result<Payload, Status>>;

fn downcast<T: 'static>(payload: Payload) -> Result<T, Status> {
    payload.downcast::<T>().map(|value| *value).map_err(|_| {
        Status::internal(format!("payload is not a {}", type_name::<T>()))
    })
}

/// One method argument
pub enum Arg {
    Value(Payload),
    Stream(PayloadStream),
    Cancellation(CancellationToken),
    Context(CallContext),
}

impl Arg {
    pub fn value<T: Send + 'static>(value: T) -> Self {
        Arg::Value(Box::new(value))
    }

    pub fn stream<T: Send + 'static>(requests: RequestStream<T>) -> Self {
        Arg::Stream(
            requests
                .map(|item| item.map(|value| Box::new(value) as Payload))
                .boxed(),
        )
    }

    pub fn cancellation(token: CancellationToken) -> Self {
        Arg::Cancellation(token)
    }

    pub fn context(ctx: CallContext) -> Self {
        Arg::Context(ctx)
    }

    fn kind(&self) -> &'static str {
        match self {
            Arg::Value(_) => "value",
            Arg::Stream(_) => "stream",
            Arg::Cancellation(_) => "cancellation token",
            Arg::Context(_) => "call context",
        }
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Arguments of one call, consumed front to back
#[derive(Debug, Default)]
pub struct CallArgs(VecDeque<Arg>);

impl CallArgs {
    pub fn new(args: Vec<Arg>) -> Self {
        Self(args.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, arg: Arg) {
        self.0.push_back(arg);
    }

    pub fn take_value<T: 'static>(&mut self) -> Result<T, Status> {
        match self.0.pop_front() {
            Some(Arg::Value(payload)) => downcast(payload),
            other => Err(Self::mismatch("value", other)),
        }
    }

    pub fn take_stream<T: Send + 'static>(&mut self) -> Result<RequestStream<T>, Status> {
        match self.0.pop_front() {
            Some(Arg::Stream(payloads)) => {
                Ok(payloads.map(|item| item.and_then(downcast::<T>)).boxed())
            }
            other => Err(Self::mismatch("stream", other)),
        }
    }

    pub fn take_cancellation(&mut self) -> Result<CancellationToken, Status> {
        match self.0.pop_front() {
            Some(Arg::Cancellation(token)) => Ok(token),
            Some(Arg::Context(ctx)) => Ok(ctx.cancellation_token()),
            other => Err(Self::mismatch("cancellation token", other)),
        }
    }

    pub fn take_context(&mut self) -> Result<CallContext, Status> {
        match self.0.pop_front() {
            Some(Arg::Context(ctx)) => Ok(ctx),
            other => Err(Self::mismatch("call context", other)),
        }
    }

    pub(crate) fn into_inner(self) -> VecDeque<Arg> {
        self.0
    }

    fn mismatch(expected: &str, found: Option<Arg>) -> Status {
        let found = found.as_ref().map_or("nothing", Arg::kind);
        Status::internal(format!("expected {} argument, found {}", expected, found))
    }
}

/// What a method invocation produced
pub enum Outcome {
    /// Already available
    Ready(Result<Payload, Status>),
    /// Available later
    Deferred(BoxFuture<'static, Result<Payload, Status>>),
    /// A sequence of values
    Sequence(PayloadStream),
}

impl Outcome {
    pub fn ready<T: Send + 'static>(result: Result<T, Status>) -> Self {
        Outcome::Ready(result.map(|value| Box::new(value) as Payload))
    }

    pub fn deferred<T, F>(future: F) -> Self
    where
        T: Send + 'static,
        F: Future<Output = Result<T, Status>> + Send + 'static,
    {
        Outcome::Deferred(
            future
                .map(|result| result.map(|value| Box::new(value) as Payload))
                .boxed(),
        )
    }

    pub fn sequence<T, S>(items: S) -> Self
    where
        T: Send + 'static,
        S: Stream<Item = Result<T, Status>> + Send + 'static,
    {
        Outcome::Sequence(
            items
                .map(|item| item.map(|value| Box::new(value) as Payload))
                .boxed(),
        )
    }

    pub fn failed(status: Status) -> Self {
        Outcome::Ready(Err(status))
    }

    /// Wait for a single value, blocking the current thread if needed
    pub fn into_result<T: 'static>(self) -> Result<T, Status> {
        match self {
            Outcome::Ready(result) => result.and_then(downcast),
            Outcome::Deferred(future) => futures::executor::block_on(future).and_then(downcast),
            Outcome::Sequence(_) => Err(Self::not_single::<T>()),
        }
    }

    /// Wait for a single value
    pub async fn into_value<T: Send + 'static>(self) -> Result<T, Status> {
        match self {
            Outcome::Ready(result) => result.and_then(downcast),
            Outcome::Deferred(future) => future.await.and_then(downcast),
            Outcome::Sequence(_) => Err(Self::not_single::<T>()),
        }
    }

    /// The produced sequence. A failed outcome becomes a stream holding only
    /// its error.
    pub fn into_stream<T: Send + 'static>(self) -> ResponseStream<T> {
        match self {
            Outcome::Sequence(items) => items.map(|item| item.and_then(downcast::<T>)).boxed(),
            Outcome::Ready(Err(status)) => stream::once(async move { Err(status) }).boxed(),
            Outcome::Ready(Ok(_)) | Outcome::Deferred(_) => {
                let status = Status::internal(format!(
                    "expected a sequence of {}, found a single value",
                    type_name::<T>()
                ));
                stream::once(async move { Err(status) }).boxed()
            }
        }
    }

    fn not_single<T>() -> Status {
        Status::internal(format!(
            "expected a single {}, found a sequence",
            type_name::<T>()
        ))
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Ready(Ok(_)) => f.write_str("Ready(Ok)"),
            Outcome::Ready(Err(status)) => write!(f, "Ready(Err({}))", status),
            Outcome::Deferred(_) => f.write_str("Deferred"),
            Outcome::Sequence(_) => f.write_str("Sequence"),
        }
    }
}

/// Calls one contract method on an implementation of type `S`
pub struct MethodInvoker<S: ?Sized> {
    contract: ContractId,
    method: &'static str,
    call: fn(&Arc<S>, CallArgs) -> Outcome,
}

impl<S: ?Sized> MethodInvoker<S> {
    /// Invoker for `method`, declared by contract `C`
    pub fn new<C: ?Sized + 'static>(
        method: &'static str,
        call: fn(&Arc<S>, CallArgs) -> Outcome,
    ) -> Self {
        Self {
            contract: ContractId::of::<C>(),
            method,
            call,
        }
    }

    pub fn contract(&self) -> ContractId {
        self.contract
    }

    pub fn method(&self) -> &'static str {
        self.method
    }

    pub fn invoke(&self, service: &Arc<S>, args: CallArgs) -> Outcome {
        (self.call)(service, args)
    }
}

impl<S: ?Sized> Clone for MethodInvoker<S> {
    fn clone(&self) -> Self {
        Self {
            contract: self.contract,
            method: self.method,
            call: self.call,
        }
    }
}

impl<S: ?Sized> fmt::Debug for MethodInvoker<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}::{}", self.contract, self.method)
    }
}

/// Marker carrying an implementation type; `#[contract]` implements
/// [`Dispatch`] on it for every implementation of the contract.
pub struct Service<S: ?Sized>(PhantomData<fn(&S)>);

/// Server-side method table of contract `C` for one implementation type
pub trait Dispatch<C: ?Sized + Contract> {
    type Implementation: ?Sized + Send + Sync + 'static;

    /// Invokers for every method of `C` and the contracts it extends
    fn invokers() -> Vec<MethodInvoker<Self::Implementation>>;
}
