// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Server dispatch
//!
//! [`ServiceHost::add_service`] binds every operation of a contract, as
//! implemented by one service object, to a [`ServiceBinder`]. Each operation gets
//! a byte-level handler that decodes the request, builds the argument list the
//! method expects, invokes it and encodes what comes back. Operations that cannot
//! be bound are reported and skipped; the rest are still registered.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use parking_lot::RwLock;

use crate::Status;
use crate::classifier::{CallShape, Slot};
use crate::context::{CallContext, ServerCallContext};
use crate::descriptor::{Contract, Payload};
use crate::error::ContractError;
use crate::fault::{HandlerPanic, translate};
use crate::invoke::{Arg, CallArgs, Dispatch, MethodInvoker, Outcome, PayloadStream, Service};
use crate::marshaller::DynMarshaller;
use crate::operation::{Operation, ServiceContract};
use crate::settings::Settings;
use crate::transport::{
    BoxByteStream, ClientStreamingHandler, DuplexHandler, MethodDef, ResponseSink,
    ServerStreamingHandler, ServiceBinder, UnaryHandler,
};

/// What [`ServiceHost::add_service`] registered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindReport {
    pub service: String,
    pub bound: Vec<String>,
    pub skipped: Vec<String>,
}

/// One bindable operation of a service plan
struct Entry<S: ?Sized> {
    operation: Operation,
    method: MethodDef,
    invoker: MethodInvoker<S>,
    request: DynMarshaller,
    response: DynMarshaller,
    simplified_faults: bool,
}

struct ServicePlan<S: ?Sized> {
    service: String,
    entries: Vec<Arc<Entry<S>>>,
    skipped: Vec<String>,
}

/// Binds service implementations to a transport
pub struct ServiceHost {
    binder: Arc<dyn ServiceBinder>,
    settings: Settings,
    plans: RwLock<HashMap<(TypeId, TypeId), Arc<dyn Any + Send + Sync>>>,
}

impl ServiceHost {
    pub fn new(binder: Arc<dyn ServiceBinder>) -> Self {
        Self::with_settings(binder, Settings::default())
    }

    pub fn with_settings(binder: Arc<dyn ServiceBinder>, settings: Settings) -> Self {
        Self {
            binder,
            settings,
            plans: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Bind every operation of contract `C` to `service`.
    ///
    /// Fails only when the contract itself is malformed. Operations lacking an
    /// implementation or a marshaller are reported to the diagnostic sink and
    /// listed as skipped.
    pub fn add_service<C, S>(&self, service: Arc<S>) -> Result<BindReport, ContractError>
    where
        C: ?Sized + Contract,
        S: ?Sized + Send + Sync + 'static,
        Service<S>: Dispatch<C, Implementation = S>,
    {
        let plan = self.plan::<C, S>()?;

        for entry in &plan.entries {
            self.bind(entry.clone(), service.clone());
        }

        let report = BindReport {
            service: plan.service.clone(),
            bound: plan
                .entries
                .iter()
                .map(|entry| entry.operation.name().to_string())
                .collect(),
            skipped: plan.skipped.clone(),
        };
        tracing::info!(
            service = %report.service,
            bound = report.bound.len(),
            skipped = report.skipped.len(),
            "service bound"
        );
        Ok(report)
    }

    /// The dispatch plan for (`C`, `S`), built once per host
    fn plan<C, S>(&self) -> Result<Arc<ServicePlan<S>>, ContractError>
    where
        C: ?Sized + Contract,
        S: ?Sized + Send + Sync + 'static,
        Service<S>: Dispatch<C, Implementation = S>,
    {
        let key = (TypeId::of::<C>(), TypeId::of::<S>());
        if let Some(plan) = self.plans.read().get(&key).cloned() {
            if let Ok(plan) = plan.downcast::<ServicePlan<S>>() {
                return Ok(plan);
            }
        }

        let plan = Arc::new(self.build_plan::<C, S>()?);
        Ok(self.retain(key, plan))
    }

    /// Keep the first plan stored under `key`; a plan built concurrently by
    /// another bind is dropped in its favour
    fn retain<S>(&self, key: (TypeId, TypeId), plan: Arc<ServicePlan<S>>) -> Arc<ServicePlan<S>>
    where
        S: ?Sized + Send + Sync + 'static,
    {
        let erased: Arc<dyn Any + Send + Sync> = plan.clone();
        let retained = self.plans.write().entry(key).or_insert(erased).clone();
        retained.downcast::<ServicePlan<S>>().unwrap_or(plan)
    }

    fn build_plan<C, S>(&self) -> Result<ServicePlan<S>, ContractError>
    where
        C: ?Sized + Contract,
        S: ?Sized + Send + Sync + 'static,
        Service<S>: Dispatch<C, Implementation = S>,
    {
        let diagnostics = self.settings.diagnostics();
        let contract =
            ServiceContract::build(&C::descriptor(), self.settings.naming(), diagnostics)?;
        let invokers = <Service<S> as Dispatch<C>>::invokers();

        let mut entries = Vec::with_capacity(contract.len());
        let mut skipped = Vec::new();

        for operation in contract.operations() {
            let method = MethodDef::new(contract.name(), operation.name(), operation.call_shape());

            let Some(invoker) = invokers.iter().find(|invoker| {
                invoker.contract() == operation.contract()
                    && invoker.method() == operation.method().name()
            }) else {
                diagnostics.error(&format!("{}: no implementation available", method));
                skipped.push(operation.name().to_string());
                continue;
            };

            let marshallers = self.settings.marshallers();
            let request = marshallers.marshaller_for(&operation.request_type());
            let response = marshallers.marshaller_for(&operation.response_type());
            let (request, response) = match (request, response) {
                (Ok(request), Ok(response)) => (request, response),
                (Err(err), _) | (_, Err(err)) => {
                    diagnostics.error(&format!("{}: {}", method, err));
                    skipped.push(operation.name().to_string());
                    continue;
                }
            };

            entries.push(Arc::new(Entry {
                simplified_faults: operation
                    .simplified_faults()
                    .unwrap_or(self.settings.simplified_faults()),
                operation: operation.clone(),
                method,
                invoker: invoker.clone(),
                request,
                response,
            }));
        }

        Ok(ServicePlan {
            service: contract.name().to_string(),
            entries,
            skipped,
        })
    }

    fn bind<S>(&self, entry: Arc<Entry<S>>, service: Arc<S>)
    where
        S: ?Sized + Send + Sync + 'static,
    {
        tracing::debug!(method = %entry.method, shape = %entry.method.shape(), "binding operation");

        let method = entry.method.clone();
        match method.shape() {
            CallShape::Unary => self.binder.add_unary(method, unary_handler(entry, service)),
            CallShape::ClientStreaming => self
                .binder
                .add_client_streaming(method, client_streaming_handler(entry, service)),
            CallShape::ServerStreaming => self
                .binder
                .add_server_streaming(method, server_streaming_handler(entry, service)),
            CallShape::DuplexStreaming => {
                self.binder.add_duplex(method, duplex_handler(entry, service))
            }
        }
    }
}

impl<S: ?Sized + Send + Sync + 'static> Entry<S> {
    /// Arguments in the order the method declares them
    fn args(&self, request: Option<Arg>, server: &ServerCallContext) -> CallArgs {
        let mut request = request;
        let mut args = CallArgs::default();
        for slot in self.operation.slots() {
            match slot {
                Slot::Request => {
                    if let Some(arg) = request.take() {
                        args.push(arg);
                    }
                }
                Slot::Cancellation => args.push(Arg::cancellation(server.cancellation_token())),
                Slot::Context => args.push(Arg::context(CallContext::from_server(server.clone()))),
            }
        }
        args
    }

    fn decode_request(&self, bytes: Bytes) -> Result<Option<Arg>, Status> {
        if self.operation.request_is_void() {
            return Ok(None);
        }
        Ok(Some(Arg::Value(self.request.decode(bytes)?)))
    }

    fn incoming(&self, requests: BoxByteStream) -> Arg {
        let marshaller = self.request.clone();
        Arg::Stream(
            requests
                .map(move |item| item.and_then(|bytes| marshaller.decode(bytes)))
                .boxed(),
        )
    }

    /// Invoke the method; a panic becomes a failed outcome
    fn invoke(&self, service: &Arc<S>, args: CallArgs) -> Outcome {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.invoker.invoke(service, args))) {
            Ok(outcome) => outcome,
            Err(panic) => Outcome::failed(HandlerPanic::from_payload(panic).into_status()),
        }
    }

    fn translate(&self, status: Status) -> Status {
        let status = translate(status, self.simplified_faults);
        tracing::debug!(method = %self.method, code = %status.code(), "operation failed");
        status
    }

    async fn single(&self, outcome: Outcome) -> Result<Bytes, Status> {
        let payload = match outcome {
            Outcome::Ready(result) => result,
            Outcome::Deferred(future) => AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(HandlerPanic::from_payload(panic).into_status())),
            Outcome::Sequence(_) => Err(Status::internal(format!(
                "{} produced a sequence where a single value was expected",
                self.method
            ))),
        };
        let payload = payload.map_err(|status| self.translate(status))?;
        self.response.encode(payload)
    }

    async fn drain(
        &self,
        outcome: Outcome,
        mut sink: ResponseSink,
        server: &ServerCallContext,
    ) -> Result<(), Status> {
        let mut items = match outcome {
            Outcome::Sequence(items) => guard_sequence(items),
            Outcome::Ready(Err(status)) => return Err(self.translate(status)),
            Outcome::Ready(Ok(_)) | Outcome::Deferred(_) => {
                return Err(Status::internal(format!(
                    "{} produced a single value where a sequence was expected",
                    self.method
                )));
            }
        };

        let token = server.cancellation_token();
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Status::cancelled("call cancelled by client")),
                next = items.next() => next,
            };
            match next {
                Some(Ok(item)) => sink.send(self.response.encode(item)?).await?,
                Some(Err(status)) => return Err(self.translate(status)),
                None => return Ok(()),
            }
        }
    }
}

/// Turn a panic inside a sequence into its final error item
fn guard_sequence(items: PayloadStream) -> PayloadStream {
    AssertUnwindSafe(items)
        .catch_unwind()
        .map(|item| match item {
            Ok(item) => item,
            Err(panic) => Err::<Payload, _>(HandlerPanic::from_payload(panic).into_status()),
        })
        .boxed()
}

fn unary_handler<S>(entry: Arc<Entry<S>>, service: Arc<S>) -> UnaryHandler
where
    S: ?Sized + Send + Sync + 'static,
{
    Arc::new(move |bytes: Bytes, server: ServerCallContext| {
        let entry = entry.clone();
        let service = service.clone();
        async move {
            let request = entry.decode_request(bytes)?;
            let outcome = entry.invoke(&service, entry.args(request, &server));
            entry.single(outcome).await
        }
        .boxed()
    })
}

fn client_streaming_handler<S>(entry: Arc<Entry<S>>, service: Arc<S>) -> ClientStreamingHandler
where
    S: ?Sized + Send + Sync + 'static,
{
    Arc::new(move |requests: BoxByteStream, server: ServerCallContext| {
        let entry = entry.clone();
        let service = service.clone();
        async move {
            let args = entry.args(Some(entry.incoming(requests)), &server);
            let outcome = entry.invoke(&service, args);
            entry.single(outcome).await
        }
        .boxed()
    })
}

fn server_streaming_handler<S>(entry: Arc<Entry<S>>, service: Arc<S>) -> ServerStreamingHandler
where
    S: ?Sized + Send + Sync + 'static,
{
    Arc::new(move |bytes: Bytes, sink: ResponseSink, server: ServerCallContext| {
        let entry = entry.clone();
        let service = service.clone();
        async move {
            let request = entry.decode_request(bytes)?;
            let outcome = entry.invoke(&service, entry.args(request, &server));
            entry.drain(outcome, sink, &server).await
        }
        .boxed()
    })
}

fn duplex_handler<S>(entry: Arc<Entry<S>>, service: Arc<S>) -> DuplexHandler
where
    S: ?Sized + Send + Sync + 'static,
{
    Arc::new(move |requests: BoxByteStream, sink: ResponseSink, server: ServerCallContext| {
        let entry = entry.clone();
        let service = service.clone();
        async move {
            let args = entry.args(Some(entry.incoming(requests)), &server);
            let outcome = entry.invoke(&service, args);
            entry.drain(outcome, sink, &server).await
        }
        .boxed()
    })
}
