// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Client proxies
//!
//! A [`Proxy<C>`] implements contract `C` (the implementation is emitted by
//! `#[contract]`) by routing every method through a per-contract table. Each entry
//! pairs the operation's wire method and marshallers with one reshaping adapter,
//! picked from [`ROUTES`] by the operation's classification.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use parking_lot::RwLock;

use crate::Status;
use crate::classifier::{CallShape, ContextStyle, ResultStyle, Slot};
use crate::config::ClientConfiguration;
use crate::context::CallContext;
use crate::descriptor::{Contract, ContractId, Payload, TypeDescriptor};
use crate::error::ProxyError;
use crate::invoke::{Arg, CallArgs, Outcome, PayloadStream};
use crate::marshaller::DynMarshaller;
use crate::operation::{Operation, ServiceContract};
use crate::reshape::{self, CallTarget};
use crate::settings::Settings;
use crate::transport::{CallInvoker, MethodDef};

/// Reshaping strategy of one proxy method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Adapter {
    /// Unary call whose result the caller waits for synchronously
    BlockingUnary,
    Unary,
    ClientStreaming,
    ServerStreaming,
    Duplex,
}

type RouteKey = (CallShape, ContextStyle, ResultStyle, bool);

macro_rules! routes {
    ($(($shape:ident, $context:ident, $result:ident, $void:literal) => $adapter:ident,)*) => {
        &[$(
            (
                (CallShape::$shape, ContextStyle::$context, ResultStyle::$result, $void),
                Adapter::$adapter,
            ),
        )*]
    };
}

/// (shape, context, result, void response) to adapter
static ROUTES: &[(RouteKey, Adapter)] = routes![
    (Unary, None, Synchronous, false) => BlockingUnary,
    (Unary, None, Synchronous, true) => BlockingUnary,
    (Unary, AmbientCancellation, Synchronous, false) => BlockingUnary,
    (Unary, AmbientCancellation, Synchronous, true) => BlockingUnary,
    (Unary, ExplicitCallContext, Synchronous, false) => BlockingUnary,
    (Unary, ExplicitCallContext, Synchronous, true) => BlockingUnary,
    (Unary, None, Deferred, false) => Unary,
    (Unary, None, Deferred, true) => Unary,
    (Unary, AmbientCancellation, Deferred, false) => Unary,
    (Unary, AmbientCancellation, Deferred, true) => Unary,
    (Unary, ExplicitCallContext, Deferred, false) => Unary,
    (Unary, ExplicitCallContext, Deferred, true) => Unary,
    (ClientStreaming, None, Deferred, false) => ClientStreaming,
    (ClientStreaming, None, Deferred, true) => ClientStreaming,
    (ClientStreaming, AmbientCancellation, Deferred, false) => ClientStreaming,
    (ClientStreaming, AmbientCancellation, Deferred, true) => ClientStreaming,
    (ClientStreaming, ExplicitCallContext, Deferred, false) => ClientStreaming,
    (ClientStreaming, ExplicitCallContext, Deferred, true) => ClientStreaming,
    (ServerStreaming, None, AsyncSequence, false) => ServerStreaming,
    (ServerStreaming, AmbientCancellation, AsyncSequence, false) => ServerStreaming,
    (ServerStreaming, ExplicitCallContext, AsyncSequence, false) => ServerStreaming,
    (DuplexStreaming, None, AsyncSequence, false) => Duplex,
    (DuplexStreaming, AmbientCancellation, AsyncSequence, false) => Duplex,
    (DuplexStreaming, ExplicitCallContext, AsyncSequence, false) => Duplex,
];

fn route(operation: &Operation) -> Option<Adapter> {
    let key = (
        operation.call_shape(),
        operation.context_style(),
        operation.result_style(),
        operation.response_is_void(),
    );
    ROUTES
        .iter()
        .find(|(candidate, _)| *candidate == key)
        .map(|(_, adapter)| *adapter)
}

/// One proxy method before it is attached to a transport
#[derive(Debug)]
struct PlannedMethod {
    contract: ContractId,
    method: String,
    def: MethodDef,
    adapter: Adapter,
    slots: Vec<Slot>,
    request_is_void: bool,
    request: DynMarshaller,
    response: DynMarshaller,
}

/// Transport-independent proxy table of one contract
#[derive(Debug)]
struct ProxyPlan {
    service: String,
    methods: Vec<PlannedMethod>,
}

impl ProxyPlan {
    fn build(contract: ServiceContract, settings: &Settings) -> Result<Self, ProxyError> {
        let mut methods = Vec::with_capacity(contract.len());

        for operation in contract.operations() {
            let adapter = route(operation).ok_or_else(|| ProxyError::NoAdapter {
                operation: operation.name().to_string(),
                shape: operation.call_shape(),
                context: operation.context_style(),
                result: operation.result_style(),
                response_is_void: operation.response_is_void(),
            })?;

            let marshaller = |ty: TypeDescriptor| {
                settings
                    .marshallers()
                    .marshaller_for(&ty)
                    .map_err(|source| ProxyError::Marshaller {
                        operation: operation.name().to_string(),
                        source,
                    })
            };

            methods.push(PlannedMethod {
                contract: operation.contract(),
                method: operation.method().name().to_string(),
                def: MethodDef::new(contract.name(), operation.name(), operation.call_shape()),
                adapter,
                slots: operation.slots().to_vec(),
                request_is_void: operation.request_is_void(),
                request: marshaller(operation.request_type())?,
                response: marshaller(operation.response_type())?,
            });
        }

        Ok(Self {
            service: contract.name().to_string(),
            methods,
        })
    }
}

enum Request {
    Single(Payload),
    Stream(PayloadStream),
}

/// A proxy method attached to a transport
struct ProxyMethod {
    target: CallTarget<Payload, Payload>,
    adapter: Adapter,
    slots: Vec<Slot>,
    request_is_void: bool,
}

impl ProxyMethod {
    /// Split arguments into the request and the call context
    fn unpack(&self, args: CallArgs) -> Result<(Request, CallContext), Status> {
        let mut args = args.into_inner();
        let mut request = None;
        let mut ctx = CallContext::new();

        for slot in &self.slots {
            match (slot, args.pop_front()) {
                (Slot::Request, Some(Arg::Value(value))) => request = Some(Request::Single(value)),
                (Slot::Request, Some(Arg::Stream(items))) => request = Some(Request::Stream(items)),
                (Slot::Cancellation, Some(Arg::Cancellation(token))) => {
                    ctx = CallContext::new().with_cancellation(token)
                }
                (Slot::Cancellation | Slot::Context, Some(Arg::Context(context))) => ctx = context,
                (slot, found) => {
                    return Err(Status::internal(format!(
                        "{}: unexpected {:?} for {:?} parameter",
                        self.target.method(),
                        found,
                        slot
                    )));
                }
            }
        }

        let request = match request {
            Some(request) => request,
            None if self.request_is_void => Request::Single(Box::new(())),
            None => {
                return Err(Status::internal(format!(
                    "{}: missing request argument",
                    self.target.method()
                )));
            }
        };
        Ok((request, ctx))
    }

    fn call(&self, args: CallArgs, defaults: &ClientConfiguration) -> Outcome {
        let (request, ctx) = match self.unpack(args) {
            Ok(unpacked) => unpacked,
            Err(status) => return Outcome::failed(status),
        };
        let ctx = ctx.with_defaults(defaults.timeout(), defaults.flags());
        let target = self.target.clone();

        match (self.adapter, request) {
            (Adapter::BlockingUnary, Request::Single(request)) => {
                Outcome::Ready(reshape::unary_blocking(&target, request, ctx))
            }
            (Adapter::Unary, Request::Single(request)) => Outcome::Deferred(
                async move { reshape::unary(&target, request, ctx).await }.boxed(),
            ),
            (Adapter::ClientStreaming, Request::Stream(requests)) => Outcome::Deferred(
                async move { reshape::client_streaming(&target, requests, ctx).await }.boxed(),
            ),
            (Adapter::ServerStreaming, Request::Single(request)) => {
                Outcome::Sequence(reshape::server_streaming(target, request, ctx))
            }
            (Adapter::Duplex, Request::Stream(requests)) => {
                Outcome::Sequence(reshape::duplex(target, requests, ctx))
            }
            (adapter, _) => Outcome::failed(Status::internal(format!(
                "{}: request does not fit the {:?} adapter",
                self.target.method(),
                adapter
            ))),
        }
    }
}

struct ProxyCore {
    service: String,
    methods: HashMap<ContractId, HashMap<String, ProxyMethod>>,
    defaults: ClientConfiguration,
}

impl ProxyCore {
    fn new(plan: &ProxyPlan, invoker: Arc<dyn CallInvoker>, defaults: ClientConfiguration) -> Self {
        let mut methods: HashMap<ContractId, HashMap<String, ProxyMethod>> = HashMap::new();
        for planned in &plan.methods {
            let target = CallTarget::new(
                invoker.clone(),
                planned.def.clone(),
                planned.request.clone(),
                planned.response.clone(),
            );
            methods.entry(planned.contract).or_default().insert(
                planned.method.clone(),
                ProxyMethod {
                    target,
                    adapter: planned.adapter,
                    slots: planned.slots.clone(),
                    request_is_void: planned.request_is_void,
                },
            );
        }

        Self {
            service: plan.service.clone(),
            methods,
            defaults,
        }
    }
}

/// Client implementation of contract `C` over a call invoker
pub struct Proxy<C: ?Sized> {
    core: Arc<ProxyCore>,
    _contract: PhantomData<fn(&C)>,
}

impl<C: ?Sized> Clone for Proxy<C> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            _contract: PhantomData,
        }
    }
}

impl<C: ?Sized> fmt::Debug for Proxy<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("service", &self.core.service)
            .finish_non_exhaustive()
    }
}

impl<C: ?Sized + Contract> Proxy<C> {
    /// Proxy built by the process-wide [`ClientFactory`]
    pub fn new(invoker: Arc<dyn CallInvoker>) -> Result<Self, ProxyError> {
        ClientFactory::global().create_shared(invoker)
    }
}

impl<C: ?Sized> Proxy<C> {
    /// Wire-level service name
    pub fn service(&self) -> &str {
        &self.core.service
    }

    /// Run `method`, declared by `contract`, as a wire call.
    #[doc(hidden)]
    pub fn invoke(&self, contract: ContractId, method: &str, args: CallArgs) -> Outcome {
        match self
            .core
            .methods
            .get(&contract)
            .and_then(|methods| methods.get(method))
        {
            Some(proxy_method) => proxy_method.call(args, &self.core.defaults),
            None => Outcome::failed(Status::unimplemented(format!(
                "{:?}::{} is not an operation of {}",
                contract, method, self.core.service
            ))),
        }
    }
}

/// `Proxy<Self>` may implement contract `P`.
///
/// `#[contract]` implements this for the contract itself and each of its
/// supertraits. Ancestors further up must be listed as supertraits too.
pub trait Inherits<P: ?Sized> {}

/// Builds proxies, caching one table per (contract, invoker type)
pub struct ClientFactory {
    settings: Settings,
    plans: RwLock<HashMap<(TypeId, TypeId), Arc<ProxyPlan>>>,
}

impl Default for ClientFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientFactory {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        Self {
            settings,
            plans: RwLock::new(HashMap::new()),
        }
    }

    /// Factory with default settings, shared by the whole process
    pub fn global() -> &'static ClientFactory {
        static GLOBAL: OnceLock<ClientFactory> = OnceLock::new();
        GLOBAL.get_or_init(ClientFactory::new)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Proxy for contract `C` over a concrete invoker
    pub fn create<C, I>(&self, invoker: Arc<I>) -> Result<Proxy<C>, ProxyError>
    where
        C: ?Sized + Contract,
        I: CallInvoker + 'static,
    {
        let plan = self.plan::<C>(TypeId::of::<I>())?;
        Ok(self.attach(&plan, invoker))
    }

    /// Proxy for contract `C` over a shared invoker
    pub fn create_shared<C>(&self, invoker: Arc<dyn CallInvoker>) -> Result<Proxy<C>, ProxyError>
    where
        C: ?Sized + Contract,
    {
        let plan = self.plan::<C>(TypeId::of::<dyn CallInvoker>())?;
        Ok(self.attach(&plan, invoker))
    }

    fn attach<C: ?Sized>(&self, plan: &ProxyPlan, invoker: Arc<dyn CallInvoker>) -> Proxy<C> {
        Proxy {
            core: Arc::new(ProxyCore::new(plan, invoker, self.settings.client().clone())),
            _contract: PhantomData,
        }
    }

    fn plan<C: ?Sized + Contract>(&self, invoker: TypeId) -> Result<Arc<ProxyPlan>, ProxyError> {
        let key = (TypeId::of::<C>(), invoker);
        if let Some(plan) = self.plans.read().get(&key) {
            return Ok(plan.clone());
        }

        let contract = ServiceContract::build(
            &C::descriptor(),
            self.settings.naming(),
            self.settings.diagnostics(),
        )?;
        let plan = Arc::new(ProxyPlan::build(contract, &self.settings)?);
        tracing::debug!(service = %plan.service, methods = plan.methods.len(), "proxy table built");

        Ok(self.plans.write().entry(key).or_insert(plan).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Code;
    use crate::classifier::classify;
    use crate::descriptor::{ContractDescriptor, MethodSignature, ParamKind, ReturnKind};
    use crate::transport::{
        AsyncClientStreamingCall, AsyncDuplexStreamingCall, AsyncServerStreamingCall,
        AsyncUnaryCall, CallOptions,
    };
    use bytes::Bytes;

    trait Orders {}

    struct Opaque;

    fn orders() -> ContractDescriptor {
        ContractDescriptor::new::<dyn Orders>("Orders", "shop")
            .method(
                MethodSignature::new("place")
                    .param(ParamKind::value::<String>())
                    .returns(ReturnKind::deferred::<String>()),
            )
            .method(MethodSignature::new("ping").returns(ReturnKind::DeferredUnit))
    }

    impl Contract for dyn Orders {
        fn descriptor() -> ContractDescriptor {
            orders()
        }
    }

    trait Broken {}

    impl Contract for dyn Broken {
        fn descriptor() -> ContractDescriptor {
            ContractDescriptor::new::<dyn Broken>("Broken", "shop").method(
                MethodSignature::new("send")
                    .param(ParamKind::Value(TypeDescriptor::of::<Opaque>()))
                    .returns(ReturnKind::DeferredUnit),
            )
        }
    }

    /// Rejects every call without reaching a server
    struct Offline;

    impl CallInvoker for Offline {
        fn unary(&self, _: &MethodDef, _: CallOptions, _: Bytes) -> AsyncUnaryCall {
            unreachable!("no call expected")
        }

        fn client_streaming(&self, _: &MethodDef, _: CallOptions) -> AsyncClientStreamingCall {
            unreachable!("no call expected")
        }

        fn server_streaming(
            &self,
            _: &MethodDef,
            _: CallOptions,
            _: Bytes,
        ) -> AsyncServerStreamingCall {
            unreachable!("no call expected")
        }

        fn duplex_streaming(&self, _: &MethodDef, _: CallOptions) -> AsyncDuplexStreamingCall {
            unreachable!("no call expected")
        }
    }

    fn values() -> Vec<Option<ParamKind>> {
        vec![
            None,
            Some(ParamKind::value::<String>()),
            Some(ParamKind::value::<()>()),
            Some(ParamKind::stream::<String>()),
        ]
    }

    fn returns() -> Vec<ReturnKind> {
        vec![
            ReturnKind::value::<String>(),
            ReturnKind::Unit,
            ReturnKind::deferred::<String>(),
            ReturnKind::deferred::<()>(),
            ReturnKind::DeferredUnit,
            ReturnKind::sequence::<String>(),
            ReturnKind::sequence::<()>(),
        ]
    }

    #[test]
    fn test_every_classification_has_a_route() {
        let contexts = [None, Some(ParamKind::Cancellation), Some(ParamKind::CallContext)];
        let mut classified = 0;

        for request in values() {
            for context in &contexts {
                for kind in returns() {
                    let mut method = MethodSignature::new("m").returns(kind);
                    for param in request.iter().chain(context.iter()) {
                        method = method.param(param.clone());
                    }
                    let Some(classification) = classify(&method) else {
                        continue;
                    };
                    classified += 1;
                    let key = (
                        classification.shape,
                        classification.context,
                        classification.result,
                        classification.response_is_void,
                    );
                    assert!(
                        ROUTES.iter().any(|(candidate, _)| *candidate == key),
                        "no route for {:?}",
                        key
                    );
                }
            }
        }

        assert!(classified > 0);
        assert_eq!(ROUTES.len(), 24);
    }

    #[test]
    fn test_plans_are_cached_per_invoker_type() {
        let factory = ClientFactory::new();
        let first = factory.plan::<dyn Orders>(TypeId::of::<Offline>()).unwrap();
        let second = factory.plan::<dyn Orders>(TypeId::of::<Offline>()).unwrap();
        let shared = factory.plan::<dyn Orders>(TypeId::of::<dyn CallInvoker>()).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &shared));
        assert_eq!(first.service, "shop.Orders");
        assert_eq!(first.methods.len(), 2);
    }

    #[test]
    fn test_missing_marshaller_fails_construction() {
        let err = ClientFactory::new()
            .create::<dyn Broken, _>(Arc::new(Offline))
            .unwrap_err();
        assert!(matches!(err, ProxyError::Marshaller { ref operation, .. } if operation == "Send"));
    }

    #[tokio::test]
    async fn test_unknown_method_is_unimplemented() {
        let proxy = ClientFactory::new()
            .create::<dyn Orders, _>(Arc::new(Offline))
            .unwrap();
        assert_eq!(proxy.service(), "shop.Orders");

        let err = proxy
            .invoke(ContractId::of::<dyn Orders>(), "cancel", CallArgs::default())
            .into_value::<()>()
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
    }

    #[tokio::test]
    async fn test_missing_request_argument() {
        let proxy = ClientFactory::new()
            .create::<dyn Orders, _>(Arc::new(Offline))
            .unwrap();

        let err = proxy
            .invoke(ContractId::of::<dyn Orders>(), "place", CallArgs::default())
            .into_value::<String>()
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }
}
