// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Code-first RPC bindings
//!
//! Service contracts are plain Rust traits annotated with [`contract`]. From a
//! contract the crate derives an operation table, binds implementations to a
//! transport through [`ServiceHost`], and builds working clients as [`Proxy`]
//! values. Everything between the typed methods and the byte-level transport
//! (classification, marshalling, reshaping of calls into futures and streams,
//! metadata and cancellation) lives here.

// generated code refers to this crate by name
extern crate self as codefirst_rpc;

pub mod bytes_value;
pub mod classifier;
pub mod codec;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod fault;
pub mod inproc;
pub mod invoke;
pub mod marshaller;
pub mod metadata;
pub mod naming;
pub mod operation;
pub mod proxy;
pub mod reshape;
pub mod settings;
pub mod status;
pub mod transport;

pub use bytes_value::BytesValue;
pub use classifier::{CallShape, Classification, ContextStyle, ResultStyle, classify};
pub use codec::{Codec, Decoder, Encoder};
pub use config::{BindingConfiguration, ClientConfiguration, RpcConfiguration, TracingConfiguration};
pub use context::{CallContext, CallFlags, ServerCallContext};
pub use descriptor::{
    Contract, ContractDescriptor, ContractId, MethodSignature, ParamKind, ReturnKind,
    TypeDescriptor,
};
pub use diagnostics::{CollectingDiagnostics, DiagnosticSink, TracingDiagnostics};
pub use dispatch::{BindReport, ServiceHost};
pub use error::{ConfigError, ContractError, MarshallerError, ProxyError};
pub use fault::ServiceFault;
pub use inproc::InProcessChannel;
pub use invoke::{RequestStream, ResponseStream};
pub use marshaller::{Marshaller, MarshallerRegistry};
pub use metadata::{DEADLINE_KEY, Metadata};
pub use naming::{DefaultNaming, NamingPolicy};
pub use operation::{Operation, ServiceContract};
pub use proxy::{ClientFactory, Proxy};
pub use settings::Settings;
pub use status::{Code, Status};
pub use transport::{CallInvoker, MethodDef, ServiceBinder};

pub use async_trait::async_trait;
pub use codefirst_rpc_macros::contract;
pub use tokio_util::sync::CancellationToken;

/// Items referenced by `#[contract]` expansions
#[doc(hidden)]
pub mod __private {
    pub use futures::StreamExt;
    pub use futures::stream;

    pub use crate::descriptor::{DescribeMessage, DescribeOpaque, Probe};
    pub use crate::invoke::{Arg, CallArgs, Dispatch, MethodInvoker, Outcome, Service};
    pub use crate::proxy::Inherits;
}
