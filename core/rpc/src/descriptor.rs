// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Declarative contract descriptions
//!
//! A [`ContractDescriptor`] stands in for runtime reflection: it lists the methods a
//! service trait declares, the shape of every parameter and return value, and the
//! contracts it extends. Descriptors are normally emitted by `#[contract]`, but can
//! be assembled by hand.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use bytes::Bytes;

use crate::Status;
use crate::codec::Codec;

/// A type-erased payload value
pub type Payload = Box<dyn Any + Send>;

/// A service contract, implemented by the `dyn Trait` type of each contract trait
pub trait Contract: 'static {
    fn descriptor() -> ContractDescriptor;
}

/// Identity of a contract type
#[derive(Clone, Copy)]
pub struct ContractId {
    id: TypeId,
    name: &'static str,
}

impl ContractId {
    pub fn of<C: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<C>(),
            name: type_name::<C>(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ContractId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ContractId {}

impl Hash for ContractId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

#[derive(Clone, Copy)]
pub(crate) struct SelfCodec {
    pub(crate) encode: fn(Payload) -> Result<Bytes, Status>,
    pub(crate) decode: fn(Bytes) -> Result<Payload, Status>,
}

/// Identity of a payload type, plus its self-describing codec when it has one
#[derive(Clone, Copy)]
pub struct TypeDescriptor {
    id: TypeId,
    name: &'static str,
    codec: Option<SelfCodec>,
}

impl TypeDescriptor {
    /// A payload type without a built-in codec; it needs an explicit marshaller.
    pub fn of<T: Send + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
            codec: None,
        }
    }

    /// A payload type that encodes and decodes itself.
    pub fn message<T: Codec + Send + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
            codec: Some(SelfCodec {
                encode: encode_erased::<T>,
                decode: decode_erased::<T>,
            }),
        }
    }

    /// The "no payload" marker
    pub fn void() -> Self {
        Self::message::<()>()
    }

    pub fn type_id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_void(&self) -> bool {
        self.id == TypeId::of::<()>()
    }

    pub fn is_self_describing(&self) -> bool {
        self.codec.is_some()
    }

    pub(crate) fn self_codec(&self) -> Option<SelfCodec> {
        self.codec
    }
}

impl PartialEq for TypeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeDescriptor {}

impl Hash for TypeDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

fn encode_erased<T: Codec + Send + 'static>(value: Payload) -> Result<Bytes, Status> {
    match value.downcast::<T>() {
        Ok(value) => (*value).encode(),
        Err(_) => Err(Status::internal(format!(
            "payload is not a {}",
            type_name::<T>()
        ))),
    }
}

fn decode_erased<T: Codec + Send + 'static>(buf: Bytes) -> Result<Payload, Status> {
    Ok(Box::new(T::decode(buf)?))
}

/// The shape of one method parameter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamKind {
    /// A single request value
    Value(TypeDescriptor),
    /// An asynchronous sequence of request values
    Stream(TypeDescriptor),
    /// A cancellation token only
    Cancellation,
    /// A full call context
    CallContext,
    /// A parameter no call shape can carry
    Unsupported(&'static str),
}

impl ParamKind {
    pub fn value<T: Codec + Send + 'static>() -> Self {
        ParamKind::Value(TypeDescriptor::message::<T>())
    }

    pub fn stream<T: Codec + Send + 'static>() -> Self {
        ParamKind::Stream(TypeDescriptor::message::<T>())
    }
}

/// The shape of a method's return type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReturnKind {
    /// A value produced synchronously
    Value(TypeDescriptor),
    /// Nothing, produced synchronously
    Unit,
    /// A value produced later
    Deferred(TypeDescriptor),
    /// Completion without a value, produced later
    DeferredUnit,
    /// An asynchronous sequence of values
    Sequence(TypeDescriptor),
    /// A return type no call shape can carry
    Unsupported(&'static str),
}

impl ReturnKind {
    pub fn value<T: Codec + Send + 'static>() -> Self {
        ReturnKind::Value(TypeDescriptor::message::<T>())
    }

    pub fn deferred<T: Codec + Send + 'static>() -> Self {
        ReturnKind::Deferred(TypeDescriptor::message::<T>())
    }

    pub fn sequence<T: Codec + Send + 'static>() -> Self {
        ReturnKind::Sequence(TypeDescriptor::message::<T>())
    }
}

/// Declarative per-method metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MethodAttributes {
    /// Explicit wire name
    pub name: Option<String>,
    /// The method was explicitly marked as an operation
    pub strict: bool,
    pub simplified_faults: Option<bool>,
}

/// Signature of one contract method
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    name: String,
    params: Vec<ParamKind>,
    returns: ReturnKind,
    generic: bool,
    attributes: MethodAttributes,
}

impl MethodSignature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            returns: ReturnKind::Unit,
            generic: false,
            attributes: MethodAttributes::default(),
        }
    }

    pub fn param(mut self, kind: ParamKind) -> Self {
        self.params.push(kind);
        self
    }

    pub fn returns(mut self, kind: ReturnKind) -> Self {
        self.returns = kind;
        self
    }

    /// Mark the method as type-parameterized
    pub fn generic(mut self) -> Self {
        self.generic = true;
        self
    }

    /// Explicit wire name; also marks the method as an explicit operation
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.attributes.name = Some(name.into());
        self.attributes.strict = true;
        self
    }

    /// Require the method to classify; failure becomes an error
    pub fn strict(mut self) -> Self {
        self.attributes.strict = true;
        self
    }

    pub fn simplified_faults(mut self, enabled: bool) -> Self {
        self.attributes.simplified_faults = Some(enabled);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[ParamKind] {
        &self.params
    }

    pub fn return_kind(&self) -> &ReturnKind {
        &self.returns
    }

    pub fn is_generic(&self) -> bool {
        self.generic
    }

    pub fn attributes(&self) -> &MethodAttributes {
        &self.attributes
    }
}

/// Declarative description of one contract trait
#[derive(Debug, Clone)]
pub struct ContractDescriptor {
    id: ContractId,
    type_name: String,
    namespace: String,
    name: Option<String>,
    inheritable: bool,
    simplified_faults: Option<bool>,
    renames: HashMap<String, String>,
    methods: Vec<MethodSignature>,
    extends: Vec<ContractDescriptor>,
}

impl ContractDescriptor {
    /// Describe contract `C`, declared as `type_name` inside `namespace`
    /// (a module path such as `my_app::greeter`).
    pub fn new<C: ?Sized + 'static>(
        type_name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            id: ContractId::of::<C>(),
            type_name: type_name.into(),
            namespace: namespace.into(),
            name: None,
            inheritable: true,
            simplified_faults: None,
            renames: HashMap::new(),
            methods: Vec::new(),
            extends: Vec::new(),
        }
    }

    /// Explicit wire-level service name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Whether contracts extending this one pick up its operations
    pub fn inheritable(mut self, inheritable: bool) -> Self {
        self.inheritable = inheritable;
        self
    }

    pub fn simplified_faults(mut self, enabled: bool) -> Self {
        self.simplified_faults = Some(enabled);
        self
    }

    /// Contract-level wire name for one of its methods
    pub fn rename(mut self, method: impl Into<String>, name: impl Into<String>) -> Self {
        self.renames.insert(method.into(), name.into());
        self
    }

    pub fn method(mut self, method: MethodSignature) -> Self {
        self.methods.push(method);
        self
    }

    pub fn extends(mut self, parent: ContractDescriptor) -> Self {
        self.extends.push(parent);
        self
    }

    pub fn id(&self) -> ContractId {
        self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn explicit_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_inheritable(&self) -> bool {
        self.inheritable
    }

    pub fn simplified_faults_flag(&self) -> Option<bool> {
        self.simplified_faults
    }

    pub fn renamed(&self, method: &str) -> Option<&str> {
        self.renames.get(method).map(String::as_str)
    }

    pub fn methods(&self) -> &[MethodSignature] {
        &self.methods
    }

    pub fn parents(&self) -> &[ContractDescriptor] {
        &self.extends
    }

    /// This contract followed by every inheritable contract it extends,
    /// transitively, each listed once.
    pub fn interfaces(&self) -> Vec<&ContractDescriptor> {
        let mut seen = Vec::new();
        let mut out = Vec::new();
        let mut pending = vec![self];

        while let Some(next) = pending.pop() {
            if seen.contains(&next.id) {
                continue;
            }
            seen.push(next.id);
            out.push(next);
            for parent in next.extends.iter().rev() {
                if parent.inheritable {
                    pending.push(parent);
                }
            }
        }

        out
    }
}

#[doc(hidden)]
pub struct Probe<T>(PhantomData<fn() -> T>);

impl<T> Probe<T> {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Probe(PhantomData)
    }
}

/// Picks the self-describing descriptor when `T: Codec`; invoked as
/// `(&&Probe::<T>::new()).describe()`.
#[doc(hidden)]
pub trait DescribeMessage {
    fn describe(&self) -> TypeDescriptor;
}

impl<T: Codec + Send + 'static> DescribeMessage for &Probe<T> {
    fn describe(&self) -> TypeDescriptor {
        TypeDescriptor::message::<T>()
    }
}

#[doc(hidden)]
pub trait DescribeOpaque {
    fn describe(&self) -> TypeDescriptor;
}

impl<T: Send + 'static> DescribeOpaque for Probe<T> {
    fn describe(&self) -> TypeDescriptor {
        TypeDescriptor::of::<T>()
    }
}
