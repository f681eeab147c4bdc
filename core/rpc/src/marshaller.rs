// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Marshallers and the marshaller registry
//!
//! A [`Marshaller`] is an encode/decode pair for exactly one payload type. The
//! [`MarshallerRegistry`] resolves one per type by asking its factories in order
//! (explicit registrations, then self-describing types) and caches the outcome,
//! negative outcomes included.

use std::any::{TypeId, type_name};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::RwLock;

use crate::Status;
use crate::codec::Codec;
use crate::descriptor::{Payload, TypeDescriptor};
use crate::error::MarshallerError;

type EncodeFn<T> = Arc<dyn Fn(T) -> Result<Bytes, Status> + Send + Sync>;
type DecodeFn<T> = Arc<dyn Fn(Bytes) -> Result<T, Status> + Send + Sync>;

/// Encode/decode pair for one payload type
pub struct Marshaller<T> {
    encode: EncodeFn<T>,
    decode: DecodeFn<T>,
}

/// A marshaller working on type-erased payloads
pub type DynMarshaller = Marshaller<Payload>;

impl<T> Clone for Marshaller<T> {
    fn clone(&self) -> Self {
        Self {
            encode: Arc::clone(&self.encode),
            decode: Arc::clone(&self.decode),
        }
    }
}

impl<T> fmt::Debug for Marshaller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Marshaller<{}>", type_name::<T>())
    }
}

impl<T: Send + 'static> Marshaller<T> {
    pub fn new<E, D>(encode: E, decode: D) -> Self
    where
        E: Fn(T) -> Result<Bytes, Status> + Send + Sync + 'static,
        D: Fn(Bytes) -> Result<T, Status> + Send + Sync + 'static,
    {
        Self {
            encode: Arc::new(encode),
            decode: Arc::new(decode),
        }
    }

    pub fn encode(&self, value: T) -> Result<Bytes, Status> {
        (self.encode)(value)
    }

    pub fn decode(&self, buf: Bytes) -> Result<T, Status> {
        (self.decode)(buf)
    }

    /// Forget the payload type
    pub fn erase(self) -> DynMarshaller {
        let Marshaller { encode, decode } = self;
        Marshaller::new(
            move |payload: Payload| match payload.downcast::<T>() {
                Ok(value) => encode(*value),
                Err(_) => Err(Status::internal(format!(
                    "payload is not a {}",
                    type_name::<T>()
                ))),
            },
            move |buf| decode(buf).map(|value| Box::new(value) as Payload),
        )
    }
}

impl<T: Codec + Send + 'static> Marshaller<T> {
    /// Use the type's own codec
    pub fn codec() -> Self {
        Marshaller::new(T::encode, T::decode)
    }
}

impl<T: prost::Message + Default + Send + 'static> Marshaller<T> {
    /// Protobuf encoding through `prost`
    pub fn prost() -> Self {
        Marshaller::new(
            |value: T| Ok(Bytes::from(value.encode_to_vec())),
            |buf: Bytes| {
                T::decode(buf).map_err(|e| {
                    let message = format!("failed to decode {}: {}", type_name::<T>(), e);
                    Status::invalid_argument(message)
                })
            },
        )
    }
}

impl<T: bincode::Encode + bincode::Decode<()> + Send + 'static> Marshaller<T> {
    /// Compact binary encoding through `bincode`
    pub fn bincode() -> Self {
        Marshaller::new(
            |value: T| {
                bincode::encode_to_vec(&value, bincode::config::standard())
                    .map(Bytes::from)
                    .map_err(|e| {
                        Status::internal(format!("failed to encode {}: {}", type_name::<T>(), e))
                    })
            },
            |buf: Bytes| {
                bincode::decode_from_slice(&buf, bincode::config::standard())
                    .map(|(value, _)| value)
                    .map_err(|e| {
                        Status::invalid_argument(format!(
                            "failed to decode {}: {}",
                            type_name::<T>(),
                            e
                        ))
                    })
            },
        )
    }
}

impl DynMarshaller {
    /// View an erased marshaller as a typed one
    pub fn typed<T: Send + 'static>(&self) -> Marshaller<T> {
        let erased = self.clone();
        let decoder = self.clone();
        Marshaller::new(
            move |value: T| erased.encode(Box::new(value)),
            move |buf| match decoder.decode(buf)?.downcast::<T>() {
                Ok(value) => Ok(*value),
                Err(_) => Err(Status::internal(format!(
                    "decoded payload is not a {}",
                    type_name::<T>()
                ))),
            },
        )
    }
}

/// One marshalling strategy
pub trait MarshallerFactory: Send + Sync {
    fn create(&self, ty: &TypeDescriptor) -> Option<DynMarshaller>;
}

/// Marshallers registered by hand, per type
#[derive(Default)]
pub struct ExplicitMarshallers {
    entries: RwLock<HashMap<TypeId, DynMarshaller>>,
}

impl ExplicitMarshallers {
    pub fn register<T: Send + 'static>(&self, marshaller: Marshaller<T>) {
        self.entries
            .write()
            .insert(TypeId::of::<T>(), marshaller.erase());
    }
}

impl MarshallerFactory for ExplicitMarshallers {
    fn create(&self, ty: &TypeDescriptor) -> Option<DynMarshaller> {
        self.entries.read().get(&ty.type_id()).cloned()
    }
}

/// Marshallers for types implementing [`Codec`]
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfDescribing;

impl MarshallerFactory for SelfDescribing {
    fn create(&self, ty: &TypeDescriptor) -> Option<DynMarshaller> {
        let codec = ty.self_codec()?;
        Some(Marshaller::new(codec.encode, codec.decode))
    }
}

/// Per-type marshaller resolution with caching
pub struct MarshallerRegistry {
    explicit: Arc<ExplicitMarshallers>,
    factories: Vec<Arc<dyn MarshallerFactory>>,
    cache: RwLock<HashMap<TypeId, Option<DynMarshaller>>>,
}

impl Default for MarshallerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MarshallerRegistry {
    /// Explicit registrations first, then self-describing types
    pub fn new() -> Self {
        let explicit = Arc::new(ExplicitMarshallers::default());
        Self {
            factories: vec![explicit.clone(), Arc::new(SelfDescribing)],
            explicit,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Append a strategy, consulted after the existing ones
    pub fn with_factory(mut self, factory: Arc<dyn MarshallerFactory>) -> Self {
        self.factories.push(factory);
        self.cache.write().clear();
        self
    }

    /// Process-wide registry used when nothing else is configured
    pub fn global() -> Arc<MarshallerRegistry> {
        static GLOBAL: OnceLock<Arc<MarshallerRegistry>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(MarshallerRegistry::new()))
            .clone()
    }

    /// Register an explicit marshaller for `T`
    pub fn register<T: Send + 'static>(&self, marshaller: Marshaller<T>) {
        self.explicit.register(marshaller);
        // a cached outcome for T may predate this registration
        self.cache.write().remove(&TypeId::of::<T>());
    }

    pub fn can_encode(&self, ty: &TypeDescriptor) -> bool {
        self.resolve(ty).is_some()
    }

    pub fn marshaller_for(&self, ty: &TypeDescriptor) -> Result<DynMarshaller, MarshallerError> {
        self.resolve(ty)
            .ok_or(MarshallerError::Unavailable(ty.name()))
    }

    fn resolve(&self, ty: &TypeDescriptor) -> Option<DynMarshaller> {
        if let Some(cached) = self.cache.read().get(&ty.type_id()) {
            return cached.clone();
        }

        let computed = self.factories.iter().find_map(|f| f.create(ty));
        if computed.is_none() {
            tracing::debug!(payload = %ty.name(), "no marshaller available");
        }

        match self.cache.write().entry(ty.type_id()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => slot.insert(computed).clone(),
        }
    }
}
