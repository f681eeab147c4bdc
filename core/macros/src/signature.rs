// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Syntactic reading of contract method signatures

use quote::ToTokens;
use syn::{FnArg, GenericArgument, PathArguments, PathSegment, ReturnType, Signature, Type};

/// One parameter after `&self`
#[derive(Debug, Clone)]
pub enum Param {
    Value(Type),
    /// `RequestStream<T>`, holding `T`
    Stream(Type),
    Context,
    Cancellation,
    Unsupported(String),
}

/// What a method hands back
#[derive(Debug, Clone)]
pub enum Returns {
    /// `Result<T, Status>`
    Value(Type),
    /// `Result<(), Status>`
    Unit,
    /// `ResponseStream<T>` or `Result<ResponseStream<T>, Status>`, holding `T`
    Sequence { item: Type, fallible: bool },
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receiver {
    /// `&self`
    Shared,
    /// `&mut self`, `self` or none at all
    Other,
}

/// A method signature as far as binding is concerned
#[derive(Debug, Clone)]
pub struct MethodShape {
    pub receiver: Receiver,
    pub is_async: bool,
    pub is_generic: bool,
    pub params: Vec<(Param, Type)>,
    pub returns: Returns,
}

impl MethodShape {
    pub fn read(sig: &Signature) -> Self {
        let receiver = match sig.receiver() {
            Some(r) if r.reference.is_some() && r.mutability.is_none() => Receiver::Shared,
            _ => Receiver::Other,
        };

        let params = sig
            .inputs
            .iter()
            .filter_map(|arg| match arg {
                FnArg::Typed(typed) => Some((param(&typed.ty), (*typed.ty).clone())),
                FnArg::Receiver(_) => None,
            })
            .collect();

        Self {
            receiver,
            is_async: sig.asyncness.is_some(),
            is_generic: !sig.generics.params.is_empty(),
            params,
            returns: returns(&sig.output),
        }
    }

    /// Whether dispatch and proxy code can be generated
    pub fn is_bindable(&self) -> bool {
        self.receiver == Receiver::Shared
            && !self.is_generic
            && !matches!(self.returns, Returns::Unsupported(_))
            && self.has_operation_params()
            && self.has_operation_return()
    }

    /// At most one request, then at most one trailing context
    pub fn has_operation_params(&self) -> bool {
        let mut params = self.params.iter().map(|(param, _)| param).peekable();
        params.next_if(|param| matches!(param, Param::Value(_) | Param::Stream(_)));
        params.next_if(|param| matches!(param, Param::Context | Param::Cancellation));
        params.next().is_none()
    }

    /// A streamed request is answered by a future or a response stream, never
    /// synchronously
    pub fn has_operation_return(&self) -> bool {
        let streams_requests = matches!(self.params.first(), Some((Param::Stream(_), _)));
        !streams_requests || self.is_async || matches!(self.returns, Returns::Sequence { .. })
    }
}

fn last_segment(ty: &Type) -> Option<&PathSegment> {
    match ty {
        Type::Path(path) if path.qself.is_none() => path.path.segments.last(),
        _ => None,
    }
}

fn generic_types(segment: &PathSegment) -> Vec<&Type> {
    match &segment.arguments {
        PathArguments::AngleBracketed(args) => args
            .args
            .iter()
            .filter_map(|arg| match arg {
                GenericArgument::Type(ty) => Some(ty),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// `T` of `Name<T>`
fn single_argument<'a>(ty: &'a Type, name: &str) -> Option<&'a Type> {
    let segment = last_segment(ty)?;
    if segment.ident != name {
        return None;
    }
    match generic_types(segment).as_slice() {
        [inner] => Some(*inner),
        _ => None,
    }
}

fn is_named(ty: &Type, name: &str) -> bool {
    last_segment(ty).is_some_and(|segment| segment.ident == name && segment.arguments.is_empty())
}

fn is_unit(ty: &Type) -> bool {
    matches!(ty, Type::Tuple(tuple) if tuple.elems.is_empty())
}

fn unwrap_group(ty: &Type) -> &Type {
    match ty {
        Type::Group(group) => unwrap_group(&group.elem),
        Type::Paren(paren) => unwrap_group(&paren.elem),
        _ => ty,
    }
}

fn describe(ty: &Type) -> String {
    ty.to_token_stream().to_string()
}

fn param(ty: &Type) -> Param {
    let ty = unwrap_group(ty);
    match ty {
        Type::Path(_) => {}
        Type::Tuple(_) | Type::Array(_) => return Param::Value(ty.clone()),
        _ => return Param::Unsupported(describe(ty)),
    }

    if let Some(inner) = single_argument(ty, "RequestStream") {
        Param::Stream(inner.clone())
    } else if is_named(ty, "CallContext") {
        Param::Context
    } else if is_named(ty, "CancellationToken") {
        Param::Cancellation
    } else {
        Param::Value(ty.clone())
    }
}

fn returns(output: &ReturnType) -> Returns {
    let ty = match output {
        ReturnType::Default => return Returns::Unsupported("()".to_string()),
        ReturnType::Type(_, ty) => unwrap_group(ty),
    };

    if let Some(item) = single_argument(ty, "ResponseStream") {
        return Returns::Sequence {
            item: item.clone(),
            fallible: false,
        };
    }

    let Some(segment) = last_segment(ty).filter(|segment| segment.ident == "Result") else {
        return Returns::Unsupported(describe(ty));
    };
    let (value, error) = match generic_types(segment).as_slice() {
        [value, error] => (*value, *error),
        _ => return Returns::Unsupported(describe(ty)),
    };
    if !is_named(error, "Status") {
        return Returns::Unsupported(describe(ty));
    }

    let value = unwrap_group(value);
    if is_unit(value) {
        Returns::Unit
    } else if let Some(item) = single_argument(value, "ResponseStream") {
        Returns::Sequence {
            item: item.clone(),
            fallible: true,
        }
    } else {
        Returns::Value(value.clone())
    }
}
