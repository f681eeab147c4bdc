// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Method shape classification
//!
//! A method becomes an operation only when its signature matches one entry of a
//! fixed pattern table. Each entry fixes the call shape, how call context is
//! supplied, how the result is wrapped and which parameter slot carries what.
//! Anything else (more than three parameters, type-parameterized methods, unknown
//! parameter or return shapes) is not an operation.

use std::fmt;
use std::sync::OnceLock;

use crate::descriptor::{MethodSignature, ParamKind, ReturnKind, TypeDescriptor};

/// Maximum number of parameters an operation may declare
pub const MAX_PARAMETERS: usize = 3;

/// The four canonical RPC call shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallShape {
    Unary,
    ClientStreaming,
    ServerStreaming,
    DuplexStreaming,
}

impl CallShape {
    pub fn streams_requests(&self) -> bool {
        matches!(self, CallShape::ClientStreaming | CallShape::DuplexStreaming)
    }

    pub fn streams_responses(&self) -> bool {
        matches!(self, CallShape::ServerStreaming | CallShape::DuplexStreaming)
    }
}

impl fmt::Display for CallShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallShape::Unary => "unary",
            CallShape::ClientStreaming => "client-streaming",
            CallShape::ServerStreaming => "server-streaming",
            CallShape::DuplexStreaming => "duplex-streaming",
        };
        f.write_str(name)
    }
}

/// How call-scoped context reaches the method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextStyle {
    None,
    /// A trailing cancellation token
    AmbientCancellation,
    /// A trailing [`CallContext`](crate::CallContext)
    ExplicitCallContext,
}

/// How the method hands back its result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultStyle {
    Synchronous,
    Deferred,
    AsyncSequence,
}

/// What a parameter position carries at call time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Request,
    Cancellation,
    Context,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestPattern {
    Absent,
    Value,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReturnPattern {
    Value,
    Unit,
    Deferred,
    DeferredUnit,
    Sequence,
}

#[derive(Debug, Clone, Copy)]
struct Pattern {
    request: RequestPattern,
    context: ContextStyle,
    returns: ReturnPattern,
    shape: CallShape,
    result: ResultStyle,
}

/// (request layout, return) rows; each is expanded over the three context styles.
const ROWS: &[(RequestPattern, ReturnPattern, CallShape, ResultStyle)] = {
    use CallShape::*;
    use RequestPattern::*;
    use ResultStyle::*;
    &[
        (Value, ReturnPattern::Deferred, Unary, Deferred),
        (Value, ReturnPattern::DeferredUnit, Unary, Deferred),
        (Value, ReturnPattern::Value, Unary, Synchronous),
        (Value, ReturnPattern::Unit, Unary, Synchronous),
        (Value, ReturnPattern::Sequence, ServerStreaming, AsyncSequence),
        (Absent, ReturnPattern::Deferred, Unary, Deferred),
        (Absent, ReturnPattern::DeferredUnit, Unary, Deferred),
        (Absent, ReturnPattern::Value, Unary, Synchronous),
        (Absent, ReturnPattern::Unit, Unary, Synchronous),
        (Absent, ReturnPattern::Sequence, ServerStreaming, AsyncSequence),
        (Stream, ReturnPattern::Deferred, ClientStreaming, Deferred),
        (Stream, ReturnPattern::DeferredUnit, ClientStreaming, Deferred),
        (Stream, ReturnPattern::Sequence, DuplexStreaming, AsyncSequence),
    ]
};

const CONTEXTS: [ContextStyle; 3] = [
    ContextStyle::None,
    ContextStyle::AmbientCancellation,
    ContextStyle::ExplicitCallContext,
];

fn patterns() -> &'static [Pattern] {
    static PATTERNS: OnceLock<Vec<Pattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        ROWS.iter()
            .flat_map(|&(request, returns, shape, result)| {
                CONTEXTS.iter().map(move |&context| Pattern {
                    request,
                    context,
                    returns,
                    shape,
                    result,
                })
            })
            .collect()
    })
}

/// Number of entries in the pattern table
pub fn pattern_count() -> usize {
    patterns().len()
}

/// The result of matching a method against the pattern table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub shape: CallShape,
    pub context: ContextStyle,
    pub result: ResultStyle,
    pub request_type: TypeDescriptor,
    pub response_type: TypeDescriptor,
    pub request_is_void: bool,
    pub response_is_void: bool,
    /// One entry per declared parameter, in order
    pub slots: Vec<Slot>,
    /// Index of the matching pattern-table entry
    pub pattern: usize,
}

impl Pattern {
    fn arity(&self) -> usize {
        let request = usize::from(self.request != RequestPattern::Absent);
        let context = usize::from(self.context != ContextStyle::None);
        request + context
    }

    fn matches(&self, method: &MethodSignature) -> bool {
        let params = method.params();
        if params.len() != self.arity() {
            return false;
        }

        let mut params = params.iter();
        let request_ok = match self.request {
            RequestPattern::Absent => true,
            RequestPattern::Value => matches!(params.next(), Some(ParamKind::Value(_))),
            RequestPattern::Stream => matches!(params.next(), Some(ParamKind::Stream(_))),
        };
        let context_ok = match self.context {
            ContextStyle::None => true,
            ContextStyle::AmbientCancellation => {
                matches!(params.next(), Some(ParamKind::Cancellation))
            }
            ContextStyle::ExplicitCallContext => {
                matches!(params.next(), Some(ParamKind::CallContext))
            }
        };
        let returns_ok = matches!(
            (self.returns, method.return_kind()),
            (ReturnPattern::Value, ReturnKind::Value(_))
                | (ReturnPattern::Unit, ReturnKind::Unit)
                | (ReturnPattern::Deferred, ReturnKind::Deferred(_))
                | (ReturnPattern::DeferredUnit, ReturnKind::DeferredUnit)
                | (ReturnPattern::Sequence, ReturnKind::Sequence(_))
        );

        request_ok && context_ok && returns_ok
    }

    fn classify(&self, index: usize, method: &MethodSignature) -> Classification {
        let mut slots = Vec::with_capacity(self.arity());
        let mut request_type = TypeDescriptor::void();

        if let Some(ParamKind::Value(ty) | ParamKind::Stream(ty)) = method.params().first() {
            if self.request != RequestPattern::Absent {
                request_type = *ty;
                slots.push(Slot::Request);
            }
        }
        match self.context {
            ContextStyle::None => {}
            ContextStyle::AmbientCancellation => slots.push(Slot::Cancellation),
            ContextStyle::ExplicitCallContext => slots.push(Slot::Context),
        }

        let response_type = match method.return_kind() {
            ReturnKind::Value(ty) | ReturnKind::Deferred(ty) | ReturnKind::Sequence(ty) => *ty,
            _ => TypeDescriptor::void(),
        };
        // a sequence of unit items still carries one (empty) message per item
        let response_is_void = self.result != ResultStyle::AsyncSequence && response_type.is_void();
        let request_is_void = !self.shape.streams_requests() && request_type.is_void();

        Classification {
            shape: self.shape,
            context: self.context,
            result: self.result,
            request_type,
            response_type,
            request_is_void,
            response_is_void,
            slots,
            pattern: index,
        }
    }
}

/// Match `method` against the pattern table, in priority order.
///
/// Returns `None` when the method is not an operation. The outcome depends only
/// on the signature.
pub fn classify(method: &MethodSignature) -> Option<Classification> {
    if method.is_generic() || method.params().len() > MAX_PARAMETERS {
        return None;
    }

    patterns()
        .iter()
        .enumerate()
        .find(|(_, pattern)| pattern.matches(method))
        .map(|(index, pattern)| pattern.classify(index, method))
}
