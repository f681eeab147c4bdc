// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Operation tables
//!
//! [`ServiceContract::build`] walks a contract and everything it inherits, classifies
//! every method and names the survivors. Classification results are cached for the
//! lifetime of the process, keyed by contract and method signature.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::classifier::{self, CallShape, Classification, ContextStyle, ResultStyle, Slot};
use crate::descriptor::{ContractDescriptor, ContractId, MethodSignature, TypeDescriptor};
use crate::diagnostics::DiagnosticSink;
use crate::error::ContractError;
use crate::naming::NamingPolicy;

type ClassificationCache =
    RwLock<HashMap<(ContractId, MethodSignature), Option<Arc<Classification>>>>;

fn classification_cache() -> &'static ClassificationCache {
    static CACHE: OnceLock<ClassificationCache> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Classify `method` of `contract`, computing at most once per process.
pub fn classify_cached(
    contract: ContractId,
    method: &MethodSignature,
) -> Option<Arc<Classification>> {
    let key = (contract, method.clone());
    if let Some(found) = classification_cache().read().get(&key) {
        return found.clone();
    }

    let computed = classifier::classify(method).map(Arc::new);
    match classification_cache().write().entry(key) {
        // someone else won the race; keep theirs
        Entry::Occupied(existing) => existing.get().clone(),
        Entry::Vacant(slot) => slot.insert(computed).clone(),
    }
}

/// A classified, named method ready for binding
#[derive(Debug, Clone)]
pub struct Operation {
    name: String,
    contract: ContractId,
    method: Arc<MethodSignature>,
    classification: Arc<Classification>,
    simplified_faults: Option<bool>,
}

impl Operation {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The contract that declares the method
    pub fn contract(&self) -> ContractId {
        self.contract
    }

    pub fn method(&self) -> &MethodSignature {
        &self.method
    }

    pub fn request_type(&self) -> TypeDescriptor {
        self.classification.request_type
    }

    pub fn response_type(&self) -> TypeDescriptor {
        self.classification.response_type
    }

    pub fn call_shape(&self) -> CallShape {
        self.classification.shape
    }

    pub fn context_style(&self) -> ContextStyle {
        self.classification.context
    }

    pub fn result_style(&self) -> ResultStyle {
        self.classification.result
    }

    pub fn request_is_void(&self) -> bool {
        self.classification.request_is_void
    }

    pub fn response_is_void(&self) -> bool {
        self.classification.response_is_void
    }

    pub fn slots(&self) -> &[Slot] {
        &self.classification.slots
    }

    /// Per-method setting, else the declaring contract's
    pub fn simplified_faults(&self) -> Option<bool> {
        self.simplified_faults
    }

    /// Everything that makes two operations interchangeable on the wire
    pub fn same_binding(&self, other: &Operation) -> bool {
        self.name == other.name
            && self.call_shape() == other.call_shape()
            && self.context_style() == other.context_style()
            && self.result_style() == other.result_style()
            && self.request_is_void() == other.request_is_void()
            && self.response_is_void() == other.response_is_void()
    }
}

/// The operations one contract exposes
#[derive(Debug, Clone)]
pub struct ServiceContract {
    id: ContractId,
    name: String,
    operations: Vec<Operation>,
    by_name: HashMap<String, usize>,
}

impl ServiceContract {
    /// Build the operation table for `descriptor` and every inheritable contract it
    /// extends. Methods that match no call shape are skipped unless they were
    /// explicitly marked as operations.
    pub fn build(
        descriptor: &ContractDescriptor,
        naming: &dyn NamingPolicy,
        diagnostics: &dyn DiagnosticSink,
    ) -> Result<Self, ContractError> {
        let name = naming.service_name(descriptor);
        let mut operations = Vec::new();
        let mut by_name = HashMap::new();
        let mut strict_failure = None;

        for interface in descriptor.interfaces() {
            for method in interface.methods() {
                let Some(classification) = classify_cached(interface.id(), method) else {
                    if method.attributes().strict {
                        let message = format!(
                            "{}::{} is marked as an operation but matches no call shape",
                            interface.type_name(),
                            method.name()
                        );
                        diagnostics.error(&message);
                        strict_failure.get_or_insert(ContractError::NotAnOperation {
                            contract: interface.type_name().to_string(),
                            method: method.name().to_string(),
                        });
                    } else {
                        tracing::debug!(
                            contract = %interface.type_name(),
                            method = %method.name(),
                            "skipping method, not an operation"
                        );
                    }
                    continue;
                };

                let op_name = naming.operation_name(interface, method);
                if by_name.contains_key(&op_name) {
                    return Err(ContractError::DuplicateOperation {
                        service: name,
                        name: op_name,
                    });
                }

                tracing::debug!(
                    service = %name,
                    operation = %op_name,
                    shape = %classification.shape,
                    "operation discovered"
                );

                by_name.insert(op_name.clone(), operations.len());
                operations.push(Operation {
                    name: op_name,
                    contract: interface.id(),
                    method: Arc::new(method.clone()),
                    classification,
                    simplified_faults: method
                        .attributes()
                        .simplified_faults
                        .or(interface.simplified_faults_flag()),
                });
            }
        }

        if let Some(err) = strict_failure {
            return Err(err);
        }

        Ok(Self {
            id: descriptor.id(),
            name,
            operations,
            by_name,
        })
    }

    pub fn id(&self) -> ContractId {
        self.id
    }

    /// Wire-level service name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn operation(&self, name: &str) -> Option<&Operation> {
        self.by_name.get(name).map(|&i| &self.operations[i])
    }

    /// Find the operation for a method declared by `contract`
    pub fn find(&self, contract: ContractId, method: &str) -> Option<&Operation> {
        self.operations
            .iter()
            .find(|op| op.contract == contract && op.method.name() == method)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
