// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Wire-level names for services and operations
//!
//! Resolution is two-tier: an explicit per-method name wins, then a contract-level
//! rename, then the computed default.

use crate::descriptor::{ContractDescriptor, MethodSignature};

/// Decides wire names
pub trait NamingPolicy: Send + Sync {
    /// Wire name of the service exposed by `contract`
    fn service_name(&self, contract: &ContractDescriptor) -> String;

    /// Wire name of `method`, declared by `declaring`
    fn operation_name(&self, declaring: &ContractDescriptor, method: &MethodSignature) -> String;
}

/// Strips conventional suffixes and prefixes
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultNaming;

impl NamingPolicy for DefaultNaming {
    fn service_name(&self, contract: &ContractDescriptor) -> String {
        if let Some(name) = contract.explicit_name() {
            return name.to_string();
        }

        let base = strip_interface_prefix(contract.type_name());
        let namespace = contract.namespace().replace("::", ".");
        if namespace.is_empty() {
            base.to_string()
        } else {
            format!("{}.{}", namespace, base)
        }
    }

    fn operation_name(&self, declaring: &ContractDescriptor, method: &MethodSignature) -> String {
        if let Some(name) = &method.attributes().name {
            return name.clone();
        }
        if let Some(name) = declaring.renamed(method.name()) {
            return name.to_string();
        }
        default_operation_name(method.name())
    }
}

/// `say_hello_async` and `SayHelloAsync` both become `SayHello`
pub fn default_operation_name(method: &str) -> String {
    let stripped = strip_async_suffix(method);
    if stripped.contains('_') || stripped.starts_with(|c: char| c.is_ascii_lowercase()) {
        pascal_case(stripped)
    } else {
        stripped.to_string()
    }
}

fn strip_async_suffix(name: &str) -> &str {
    for suffix in ["_async", "Async"] {
        if let Some(stripped) = name.strip_suffix(suffix) {
            if !stripped.is_empty() {
                return stripped;
            }
        }
    }
    name
}

/// `IGreeter` becomes `Greeter`; `Inventory` is left alone
fn strip_interface_prefix(name: &str) -> &str {
    let mut chars = name.chars();
    match (chars.next(), chars.next()) {
        (Some('I'), Some(second)) if second.is_ascii_uppercase() => &name[1..],
        _ => name,
    }
}

fn pascal_case(name: &str) -> String {
    name.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}
