// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Attribute parsing for `#[contract]` and `#[operation]`

use proc_macro2::TokenStream;
use syn::meta::ParseNestedMeta;
use syn::parse::Parser;
use syn::{Attribute, LitBool, LitStr, Meta, Result, Token};

pub const OPERATION: &str = "operation";

/// Arguments of `#[contract(...)]`
#[derive(Debug, Default)]
pub struct ContractAttrs {
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub simplified_faults: Option<bool>,
    pub inheritable: Option<bool>,
}

impl ContractAttrs {
    pub fn parse(attr: TokenStream) -> Result<Self> {
        let mut attrs = ContractAttrs::default();
        let parser = syn::meta::parser(|meta| {
            if meta.path.is_ident("name") {
                attrs.name = Some(string_value(&meta)?);
            } else if meta.path.is_ident("namespace") {
                attrs.namespace = Some(string_value(&meta)?);
            } else if meta.path.is_ident("simplified_faults") {
                attrs.simplified_faults = Some(flag_value(&meta)?);
            } else if meta.path.is_ident("inheritable") {
                attrs.inheritable = Some(flag_value(&meta)?);
            } else {
                return Err(meta.error(
                    "unknown contract attribute; expected `name`, `namespace`, \
                     `simplified_faults` or `inheritable`",
                ));
            }
            Ok(())
        });
        parser.parse2(attr)?;
        Ok(attrs)
    }
}

/// Arguments of `#[operation(...)]` on one method
#[derive(Debug, Default)]
pub struct OperationAttrs {
    /// The method carries `#[operation]` at all
    pub marked: bool,
    pub name: Option<String>,
    pub simplified_faults: Option<bool>,
}

impl OperationAttrs {
    /// Parse and remove every `#[operation]` attribute
    pub fn take(attrs: &mut Vec<Attribute>) -> Result<Self> {
        let mut parsed = OperationAttrs::default();
        let mut kept = Vec::with_capacity(attrs.len());

        for attr in attrs.drain(..) {
            if !attr.path().is_ident(OPERATION) {
                kept.push(attr);
                continue;
            }

            parsed.marked = true;
            if matches!(attr.meta, Meta::Path(_)) {
                continue;
            }
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("name") {
                    parsed.name = Some(string_value(&meta)?);
                } else if meta.path.is_ident("simplified_faults") {
                    parsed.simplified_faults = Some(flag_value(&meta)?);
                } else {
                    return Err(meta.error(
                        "unknown operation attribute; expected `name` or `simplified_faults`",
                    ));
                }
                Ok(())
            })?;
        }

        *attrs = kept;
        Ok(parsed)
    }
}

fn string_value(meta: &ParseNestedMeta) -> Result<String> {
    Ok(meta.value()?.parse::<LitStr>()?.value())
}

/// `flag` alone means true; `flag = false` is also accepted
fn flag_value(meta: &ParseNestedMeta) -> Result<bool> {
    if meta.input.peek(Token![=]) {
        Ok(meta.value()?.parse::<LitBool>()?.value)
    } else {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quote::quote;
    use syn::parse_quote;

    #[test]
    fn test_contract_attrs() {
        let attrs = ContractAttrs::parse(quote!(
            name = "greet.Greeter",
            simplified_faults,
            inheritable = false
        ))
        .unwrap();
        assert_eq!(attrs.name.as_deref(), Some("greet.Greeter"));
        assert_eq!(attrs.simplified_faults, Some(true));
        assert_eq!(attrs.inheritable, Some(false));
        assert!(attrs.namespace.is_none());

        assert!(ContractAttrs::parse(quote!(version = "1")).is_err());
    }

    #[test]
    fn test_operation_attrs_are_removed() {
        let mut attrs: Vec<Attribute> = vec![
            parse_quote!(#[doc = "Says hello"]),
            parse_quote!(#[operation(name = "Hello", simplified_faults = false)]),
        ];
        let parsed = OperationAttrs::take(&mut attrs).unwrap();
        assert!(parsed.marked);
        assert_eq!(parsed.name.as_deref(), Some("Hello"));
        assert_eq!(parsed.simplified_faults, Some(false));
        assert_eq!(attrs.len(), 1);

        let mut bare: Vec<Attribute> = vec![parse_quote!(#[operation])];
        let parsed = OperationAttrs::take(&mut bare).unwrap();
        assert!(parsed.marked);
        assert!(parsed.name.is_none());
        assert!(bare.is_empty());
    }
}
