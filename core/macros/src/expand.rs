// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Expansion of `#[contract]`

use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::ext::IdentExt;
use syn::{
    Attribute, Error, FnArg, Ident, ItemTrait, Path, Result, Signature, TraitBoundModifier,
    TraitItem, TraitItemFn, TypeParamBound, parse_quote, parse2,
};

use crate::attrs::{ContractAttrs, OperationAttrs};
use crate::signature::{MethodShape, Param, Receiver, Returns};

/// Supertraits that are bounds, not inherited contracts
const AUTO_TRAITS: &[&str] = &["Send", "Sync", "Sized", "Unpin"];

struct Method {
    ident: Ident,
    sig: Signature,
    attrs: OperationAttrs,
    shape: MethodShape,
}

impl Method {
    fn wire_method(&self) -> String {
        self.ident.unraw().to_string()
    }

    fn arg_names(&self) -> Vec<Ident> {
        (0..self.shape.params.len())
            .map(|i| format_ident!("__arg{}", i))
            .collect()
    }
}

pub fn expand_contract(attr: TokenStream, item: TokenStream) -> Result<TokenStream> {
    let attrs = ContractAttrs::parse(attr)?;
    let mut item: ItemTrait = parse2(item)?;

    if !item.generics.params.is_empty() {
        return Err(Error::new_spanned(
            &item.generics,
            "contract traits cannot have generic parameters",
        ));
    }

    let mut methods = Vec::new();
    let mut errors: Option<Error> = None;
    for trait_item in &mut item.items {
        let TraitItem::Fn(method) = trait_item else {
            push_error(
                &mut errors,
                Error::new_spanned(&*trait_item, "contract traits may only declare methods"),
            );
            continue;
        };
        match read_method(method) {
            Ok(method) => methods.push(method),
            Err(e) => push_error(&mut errors, e),
        }
    }
    if let Some(errors) = errors {
        return Err(errors);
    }

    if !item.attrs.iter().any(is_async_trait) {
        item.attrs.push(parse_quote!(#[::codefirst_rpc::async_trait]));
    }

    let parents = parents(&item);
    let descriptor = descriptor_impl(&item.ident, &attrs, &parents, &methods);
    let dispatch = dispatch_impl(&item.ident, &parents, &methods);
    let proxy = proxy_impl(&item.ident, &parents, &methods);

    Ok(quote! {
        #item

        #descriptor

        #dispatch

        #proxy
    })
}

fn push_error(errors: &mut Option<Error>, error: Error) {
    match errors {
        Some(existing) => existing.combine(error),
        None => *errors = Some(error),
    }
}

fn is_async_trait(attr: &Attribute) -> bool {
    attr.path()
        .segments
        .last()
        .is_some_and(|segment| segment.ident == "async_trait")
}

fn read_method(method: &mut TraitItemFn) -> Result<Method> {
    let attrs = OperationAttrs::take(&mut method.attrs)?;
    let shape = MethodShape::read(&method.sig);

    if shape.receiver == Receiver::Other {
        return Err(Error::new_spanned(
            &method.sig,
            "contract methods must take `&self`",
        ));
    }

    if shape.is_generic {
        method
            .sig
            .generics
            .make_where_clause()
            .predicates
            .push(parse_quote!(Self: Sized));
    }

    if !shape.is_bindable() && method.default.is_none() {
        return Err(Error::new_spanned(
            &method.sig,
            format!(
                "`{}` cannot be an operation ({}); give it a default body",
                method.sig.ident,
                unsupported_reason(&shape)
            ),
        ));
    }

    Ok(Method {
        ident: method.sig.ident.clone(),
        sig: method.sig.clone(),
        attrs,
        shape,
    })
}

fn unsupported_reason(shape: &MethodShape) -> String {
    if shape.is_generic {
        return "generic methods are not supported".to_string();
    }
    for (param, _) in &shape.params {
        if let Param::Unsupported(ty) = param {
            return format!("unsupported parameter type `{}`", ty);
        }
    }
    if !shape.has_operation_params() {
        return "expected at most one request parameter followed by at most one \
                `CallContext` or `CancellationToken`"
            .to_string();
    }
    if !shape.has_operation_return() {
        return "a `RequestStream` parameter needs an `async fn` or a `ResponseStream` result"
            .to_string();
    }
    match &shape.returns {
        Returns::Unsupported(ty) => format!(
            "unsupported return type `{}`; expected `Result<T, Status>` or `ResponseStream<T>`",
            ty
        ),
        _ => "unsupported signature".to_string(),
    }
}

fn parents(item: &ItemTrait) -> Vec<Path> {
    item.supertraits
        .iter()
        .filter_map(|bound| match bound {
            TypeParamBound::Trait(bound) if matches!(bound.modifier, TraitBoundModifier::None) => {
                Some(&bound.path)
            }
            _ => None,
        })
        .filter(|path| {
            !path
                .segments
                .last()
                .is_some_and(|segment| AUTO_TRAITS.iter().any(|name| segment.ident == *name))
        })
        .cloned()
        .collect()
}

fn describe(ty: &syn::Type) -> TokenStream {
    quote!((&&::codefirst_rpc::__private::Probe::<#ty>::new()).describe())
}

fn method_signature(method: &Method) -> TokenStream {
    let name = method.wire_method();
    let shape = &method.shape;

    let mut tokens = quote!(::codefirst_rpc::MethodSignature::new(#name));

    if shape.is_generic {
        tokens.extend(quote!(.generic()));
    } else {
        for (param, _) in &shape.params {
            let kind = match param {
                Param::Value(ty) => {
                    let ty = describe(ty);
                    quote!(::codefirst_rpc::ParamKind::Value(#ty))
                }
                Param::Stream(ty) => {
                    let ty = describe(ty);
                    quote!(::codefirst_rpc::ParamKind::Stream(#ty))
                }
                Param::Context => quote!(::codefirst_rpc::ParamKind::CallContext),
                Param::Cancellation => quote!(::codefirst_rpc::ParamKind::Cancellation),
                Param::Unsupported(ty) => quote!(::codefirst_rpc::ParamKind::Unsupported(#ty)),
            };
            tokens.extend(quote!(.param(#kind)));
        }

        let returns = match (&shape.returns, shape.is_async) {
            (Returns::Value(ty), false) => {
                let ty = describe(ty);
                quote!(::codefirst_rpc::ReturnKind::Value(#ty))
            }
            (Returns::Value(ty), true) => {
                let ty = describe(ty);
                quote!(::codefirst_rpc::ReturnKind::Deferred(#ty))
            }
            (Returns::Unit, false) => quote!(::codefirst_rpc::ReturnKind::Unit),
            (Returns::Unit, true) => quote!(::codefirst_rpc::ReturnKind::DeferredUnit),
            (Returns::Sequence { item, .. }, _) => {
                let item = describe(item);
                quote!(::codefirst_rpc::ReturnKind::Sequence(#item))
            }
            (Returns::Unsupported(ty), _) => quote!(::codefirst_rpc::ReturnKind::Unsupported(#ty)),
        };
        tokens.extend(quote!(.returns(#returns)));
    }

    if let Some(name) = &method.attrs.name {
        tokens.extend(quote!(.named(#name)));
    } else if method.attrs.marked {
        tokens.extend(quote!(.strict()));
    }
    if let Some(enabled) = method.attrs.simplified_faults {
        tokens.extend(quote!(.simplified_faults(#enabled)));
    }

    tokens
}

fn descriptor_impl(
    ident: &Ident,
    attrs: &ContractAttrs,
    parents: &[Path],
    methods: &[Method],
) -> TokenStream {
    let type_name = ident.unraw().to_string();
    let namespace = match &attrs.namespace {
        Some(namespace) => quote!(#namespace),
        None => quote!(::core::module_path!()),
    };

    let mut options = TokenStream::new();
    if let Some(name) = &attrs.name {
        options.extend(quote!(.named(#name)));
    }
    if let Some(enabled) = attrs.simplified_faults {
        options.extend(quote!(.simplified_faults(#enabled)));
    }
    if let Some(inheritable) = attrs.inheritable {
        options.extend(quote!(.inheritable(#inheritable)));
    }

    let signatures = methods.iter().map(method_signature);

    quote! {
        impl ::codefirst_rpc::Contract for dyn #ident {
            fn descriptor() -> ::codefirst_rpc::ContractDescriptor {
                #[allow(unused_imports)]
                use ::codefirst_rpc::__private::{DescribeMessage as _, DescribeOpaque as _};

                ::codefirst_rpc::ContractDescriptor::new::<dyn #ident>(#type_name, #namespace)
                    #options
                    #(.extends(<dyn #parents as ::codefirst_rpc::Contract>::descriptor()))*
                    #(.method(#signatures))*
            }
        }
    }
}

fn take_argument(param: &Param, name: &Ident) -> TokenStream {
    let take = match param {
        Param::Value(ty) => quote!(__args.take_value::<#ty>()),
        Param::Stream(ty) => quote!(__args.take_stream::<#ty>()),
        Param::Context => quote!(__args.take_context()),
        Param::Cancellation => quote!(__args.take_cancellation()),
        // not bindable; never reached
        Param::Unsupported(_) => quote!(::core::unreachable!()),
    };
    quote! {
        let #name = match #take {
            ::core::result::Result::Ok(value) => value,
            ::core::result::Result::Err(status) => {
                return ::codefirst_rpc::__private::Outcome::failed(status);
            }
        };
    }
}

fn invoker(ident: &Ident, method: &Method) -> TokenStream {
    let name = method.wire_method();
    let method_ident = &method.ident;
    let args = method.arg_names();
    let takes = method
        .shape
        .params
        .iter()
        .zip(&args)
        .map(|((param, _), name)| take_argument(param, name));
    let args_pattern = if args.is_empty() {
        quote!(_)
    } else {
        quote!(mut __args)
    };

    let outcome = quote!(::codefirst_rpc::__private::Outcome);
    let stream = quote!(::codefirst_rpc::__private::stream);
    let stream_ext = quote!(::codefirst_rpc::__private::StreamExt);

    let body = match (&method.shape.returns, method.shape.is_async) {
        (Returns::Value(_) | Returns::Unit, false) => quote! {
            #outcome::ready(<S as #ident>::#method_ident(&**service, #(#args),*))
        },
        (Returns::Value(_) | Returns::Unit, true) => quote! {
            let service = ::std::sync::Arc::clone(service);
            #outcome::deferred(async move {
                <S as #ident>::#method_ident(&*service, #(#args),*).await
            })
        },
        (Returns::Sequence { fallible: false, .. }, false) => quote! {
            #outcome::sequence(<S as #ident>::#method_ident(&**service, #(#args),*))
        },
        (Returns::Sequence { fallible: true, .. }, false) => quote! {
            match <S as #ident>::#method_ident(&**service, #(#args),*) {
                ::core::result::Result::Ok(items) => #outcome::sequence(items),
                ::core::result::Result::Err(status) => #outcome::failed(status),
            }
        },
        (Returns::Sequence { fallible: false, .. }, true) => quote! {
            let service = ::std::sync::Arc::clone(service);
            #outcome::sequence(#stream_ext::flatten(#stream::once(async move {
                <S as #ident>::#method_ident(&*service, #(#args),*).await
            })))
        },
        (Returns::Sequence { fallible: true, .. }, true) => quote! {
            let service = ::std::sync::Arc::clone(service);
            #outcome::sequence(#stream_ext::flatten(#stream::once(async move {
                match <S as #ident>::#method_ident(&*service, #(#args),*).await {
                    ::core::result::Result::Ok(items) => items,
                    ::core::result::Result::Err(status) => #stream_ext::boxed(#stream::once(
                        async move { ::core::result::Result::Err(status) },
                    )),
                }
            })))
        },
        // not bindable; never reached
        (Returns::Unsupported(_), _) => quote!(::core::unreachable!()),
    };

    quote! {
        ::codefirst_rpc::__private::MethodInvoker::<S>::new::<dyn #ident>(
            #name,
            |service: &::std::sync::Arc<S>,
             #args_pattern: ::codefirst_rpc::__private::CallArgs|
             -> ::codefirst_rpc::__private::Outcome {
                #(#takes)*
                #body
            },
        )
    }
}

fn dispatch_impl(ident: &Ident, parents: &[Path], methods: &[Method]) -> TokenStream {
    let invokers = methods
        .iter()
        .filter(|method| method.shape.is_bindable())
        .map(|method| invoker(ident, method));

    quote! {
        impl<S: ?Sized> ::codefirst_rpc::__private::Dispatch<dyn #ident>
            for ::codefirst_rpc::__private::Service<S>
        where
            S: #ident + ::core::marker::Send + ::core::marker::Sync + 'static,
        {
            type Implementation = S;

            fn invokers() -> ::std::vec::Vec<::codefirst_rpc::__private::MethodInvoker<S>> {
                #[allow(unused_mut)]
                let mut invokers: ::std::vec::Vec<::codefirst_rpc::__private::MethodInvoker<S>> =
                    ::std::vec![#(#invokers),*];
                #(
                    invokers.extend(
                        <::codefirst_rpc::__private::Service<S>
                            as ::codefirst_rpc::__private::Dispatch<dyn #parents>>::invokers(),
                    );
                )*
                invokers
            }
        }
    }
}

fn proxy_method(ident: &Ident, method: &Method) -> TokenStream {
    let name = method.wire_method();
    let args = method.arg_names();

    let mut sig = method.sig.clone();
    let typed = sig.inputs.iter_mut().filter_map(|input| match input {
        FnArg::Typed(typed) => Some(typed),
        FnArg::Receiver(_) => None,
    });
    for (typed, arg) in typed.zip(&args) {
        typed.pat = Box::new(parse_quote!(#arg));
    }

    let packed = method
        .shape
        .params
        .iter()
        .zip(&args)
        .map(|((param, _), arg)| match param {
            Param::Stream(_) => quote!(::codefirst_rpc::__private::Arg::stream(#arg)),
            Param::Context => quote!(::codefirst_rpc::__private::Arg::context(#arg)),
            Param::Cancellation => quote!(::codefirst_rpc::__private::Arg::cancellation(#arg)),
            Param::Value(_) | Param::Unsupported(_) => {
                quote!(::codefirst_rpc::__private::Arg::value(#arg))
            }
        });

    let call = quote! {
        ::codefirst_rpc::Proxy::invoke(
            self,
            ::codefirst_rpc::ContractId::of::<dyn #ident>(),
            #name,
            ::codefirst_rpc::__private::CallArgs::new(::std::vec![#(#packed),*]),
        )
    };

    let body = match (&method.shape.returns, method.shape.is_async) {
        (Returns::Value(ty), true) => quote!(#call.into_value::<#ty>().await),
        (Returns::Value(ty), false) => quote!(#call.into_result::<#ty>()),
        (Returns::Unit, true) => quote!(#call.into_value::<()>().await),
        (Returns::Unit, false) => quote!(#call.into_result::<()>()),
        (Returns::Sequence { item, fallible: false }, _) => quote!(#call.into_stream::<#item>()),
        (Returns::Sequence { item, fallible: true }, _) => {
            quote!(::core::result::Result::Ok(#call.into_stream::<#item>()))
        }
        (Returns::Unsupported(_), _) => quote!(::core::unreachable!()),
    };

    quote! {
        #sig {
            #body
        }
    }
}

fn proxy_impl(ident: &Ident, parents: &[Path], methods: &[Method]) -> TokenStream {
    let methods = methods
        .iter()
        .filter(|method| method.shape.is_bindable())
        .map(|method| proxy_method(ident, method));
    let inherits = quote!(::codefirst_rpc::__private::Inherits);

    quote! {
        impl #inherits<dyn #ident> for dyn #ident {}

        #(impl #inherits<dyn #parents> for dyn #ident {})*

        #[::codefirst_rpc::async_trait]
        impl<C: ?Sized> #ident for ::codefirst_rpc::Proxy<C>
        where
            C: 'static + #inherits<dyn #ident> #(+ #inherits<dyn #parents>)*,
        {
            #(#methods)*
        }
    }
}
