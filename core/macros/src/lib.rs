// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! The `#[contract]` attribute for codefirst-rpc service traits.
//!
//! Applied to a trait, it keeps the trait (made async-capable through
//! `async_trait`) and adds:
//!
//! 1. `impl Contract for dyn Trait`, describing every method
//! 2. `impl Dispatch<dyn Trait> for Service<S>`, the server method table of any
//!    implementation `S`
//! 3. `impl Trait for Proxy<C>`, the client
//!
//! ```ignore
//! #[contract(name = "greet.Greeter")]
//! pub trait Greeter: Send + Sync {
//!     async fn say_hello(&self, name: String, ctx: CallContext) -> Result<String, Status>;
//!
//!     #[operation(name = "Countdown")]
//!     fn count(&self, from: u32) -> ResponseStream<u32>;
//! }
//! ```
//!
//! An operation takes at most one request (a plain value or `RequestStream<T>`)
//! followed by at most one `CallContext` or `CancellationToken`. Recognised
//! returns are `Result<T, Status>`, `ResponseStream<T>` and
//! `Result<ResponseStream<T>, Status>`, from sync or async methods, except that a
//! `RequestStream<T>` request needs an async method or a response stream. Any
//! other method needs a default body; it is described but never bound.

mod attrs;
mod expand;
mod signature;

use proc_macro::TokenStream;

/// Turn a trait into an RPC service contract.
///
/// # Attributes
///
/// - `name = "..."`: wire-level service name
/// - `namespace = "..."`: namespace used for the default service name, instead of
///   the module path
/// - `simplified_faults`: map unstructured failures to well-known codes
/// - `inheritable = false`: contracts extending this one do not expose its
///   operations
///
/// Methods accept `#[operation]`, optionally with `name = "..."` and
/// `simplified_faults`. A marked method must be a valid operation.
#[proc_macro_attribute]
pub fn contract(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand::expand_contract(attr.into(), item.into())
        .unwrap_or_else(|e| e.to_compile_error())
        .into()
}
