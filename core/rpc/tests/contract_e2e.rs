// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests for `#[contract]` services
//!
//! A contract is bound to an in-process channel with [`ServiceHost`] and called
//! back through a generated [`Proxy`], covering the four call shapes, void
//! payloads, fault translation, call metadata, cancellation and contract
//! inheritance.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing_test::traced_test;

use codefirst_rpc::fault::HANDLER_FAILED;
use codefirst_rpc::{
    BindReport, CallContext, CallShape, CancellationToken, ClientFactory, Code,
    CollectingDiagnostics, Contract, DefaultNaming, InProcessChannel, Marshaller,
    MarshallerRegistry, Proxy, RequestStream, ResponseStream, ServiceContract, ServiceFault,
    ServiceHost, Settings, Status, async_trait, contract,
};

// ============================================================================
// Contracts
// ============================================================================

#[contract(namespace = "demo")]
pub trait Greeter: Send + Sync {
    async fn say_hello(&self, name: String) -> Result<String, Status>;

    async fn greet_all(&self, names: RequestStream<String>) -> Result<String, Status>;

    fn count_to(&self, limit: u32, ctx: CallContext) -> ResponseStream<u32>;

    fn chat(&self, names: RequestStream<String>) -> ResponseStream<String>;

    async fn ping(&self) -> Result<(), Status>;

    fn version(&self) -> Result<String, Status>;

    #[operation(simplified_faults)]
    async fn validate(&self, input: String) -> Result<String, Status>;

    async fn crash(&self, input: String) -> Result<String, Status>;

    async fn annotated(&self, name: String, ctx: CallContext) -> Result<String, Status>;

    async fn wait_for_cancel(&self, token: CancellationToken) -> Result<(), Status>;

    /// Local helper, never exposed
    fn motto(&self) -> String {
        "be kind".to_string()
    }
}

#[contract(namespace = "demo")]
pub trait Named: Send + Sync {
    async fn name(&self) -> Result<String, Status>;
}

#[contract(namespace = "demo")]
pub trait Shouter: Named + Send + Sync {
    async fn shout(&self, text: String) -> Result<String, Status>;
}

// ============================================================================
// Implementations
// ============================================================================

struct Friendly;

#[async_trait]
impl Greeter for Friendly {
    async fn say_hello(&self, name: String) -> Result<String, Status> {
        Ok(format!("Hello {}", name))
    }

    async fn greet_all(&self, names: RequestStream<String>) -> Result<String, Status> {
        let names: Vec<String> = names.try_collect().await?;
        Ok(format!("Hello {}", names.join(", ")))
    }

    fn count_to(&self, limit: u32, ctx: CallContext) -> ResponseStream<u32> {
        if let Some(server) = ctx.server() {
            let _ = server.add_response_header("x-counter", "ready");
        }
        stream::iter((1..=limit).map(Ok)).boxed()
    }

    fn chat(&self, names: RequestStream<String>) -> ResponseStream<String> {
        names
            .map(|name| name.map(|name| format!("Hello {}", name)))
            .boxed()
    }

    async fn ping(&self) -> Result<(), Status> {
        Ok(())
    }

    fn version(&self) -> Result<String, Status> {
        Ok("1.0".to_string())
    }

    async fn validate(&self, input: String) -> Result<String, Status> {
        Err(ServiceFault::InvalidArgument(input).into())
    }

    async fn crash(&self, _input: String) -> Result<String, Status> {
        Err(Status::from_error(std::io::Error::other("disk on fire")))
    }

    async fn annotated(&self, name: String, ctx: CallContext) -> Result<String, Status> {
        let server = ctx
            .server()
            .ok_or_else(|| Status::internal("missing server context"))?;
        server.add_response_header("x-greeting", "formal")?;
        server.set_trailer("x-served-by", "friendly");

        let caller = ctx.headers().get("x-caller").unwrap_or("anonymous");
        Ok(format!("Hello {} from {}", name, caller))
    }

    async fn wait_for_cancel(&self, token: CancellationToken) -> Result<(), Status> {
        token.cancelled().await;
        Err(Status::cancelled("stopped waiting"))
    }
}

struct Loud;

#[async_trait]
impl Named for Loud {
    async fn name(&self) -> Result<String, Status> {
        Ok("loud".to_string())
    }
}

#[async_trait]
impl Shouter for Loud {
    async fn shout(&self, text: String) -> Result<String, Status> {
        Ok(text.to_uppercase())
    }
}

// ============================================================================
// Test Helpers
// ============================================================================

fn settings() -> Settings {
    let marshallers = MarshallerRegistry::new();
    marshallers.register(Marshaller::<u32>::bincode());
    Settings::default().with_marshallers(Arc::new(marshallers))
}

/// Bind `Friendly` and return a client for it
fn greeter() -> (Proxy<dyn Greeter>, BindReport) {
    let channel = Arc::new(InProcessChannel::new());
    let settings = settings();

    let host = ServiceHost::with_settings(channel.clone(), settings.clone());
    let report = host
        .add_service::<dyn Greeter, _>(Arc::new(Friendly))
        .expect("greeter binds");

    let client = ClientFactory::with_settings(settings)
        .create::<dyn Greeter, _>(channel)
        .expect("greeter proxy");
    (client, report)
}

fn names(items: &[&str]) -> RequestStream<String> {
    let items: Vec<Result<String, Status>> = items.iter().map(|s| Ok(s.to_string())).collect();
    stream::iter(items).boxed()
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_generated_descriptor() {
    let diagnostics = CollectingDiagnostics::new();
    let contract = ServiceContract::build(
        &<dyn Greeter as Contract>::descriptor(),
        &DefaultNaming,
        &diagnostics,
    )
    .expect("valid contract");

    assert_eq!(contract.name(), "demo.Greeter");
    assert_eq!(contract.len(), 10);
    assert!(contract.operation("Motto").is_none());

    let shape = |name: &str| contract.operation(name).map(|op| op.call_shape());
    assert_eq!(shape("SayHello"), Some(CallShape::Unary));
    assert_eq!(shape("GreetAll"), Some(CallShape::ClientStreaming));
    assert_eq!(shape("CountTo"), Some(CallShape::ServerStreaming));
    assert_eq!(shape("Chat"), Some(CallShape::DuplexStreaming));

    let ping = contract.operation("Ping").expect("ping");
    assert!(ping.request_is_void());
    assert!(ping.response_is_void());
    assert_eq!(
        contract.operation("Validate").and_then(|op| op.simplified_faults()),
        Some(true)
    );
}

#[tokio::test]
#[traced_test]
async fn test_unary() {
    let (client, report) = greeter();

    assert_eq!(report.service, "demo.Greeter");
    assert_eq!(report.bound.len(), 10);
    assert!(report.skipped.is_empty());
    assert_eq!(client.service(), "demo.Greeter");

    let reply = client.say_hello("John".to_string()).await.unwrap();
    assert_eq!(reply, "Hello John");
}

#[tokio::test]
async fn test_client_streaming() {
    let (client, _) = greeter();

    let reply = client.greet_all(names(&["A", "B", "C"])).await.unwrap();
    assert_eq!(reply, "Hello A, B, C");

    let reply = client.greet_all(names(&[])).await.unwrap();
    assert_eq!(reply, "Hello ");
}

#[tokio::test]
async fn test_server_streaming_with_headers() {
    let (client, _) = greeter();

    let ctx = CallContext::new().capture_metadata();
    let mut responses = client.count_to(3, ctx.clone());

    let first = responses.next().await.expect("first item").unwrap();
    assert_eq!(first, 1);
    // headers are in before the first item is handed out
    let headers = ctx.response_headers().expect("headers captured");
    assert_eq!(headers.get("x-counter"), Some("ready"));

    let rest: Vec<u32> = responses.try_collect().await.unwrap();
    assert_eq!(rest, vec![2, 3]);
    assert!(ctx.status().is_some_and(|status| status.is_ok()));
}

#[tokio::test]
async fn test_duplex() {
    let (client, _) = greeter();

    let replies: Vec<String> = client.chat(names(&["A", "B"])).try_collect().await.unwrap();
    assert_eq!(replies, vec!["Hello A", "Hello B"]);
}

#[tokio::test]
async fn test_failing_request_stream() {
    let (client, _) = greeter();
    let failing = || {
        stream::iter(vec![
            Ok("A".to_string()),
            Err(Status::internal("producer failed")),
        ])
        .boxed()
    };

    let err = client.greet_all(failing()).await.unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert_eq!(err.message(), Some("producer failed"));

    let replies: Vec<Result<String, Status>> = client.chat(failing()).collect().await;
    let last = replies.last().expect("the failure is reported");
    assert_eq!(last.as_ref().unwrap_err().code(), Code::Internal);
}

#[tokio::test]
async fn test_void_request_and_response() {
    let (client, _) = greeter();
    client.ping().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_call() {
    let (client, _) = greeter();

    let version = tokio::task::spawn_blocking(move || client.version())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(version, "1.0");
}

#[tokio::test]
async fn test_fault_translation() {
    let (client, _) = greeter();

    let err = client.validate("".to_string()).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let err = client.crash("now".to_string()).await.unwrap_err();
    assert_eq!(err.code(), Code::Unknown);
    assert_eq!(err.message(), Some(HANDLER_FAILED));
}

#[tokio::test]
async fn test_call_metadata() {
    let (client, _) = greeter();

    let ctx = CallContext::new()
        .with_header("x-caller", "tests")
        .capture_metadata();
    let reply = client
        .annotated("John".to_string(), ctx.clone())
        .await
        .unwrap();
    assert_eq!(reply, "Hello John from tests");

    let headers = ctx.response_headers().expect("headers captured");
    assert_eq!(headers.get("x-greeting"), Some("formal"));
    let trailers = ctx.trailers().expect("trailers captured");
    assert_eq!(trailers.get("x-served-by"), Some("friendly"));
}

#[tokio::test]
async fn test_cancellation() {
    let (client, _) = greeter();

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });
    let err = client.wait_for_cancel(token).await.unwrap_err();
    assert_eq!(err.code(), Code::Cancelled);

    // already cancelled: the call never starts
    let token = CancellationToken::new();
    token.cancel();
    let err = client.wait_for_cancel(token).await.unwrap_err();
    assert_eq!(err.code(), Code::Cancelled);
}

#[tokio::test]
async fn test_inherited_operations() {
    let channel = Arc::new(InProcessChannel::new());
    let host = ServiceHost::new(channel.clone());
    let report = host.add_service::<dyn Shouter, _>(Arc::new(Loud)).unwrap();

    assert_eq!(report.service, "demo.Shouter");
    assert!(report.bound.contains(&"Shout".to_string()));
    assert!(report.bound.contains(&"Name".to_string()));
    assert!(channel.methods().contains(&"/demo.Shouter/Name".to_string()));

    let client = ClientFactory::new()
        .create::<dyn Shouter, _>(channel)
        .unwrap();
    assert_eq!(client.shout("hey".to_string()).await.unwrap(), "HEY");
    assert_eq!(client.name().await.unwrap(), "loud");
}
