//! Local routing integration tests
//!
//! Requests travel broker -> router -> registry -> invocation handle and
//! back as encrypted reply envelopes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use hearth_hub::broker::{BROADCAST_TOPIC, Broker, module_topic};
use hearth_hub::envelope::{Envelope, Request, Response};
use hearth_hub::invoke::{Invoker, LocalHandle};
use hearth_hub::modules::garage_doors::{DigitalPin, Level};
use hearth_hub::router::Dispatch;
use hearth_hub::{Error, InvocationError};

mod common;
use common::{TestHub, garage_doors, trigger};

/// Handle that answers with its own label and records closing
#[derive(Debug)]
struct Labelled {
    label: &'static str,
    calls: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl Labelled {
    fn new(label: &'static str) -> (Box<Self>, Arc<AtomicUsize>, Arc<AtomicBool>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        let handle = Box::new(Self {
            label,
            calls: Arc::clone(&calls),
            closed: Arc::clone(&closed),
        });
        (handle, calls, closed)
    }
}

#[async_trait]
impl Invoker for Labelled {
    fn kind(&self) -> &'static str {
        "test"
    }

    async fn invoke(&self, request: Request) -> Result<Response, InvocationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Response::ok(request.module).with("label", self.label))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn garage_door_scenario_triggers_then_cancels() {
    let hub = TestHub::new();
    let (module, pins) = garage_doors("garage-doors", &["main"]);
    hub.registry
        .register("garage-doors", Box::new(LocalHandle::spawn(module)))
        .await
        .unwrap();

    let first = hub.call(&trigger("garage-doors", "main", false)).await;
    assert!(first.success);
    assert_eq!(first.data["door"], "main");
    assert_eq!(first.data["force"], false);
    assert_eq!(first.data["action"], "triggered");
    assert_eq!(pins["main"].level().unwrap(), Level::Low);

    let second = hub.call(&trigger("garage-doors", "main", false)).await;
    assert!(second.success);
    assert_eq!(second.data["action"], "cancelled");
    assert_eq!(pins["main"].level().unwrap(), Level::High);
}

#[tokio::test]
async fn double_registration_leaves_one_subscription() {
    let hub = TestHub::new();
    let (old, old_calls, old_closed) = Labelled::new("old");
    let (new, new_calls, new_closed) = Labelled::new("new");

    hub.registry.register("lights", old).await.unwrap();
    hub.registry.register("lights", new).await.unwrap();

    assert_eq!(hub.broker.subscriber_count(&module_topic("lights")), 1);
    assert_eq!(hub.registry.names(), vec!["lights".to_string()]);
    assert!(old_closed.load(Ordering::SeqCst));
    assert!(!new_closed.load(Ordering::SeqCst));

    let request = Request::new("lights", "on", json!({})).unwrap();
    let response = hub.call(&request).await;
    assert_eq!(response.data["label"], "new");
    assert_eq!(old_calls.load(Ordering::SeqCst), 0);
    assert_eq!(new_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unregister_is_idempotent_and_closes_once() {
    let hub = TestHub::new();
    let (handle, _, closed) = Labelled::new("only");
    hub.registry.register("lights", handle).await.unwrap();

    hub.registry.unregister("lights").await;
    hub.registry.unregister("lights").await;
    hub.registry.unregister("never-registered").await;

    assert!(closed.load(Ordering::SeqCst));
    assert!(hub.registry.is_empty());
    assert_eq!(hub.broker.subscriber_count(&module_topic("lights")), 0);
}

#[tokio::test]
async fn unknown_module_gets_a_failure_with_message() {
    let hub = TestHub::new();

    let response = tokio::time::timeout(
        Duration::from_millis(100),
        hub.registry
            .dispatch("sprinklers", Request::new("sprinklers", "on", json!({})).unwrap()),
    )
    .await
    .expect("dispatch to an unknown module must not block");

    assert!(!response.success);
    assert!(!response.message().unwrap_or_default().is_empty());
}

#[tokio::test]
async fn unknown_method_flows_back_as_failure() {
    let hub = TestHub::new();
    let (module, _) = garage_doors("garage-doors", &["main"]);
    hub.registry
        .register("garage-doors", Box::new(LocalHandle::spawn(module)))
        .await
        .unwrap();

    let request = Request::new("garage-doors", "open-all", json!({})).unwrap();
    let response = hub.call(&request).await;
    assert!(!response.success);
    assert_eq!(response.message(), Some("Method not found."));
}

#[tokio::test]
async fn undecryptable_request_gets_no_reply_and_router_survives() {
    let hub = TestHub::new();
    let (module, _) = garage_doors("garage-doors", &["main"]);
    hub.registry
        .register("garage-doors", Box::new(LocalHandle::spawn(module)))
        .await
        .unwrap();

    let mut garbage = hub.seal(&trigger("garage-doors", "main", false));
    garbage.contents = "bm90IGNpcGhlcnRleHQ=".to_string();
    let err = hub
        .broker
        .request(&module_topic("garage-doors"), garbage, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));

    let docs = Request::new("garage-doors", "docs", json!({})).unwrap();
    let response = hub.call(&docs).await;
    assert!(response.success);
    assert!(response.data.contains_key("documentation"));
}

#[tokio::test]
async fn broadcast_responses_reach_the_broadcast_topic() {
    #[derive(Debug)]
    struct Announcer;

    #[async_trait]
    impl Invoker for Announcer {
        fn kind(&self) -> &'static str {
            "test"
        }

        async fn invoke(&self, request: Request) -> Result<Response, InvocationError> {
            let mut response = Response::ok(request.module);
            response.broadcast = true;
            Ok(response)
        }

        async fn close(&self) {}
    }

    let hub = TestHub::new();
    let mut announcements = hub
        .broker
        .subscribe(BROADCAST_TOPIC)
        .unwrap();
    hub.registry.register("doorbell", Box::new(Announcer)).await.unwrap();

    let request = Request::new("doorbell", "ring", json!({})).unwrap();
    let reply = hub.call(&request).await;
    assert!(reply.success);

    let announced: Envelope =
        tokio::time::timeout(Duration::from_secs(1), announcements.messages.recv())
            .await
            .unwrap()
            .unwrap()
            .envelope;
    assert!(hub.open(&announced).broadcast);
}

#[tokio::test]
async fn local_process_reaches_module_topic_through_the_endpoint() {
    use hearth_hub::broker::{BrokerClient, BrokerEndpoint};
    use tokio_util::sync::CancellationToken;

    let hub = TestHub::new();
    let (module, pins) = garage_doors("garage-doors", &["main"]);
    hub.registry
        .register("garage-doors", Box::new(LocalHandle::spawn(module)))
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broker.sock");
    let endpoint = BrokerEndpoint::bind(&path, Arc::clone(&hub.broker) as Arc<dyn Broker>).unwrap();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(endpoint.run(shutdown.clone()));

    let client = BrokerClient::connect(&path).await.unwrap();
    let reply = client
        .request(
            &module_topic("garage-doors"),
            hub.seal(&trigger("garage-doors", "main", false)),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

    let response = hub.open(&reply);
    assert!(response.success);
    assert_eq!(response.data["door"], "main");
    assert_eq!(pins["main"].level().unwrap(), Level::Low);

    client.close().await;
    shutdown.cancel();
    server.await.unwrap();
}
