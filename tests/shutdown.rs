//! Teardown while calls are in flight

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::UnixListener;
use uuid::Uuid;

use hearth_hub::broker::{Broker, InMemoryBroker, module_topic};
use hearth_hub::discovery::{InProcessHandleFactory, SocketHandleFactory, StaticSource};
use hearth_hub::envelope::Request;
use hearth_hub::invoke::LocalHandle;
use hearth_hub::invoke::rpc::socket_path;
use hearth_hub::modules::Service;
use hearth_hub::relay::{RelayConfig, RelayManager};
use hearth_hub::router::Dispatch;
use hearth_hub::security::{EnvelopeCipher, SharedKeyCipher, Unsigned};
use hearth_hub::Supervisor;

mod common;
use common::{SlowService, TestHub, eventually};

#[tokio::test]
async fn unregister_waits_for_in_flight_dispatch() {
    let hub = TestHub::new();
    let service = SlowService::new("sprinklers", Duration::from_millis(200));
    hub.registry
        .register("sprinklers", Box::new(LocalHandle::spawn(Arc::clone(&service) as _)))
        .await
        .unwrap();

    let registry = Arc::clone(&hub.registry);
    let in_flight = tokio::spawn(async move {
        registry
            .dispatch("sprinklers", Request::new("sprinklers", "water", json!({})).unwrap())
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    hub.registry.unregister("sprinklers").await;

    // The dispatch that held the handle completed normally
    let response = in_flight.await.unwrap();
    assert!(response.success);
    assert_eq!(service.calls(), 1);

    let late = hub
        .registry
        .dispatch("sprinklers", Request::new("sprinklers", "water", json!({})).unwrap())
        .await;
    assert!(!late.success);
}

#[tokio::test]
async fn supervisor_shutdown_drains_and_releases_everything() {
    let cipher = Arc::new(SharedKeyCipher::generate());
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());

    let mut supervisor = Supervisor::new(
        Arc::clone(&broker),
        Arc::clone(&cipher) as Arc<dyn EnvelopeCipher>,
        Arc::new(Unsigned),
        RelayManager::new(RelayConfig::default(), Uuid::new_v4()),
    );

    let service = SlowService::new("sprinklers", Duration::from_millis(200));
    let factory = InProcessHandleFactory::new([Arc::clone(&service) as Arc<dyn Service>]);
    supervisor.start_discovery(Box::new(StaticSource::new(factory.names())), Arc::new(factory));

    let registry = Arc::clone(supervisor.registry());
    assert!(eventually(|| registry.contains("sprinklers")).await);

    let dispatcher = Arc::clone(&registry);
    let in_flight = tokio::spawn(async move {
        dispatcher
            .dispatch("sprinklers", Request::new("sprinklers", "water", json!({})).unwrap())
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    supervisor.shutdown().await;

    assert!(in_flight.await.unwrap().success);
    assert!(registry.is_empty());
    assert_eq!(broker.subscriber_count(&module_topic("sprinklers")), 0);
    assert!(broker.subscribe(&module_topic("sprinklers")).is_err());
}

/// Accepts module connections and never answers a call
fn unresponsive_module(path: &std::path::Path) -> tokio::task::JoinHandle<()> {
    let listener = UnixListener::bind(path).unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    })
}

#[tokio::test]
async fn shutdown_stops_a_remote_call_that_never_returns() {
    let dir = tempfile::tempdir().unwrap();
    let module = unresponsive_module(&socket_path(dir.path(), "stuck"));

    let cipher = Arc::new(SharedKeyCipher::generate());
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    let mut supervisor = Supervisor::with_drain_timeout(
        Arc::clone(&broker),
        Arc::clone(&cipher) as Arc<dyn EnvelopeCipher>,
        Arc::new(Unsigned),
        RelayManager::new(RelayConfig::default(), Uuid::new_v4()),
        Duration::from_millis(200),
    );
    supervisor.start_discovery(
        Box::new(StaticSource::new(["stuck".to_string()])),
        Arc::new(SocketHandleFactory::new(dir.path())),
    );

    let registry = Arc::clone(supervisor.registry());
    assert!(eventually(|| registry.contains("stuck")).await);

    let dispatcher = Arc::clone(&registry);
    let in_flight = tokio::spawn(async move {
        dispatcher
            .dispatch("stuck", Request::new("stuck", "open", json!({})).unwrap())
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(5), supervisor.shutdown())
        .await
        .expect("shutdown finished");

    let response = in_flight.await.unwrap();
    assert!(!response.success);
    assert_eq!(response.message(), Some("invocation handle closed"));
    assert!(registry.is_empty());

    module.abort();
}

#[tokio::test]
async fn hung_module_does_not_block_other_registrations() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(dir.path(), "stuck");
    let module = unresponsive_module(&path);

    let hub = TestHub::new();
    let handle = hearth_hub::invoke::RemoteHandle::connect("stuck", &path)
        .await
        .unwrap();
    hub.registry.register("stuck", Box::new(handle)).await.unwrap();

    let registry = Arc::clone(&hub.registry);
    let in_flight = tokio::spawn(async move {
        registry
            .dispatch("stuck", Request::new("stuck", "open", json!({})).unwrap())
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Teardown gives the call the default drain window, then stops it
    let unregister = {
        let registry = Arc::clone(&hub.registry);
        tokio::spawn(async move { registry.unregister("stuck").await })
    };

    let service = SlowService::new("lights", Duration::ZERO);
    tokio::time::timeout(
        Duration::from_secs(10),
        hub.registry
            .register("lights", Box::new(LocalHandle::spawn(Arc::clone(&service) as _))),
    )
    .await
    .expect("registration finished")
    .unwrap();

    unregister.await.unwrap();
    assert!(!in_flight.await.unwrap().success);
    assert_eq!(hub.registry.names(), vec!["lights".to_string()]);

    module.abort();
}
