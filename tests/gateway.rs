//! WAN gateway bridge integration tests

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use hearth_hub::broker::Broker;
use hearth_hub::envelope::{Envelope, Request};
use hearth_hub::gateway::{GatewayBridge, WAN_REQUEST_TIMEOUT};
use hearth_hub::invoke::LocalHandle;
use hearth_hub::relay::{RelayEvent, RelaySink};
use hearth_hub::security::{EnvelopeCipher, EnvelopeSigner, HubIdentity, Unsigned};
use hearth_hub::{Error, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod common;
use common::{SlowService, TestHub, garage_doors, trigger};

#[derive(Default)]
struct CapturedSink(Mutex<Vec<Envelope>>);

impl CapturedSink {
    fn sent(&self) -> Vec<Envelope> {
        self.0.lock().unwrap().clone()
    }
}

#[async_trait]
impl RelaySink for CapturedSink {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        self.0.lock().unwrap().push(envelope);
        Ok(())
    }

    async fn close(&self) {}
}

/// Collects formatted log output
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn bridge(
    hub: &TestHub,
    signer: Arc<dyn EnvelopeSigner>,
) -> (Arc<GatewayBridge>, Arc<CapturedSink>) {
    let sink = Arc::new(CapturedSink::default());
    let bridge = GatewayBridge::new(
        Arc::clone(&hub.broker) as Arc<dyn Broker>,
        Arc::clone(&hub.cipher) as Arc<dyn EnvelopeCipher>,
        signer,
        Arc::clone(&sink) as Arc<dyn RelaySink>,
    );
    (Arc::new(bridge), sink)
}

#[tokio::test]
async fn reply_swaps_addresses_and_is_freshly_signed() {
    let hub = TestHub::new();
    let (module, _) = garage_doors("garage-doors", &["main"]);
    hub.registry
        .register("garage-doors", Box::new(LocalHandle::spawn(module)))
        .await
        .unwrap();

    let identity = Arc::new(HubIdentity::generate());
    let (bridge, sink) = bridge(&hub, Arc::clone(&identity) as Arc<dyn EnvelopeSigner>);

    let mut inbound = hub.seal(&trigger("garage-doors", "main", false));
    inbound.signature = "signature-from-the-remote-sender".to_string();
    let reply = bridge.forward(inbound.clone()).await.unwrap();

    assert_eq!(reply.to, inbound.from);
    assert_eq!(reply.from, inbound.to);
    assert_ne!(reply.signature, inbound.signature);
    assert!(identity.verify_envelope(&reply).unwrap());

    let response = hub.open(&reply);
    assert!(response.success);
    assert_eq!(response.data["door"], "main");
    assert_eq!(sink.sent(), vec![reply]);
}

#[tokio::test(start_paused = true)]
async fn slow_round_trip_times_out_without_reply() {
    let hub = TestHub::new();
    let service = SlowService::new("sprinklers", Duration::from_secs(5));
    hub.registry
        .register(
            "sprinklers",
            Box::new(LocalHandle::spawn(Arc::clone(&service) as _)),
        )
        .await
        .unwrap();
    let (bridge, sink) = bridge(&hub, Arc::new(Unsigned));

    let slow = Request::new("sprinklers", "water", json!({"zone": 2})).unwrap();
    let err = bridge.forward(hub.seal(&slow)).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(after) if after == WAN_REQUEST_TIMEOUT));
    assert!(sink.sent().is_empty());

    // The local call still finishes; its late reply is discarded
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(service.calls(), 1);
    assert_eq!(hub.broker.pending_requests(), 0);

    let quick = Request::new("sprinklers", "quick", json!({})).unwrap();
    let reply = bridge.forward(hub.seal(&quick)).await.unwrap();
    assert_eq!(hub.open(&reply).data["method"], "quick");
    assert_eq!(sink.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn timed_out_round_trip_is_logged_and_dropped() {
    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    let _logging = tracing::subscriber::set_default(subscriber);

    let hub = TestHub::new();
    let service = SlowService::new("sprinklers", Duration::from_secs(5));
    hub.registry
        .register(
            "sprinklers",
            Box::new(LocalHandle::spawn(Arc::clone(&service) as _)),
        )
        .await
        .unwrap();
    let (bridge, sink) = bridge(&hub, Arc::new(Unsigned));

    let (events_tx, events_rx) = mpsc::channel(8);
    let shutdown = CancellationToken::new();
    let task = Arc::clone(&bridge).spawn(events_rx, shutdown.clone());

    let slow = Request::new("sprinklers", "water", json!({"zone": 2})).unwrap();
    let inbound = hub.seal(&slow);
    events_tx
        .send(RelayEvent::Envelope(inbound.clone()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(sink.sent().is_empty());
    let output = logs.contents();
    assert!(output.contains("module round trip timed out; no reply sent"), "{output}");
    assert!(output.contains("timeout_ms=2000"), "{output}");
    assert!(output.contains(&inbound.from.to_string()), "{output}");

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn unknown_module_is_dropped() {
    let hub = TestHub::new();
    let (bridge, sink) = bridge(&hub, Arc::new(Unsigned));

    let request = Request::new("sprinklers", "water", json!({})).unwrap();
    assert!(bridge.forward(hub.seal(&request)).await.is_err());
    assert!(sink.sent().is_empty());
}

#[tokio::test]
async fn spawned_bridge_survives_disconnects() {
    let hub = TestHub::new();
    let (module, _) = garage_doors("garage-doors", &["main"]);
    hub.registry
        .register("garage-doors", Box::new(LocalHandle::spawn(module)))
        .await
        .unwrap();
    let (bridge, sink) = bridge(&hub, Arc::new(Unsigned));

    let (events_tx, events_rx) = mpsc::channel(8);
    let shutdown = CancellationToken::new();
    let task = Arc::clone(&bridge).spawn(events_rx, shutdown.clone());

    events_tx.send(RelayEvent::Connected).await.unwrap();
    events_tx
        .send(RelayEvent::Disconnected {
            reason: "relay restarted".to_string(),
        })
        .await
        .unwrap();
    events_tx.send(RelayEvent::Connected).await.unwrap();
    events_tx
        .send(RelayEvent::Envelope(hub.seal(&trigger("garage-doors", "main", false))))
        .await
        .unwrap();

    assert!(common::eventually(|| sink.sent().len() == 1).await);

    shutdown.cancel();
    task.await.unwrap();
}
