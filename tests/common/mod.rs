//! Shared test utilities

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use hearth_hub::broker::{Broker, InMemoryBroker, module_topic};
use hearth_hub::envelope::{Envelope, Request, Response, decode_response, encode_request};
use hearth_hub::modules::garage_doors::{DigitalPin, DoorController, GarageDoors, MemoryPin};
use hearth_hub::modules::Service;
use hearth_hub::registry::ModuleRegistry;
use hearth_hub::router::LocalRouter;
use hearth_hub::security::{EnvelopeCipher, SharedKeyCipher};

/// Normal trigger window used by test doors
pub const TRIGGER_TIME: Duration = Duration::from_millis(400);

/// Forced trigger window used by test doors
pub const FORCE_TRIGGER_TIME: Duration = Duration::from_secs(10);

/// Broker, cipher and registry wired together the way the hub does it
pub struct TestHub {
    pub broker: Arc<InMemoryBroker>,
    pub cipher: Arc<SharedKeyCipher>,
    pub registry: Arc<ModuleRegistry>,
}

impl TestHub {
    pub fn new() -> Self {
        let broker = Arc::new(InMemoryBroker::new());
        let cipher = Arc::new(SharedKeyCipher::generate());
        let router = LocalRouter::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::clone(&cipher) as Arc<dyn EnvelopeCipher>,
        );
        let registry = ModuleRegistry::new(Arc::clone(&broker) as Arc<dyn Broker>, router);
        Self {
            broker,
            cipher,
            registry,
        }
    }

    /// Encrypt a request into an envelope from a fresh sender
    pub fn seal(&self, request: &Request) -> Envelope {
        let contents = self
            .cipher
            .encrypt(&encode_request(request).expect("encode request"))
            .expect("encrypt request");
        Envelope::new(Uuid::new_v4(), Uuid::new_v4(), contents)
    }

    /// Decrypt a reply envelope
    pub fn open(&self, envelope: &Envelope) -> Response {
        let plaintext = self.cipher.decrypt(&envelope.contents).expect("decrypt reply");
        decode_response(&plaintext).expect("decode reply")
    }

    /// Send a request over the broker and open the reply
    pub async fn call(&self, request: &Request) -> Response {
        let reply = self
            .broker
            .request(
                &module_topic(&request.module),
                self.seal(request),
                Duration::from_secs(1),
            )
            .await
            .expect("module reply");
        self.open(&reply)
    }
}

/// A garage-door module with simulated pins, one per door name
pub fn garage_doors(name: &str, doors: &[&str]) -> (Arc<GarageDoors>, BTreeMap<String, Arc<MemoryPin>>) {
    let mut pins = BTreeMap::new();
    let mut controllers = BTreeMap::new();

    for door in doors {
        let pin = Arc::new(MemoryPin::new());
        let controller = DoorController::new(
            Arc::clone(&pin) as Arc<dyn DigitalPin>,
            TRIGGER_TIME,
            FORCE_TRIGGER_TIME,
        )
        .expect("door controller");
        pins.insert((*door).to_string(), pin);
        controllers.insert((*door).to_string(), controller);
    }

    let module = GarageDoors::new(name, controllers).expect("garage doors module");
    (Arc::new(module), pins)
}

/// Trigger request for a door
pub fn trigger(module: &str, door: &str, force: bool) -> Request {
    Request::new(module, "trigger", serde_json::json!({"door": door, "force": force}))
        .expect("trigger request")
}

/// Service that takes `delay` to answer and counts its calls
pub struct SlowService {
    name: String,
    delay: Duration,
    pub calls: AtomicUsize,
}

impl SlowService {
    pub fn new(name: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Service for SlowService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, request: Request) -> Response {
        if request.method != "quick" {
            tokio::time::sleep(self.delay).await;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        Response::ok(self.name.as_str()).with("method", Value::String(request.method))
    }
}

/// Poll `check` until it holds or a few seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
