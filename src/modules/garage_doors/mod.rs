//! Garage door module
//!
//! Each configured door maps to one relay line. `trigger` pulses the line
//! for the trigger window; triggering a door mid-window cancels the window.

pub mod controller;
pub mod pin;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Deserialize;

use super::{ArgDoc, MethodTable, Service};
use crate::config::{GarageDoorsConfig, GpioBackend};
use crate::envelope::{Request, Response};
use crate::Result;

pub use controller::{DoorController, TriggerOutcome};
pub use pin::{DigitalPin, Level, MemoryPin, SysfsPin};

const TRIGGER_METHOD: &str = "trigger";

#[derive(Debug, Deserialize)]
struct TriggerArgs {
    #[serde(default)]
    door: String,
    #[serde(default)]
    force: bool,
}

/// Garage door actuator module
#[derive(Debug)]
pub struct GarageDoors {
    name: String,
    doors: BTreeMap<String, DoorController>,
    methods: MethodTable<Self>,
}

impl GarageDoors {
    /// Create the module from ready controllers
    ///
    /// # Errors
    ///
    /// Returns error if the method table is invalid
    pub fn new(name: impl Into<String>, doors: BTreeMap<String, DoorController>) -> Result<Self> {
        let name = name.into();
        let door_names = doors.keys().cloned();

        let methods = MethodTable::<Self>::builder(name.as_str())
            .method(
                TRIGGER_METHOD,
                "Trigger triggers a garage door normally or forced (trigger lasts until door is completely open or closed).",
                vec![
                    ArgDoc::required("door", "string").with_options(door_names),
                    ArgDoc::optional("force", "boolean"),
                ],
                |doors, request| doors.trigger(request).boxed(),
            )
            .build()?;

        Ok(Self {
            name,
            doors,
            methods,
        })
    }

    /// Open the configured pins and build the module
    ///
    /// # Errors
    ///
    /// Returns error if any pin cannot be opened
    pub fn from_config(name: &str, config: &GarageDoorsConfig) -> Result<Self> {
        let mut doors = BTreeMap::new();

        for (door, &number) in &config.pins {
            let pin: Arc<dyn DigitalPin> = match config.gpio {
                GpioBackend::Sysfs => Arc::new(SysfsPin::open(number)?),
                GpioBackend::Simulated => Arc::new(MemoryPin::new()),
            };
            let controller =
                DoorController::new(pin, config.trigger_time(), config.force_trigger_time())?;
            doors.insert(door.clone(), controller);
        }

        tracing::info!(module = name, doors = doors.len(), gpio = ?config.gpio, "garage doors ready");
        Self::new(name, doors)
    }

    /// Controller for a door
    #[must_use]
    pub fn door(&self, name: &str) -> Option<&DoorController> {
        self.doors.get(name)
    }

    async fn trigger(&self, request: &Request) -> Response {
        tracing::debug!(module = %self.name, "trigger called");

        let args: TriggerArgs = match request.parse_args() {
            Ok(args) => args,
            Err(e) => {
                tracing::error!(module = %self.name, error = %e, "could not parse trigger arguments");
                return Response::error(self.name.as_str(), TRIGGER_METHOD, "Error parsing arguments.");
            }
        };

        if args.door.is_empty() {
            tracing::error!(module = %self.name, "door not specified");
            return Response::error(
                self.name.as_str(),
                TRIGGER_METHOD,
                "You must specify a door to trigger.",
            );
        }

        let Some(controller) = self.doors.get(&args.door) else {
            tracing::error!(module = %self.name, door = %args.door, "unknown door");
            return Response::error(
                self.name.as_str(),
                TRIGGER_METHOD,
                format!("Unknown door: {}.", args.door),
            )
            .with("door", args.door)
            .with("force", args.force);
        };

        match controller.trigger(args.force) {
            Ok(outcome) => {
                let message = match outcome {
                    TriggerOutcome::Triggered(_) => "Garage door successfully triggered.",
                    TriggerOutcome::Cancelled => "Garage door trigger cancelled.",
                };
                tracing::debug!(
                    module = %self.name,
                    door = %args.door,
                    force = args.force,
                    action = outcome.action(),
                    "door trigger handled"
                );
                Response::ok(self.name.as_str())
                    .with("door", args.door)
                    .with("force", args.force)
                    .with("action", outcome.action())
                    .with("message", message)
            }
            Err(e) => {
                tracing::error!(module = %self.name, door = %args.door, error = %e, "could not trigger door");
                Response::error(self.name.as_str(), TRIGGER_METHOD, format!("ERROR: {e}"))
                    .with("door", args.door)
                    .with("force", args.force)
            }
        }
    }
}

#[async_trait]
impl Service for GarageDoors {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, request: Request) -> Response {
        self.methods.dispatch(self, &request).await
    }
}
