//! Per-door actuation window
//!
//! A trigger drives the door's line low for the trigger window, then returns
//! it high. A trigger that arrives while a window is open cancels that
//! window instead of starting another one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use super::pin::{DigitalPin, Level};
use crate::Result;

/// What a trigger did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A new window was opened for the given duration
    Triggered(Duration),
    /// The open window was cancelled and the line returned high
    Cancelled,
}

impl TriggerOutcome {
    /// Label reported in responses
    #[must_use]
    pub const fn action(self) -> &'static str {
        match self {
            Self::Triggered(_) => "triggered",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug)]
struct Window {
    generation: u64,
    cancel: oneshot::Sender<()>,
}

/// Controller for one garage door relay line
#[derive(Debug)]
pub struct DoorController {
    pin: Arc<dyn DigitalPin>,
    trigger_time: Duration,
    force_trigger_time: Duration,
    window: Arc<Mutex<Option<Window>>>,
    generation: AtomicU64,
}

impl DoorController {
    /// Create a controller and drive the line to its idle level
    ///
    /// # Errors
    ///
    /// Returns error if the pin cannot be written
    pub fn new(
        pin: Arc<dyn DigitalPin>,
        trigger_time: Duration,
        force_trigger_time: Duration,
    ) -> Result<Self> {
        pin.set(Level::High)?;
        Ok(Self {
            pin,
            trigger_time,
            force_trigger_time,
            window: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        })
    }

    /// Whether a trigger window is currently open
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Trigger the door, or cancel the open window
    ///
    /// `force` selects the longer window; it has no effect on cancellation.
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the pin cannot be written
    pub fn trigger(&self, force: bool) -> Result<TriggerOutcome> {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(open) = window.take() {
            let _ = open.cancel.send(());
            self.pin.set(Level::High)?;
            return Ok(TriggerOutcome::Cancelled);
        }

        self.pin.set(Level::Low)?;

        let duration = if force {
            self.force_trigger_time
        } else {
            self.trigger_time
        };
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (cancel, cancelled) = oneshot::channel();
        *window = Some(Window { generation, cancel });
        drop(window);

        let pin = Arc::clone(&self.pin);
        let state = Arc::clone(&self.window);
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(duration) => {}
                _ = cancelled => return,
            }

            let mut window = state.lock().unwrap_or_else(PoisonError::into_inner);
            if window.as_ref().is_some_and(|w| w.generation == generation) {
                *window = None;
                if let Err(e) = pin.set(Level::High) {
                    tracing::error!(error = %e, "failed to release door line");
                }
            }
        });

        Ok(TriggerOutcome::Triggered(duration))
    }
}
