//! In-process event bus.
//!
//! Each event kind has its own `tokio::sync::broadcast` topic with a typed
//! payload, so a listener only sees what it subscribed to:
//!
//! | Topic | Payload |
//! |-------|---------|
//! | message | operator-readable progress/diagnostic text |
//! | position | [`PositionUpdate`] decoded from a stage reply |
//! | pressure | raw pressure reading from the pump controller |
//! | flow | raw flow reading from the pump controller |
//! | emergency | fired once per emergency stop |
//!
//! Publishing never fails: with no subscribers the event is simply dropped.
//! Subscribers that fall behind lose the oldest events (`RecvError::Lagged`).

use tokio::sync::broadcast;
use ulab_protocol::{Axis, DeviceCode};

const MESSAGE_CAPACITY: usize = 1024;
const TELEMETRY_CAPACITY: usize = 256;

/// A stage reported its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionUpdate {
    /// Reporting stage.
    pub device: DeviceCode,
    /// Reported axis.
    pub axis: Axis,
    /// Position in µm.
    pub position_um: u16,
}

/// Cloneable publisher/subscriber hub.
#[derive(Debug, Clone)]
pub struct EventBus {
    messages: broadcast::Sender<String>,
    positions: broadcast::Sender<PositionUpdate>,
    pressure: broadcast::Sender<u16>,
    flow: broadcast::Sender<u16>,
    emergency: broadcast::Sender<()>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        let (messages, _) = broadcast::channel(MESSAGE_CAPACITY);
        let (positions, _) = broadcast::channel(TELEMETRY_CAPACITY);
        let (pressure, _) = broadcast::channel(TELEMETRY_CAPACITY);
        let (flow, _) = broadcast::channel(TELEMETRY_CAPACITY);
        let (emergency, _) = broadcast::channel(16);
        Self {
            messages,
            positions,
            pressure,
            flow,
            emergency,
        }
    }

    /// Publish operator-facing text. Mirrored to the `ulab` tracing target.
    pub fn message(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::info!(target: "ulab", "{}", text);
        let _ = self.messages.send(text);
    }

    /// Publish a decoded stage position.
    pub fn position(&self, update: PositionUpdate) {
        tracing::trace!(
            device = %update.device,
            axis = %update.axis,
            position_um = update.position_um,
            "position update"
        );
        let _ = self.positions.send(update);
    }

    /// Publish a pressure reading.
    pub fn pressure(&self, value: u16) {
        tracing::trace!(pressure = value, "pressure update");
        let _ = self.pressure.send(value);
    }

    /// Publish a flow reading.
    pub fn flow(&self, value: u16) {
        tracing::trace!(flow = value, "flow update");
        let _ = self.flow.send(value);
    }

    /// Announce an emergency stop.
    pub fn emergency(&self) {
        tracing::warn!(target: "ulab", "emergency stop triggered");
        let _ = self.emergency.send(());
    }

    /// Operator text published after this call.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<String> {
        self.messages.subscribe()
    }

    /// Stage position reports.
    pub fn subscribe_positions(&self) -> broadcast::Receiver<PositionUpdate> {
        self.positions.subscribe()
    }

    /// Pressure readings.
    pub fn subscribe_pressure(&self) -> broadcast::Receiver<u16> {
        self.pressure.subscribe()
    }

    /// Flow readings.
    pub fn subscribe_flow(&self) -> broadcast::Receiver<u16> {
        self.flow.subscribe()
    }

    /// One `()` per emergency stop.
    pub fn subscribe_emergency(&self) -> broadcast::Receiver<()> {
        self.emergency.subscribe()
    }
}
