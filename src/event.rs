// MIT License - Copyright (c) 2026 tuya-lan-bridge contributors
// Device events broadcast to listeners

use serde_json::Value;

use crate::message::TuyaMessage;

/// All events that can be emitted by a device connection.
///
/// Users subscribe via `device.subscribe()` to receive a
/// `tokio::sync::broadcast::Receiver<DeviceEvent>`.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// TCP connection established (and the 3.4 session negotiated)
    Connected,
    /// TCP connection lost or closed
    Disconnected,
    /// The device pushed data points, either unsolicited or after a CONTROL
    StatusUpdate { dps: Value },
    /// Any decoded frame that was not the answer to a pending command.
    /// `payload` is already decrypted.
    Message(TuyaMessage),
}

/// Type alias for the broadcast sender.
pub type EventSender = tokio::sync::broadcast::Sender<DeviceEvent>;

/// Type alias for the broadcast receiver.
pub type EventReceiver = tokio::sync::broadcast::Receiver<DeviceEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(capacity)
}
