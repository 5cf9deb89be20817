//! Telemetry event fan-out.
//!
//! Every write that changes what a consumer would see (new samples, a status
//! change, an alert, a channel state transition) is published on a broadcast
//! channel. Consumers await the next relevant event instead of polling.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use moldwatch_types::{CanonicalSample, ConnectionStatus, DeviceId, MachineState};

use crate::messages::AlertNotice;

/// Events published by the telemetry core.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum TelemetryEvent {
    /// One or more samples were written to a device series.
    SamplesUpdated {
        /// Device whose series changed.
        device_id: DeviceId,
        /// Number of samples inserted by this write.
        inserted: usize,
        /// Newest sample after the write.
        latest: Option<Arc<CanonicalSample>>,
    },
    /// The derived operational state of a device changed.
    StatusChanged {
        /// Device whose state changed.
        device_id: DeviceId,
        /// Previous state, if one was known.
        previous: Option<MachineState>,
        /// New state.
        current: MachineState,
    },
    /// An alert frame was received.
    Alert(AlertNotice),
    /// The shared channel changed state.
    Connection(ConnectionStatus),
}

impl TelemetryEvent {
    /// The device this event concerns, if any.
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            TelemetryEvent::SamplesUpdated { device_id, .. }
            | TelemetryEvent::StatusChanged { device_id, .. } => Some(device_id),
            TelemetryEvent::Alert(notice) => Some(&notice.device_id),
            TelemetryEvent::Connection(_) => None,
        }
    }

    /// Whether a consumer watching `device` should wake up for this event.
    ///
    /// Connection events concern every consumer.
    pub fn concerns(&self, device: &DeviceId) -> bool {
        self.device_id().is_none_or(|id| id == device)
    }
}

/// Sender for telemetry events.
pub type EventSender = broadcast::Sender<TelemetryEvent>;

/// Receiver for telemetry events.
pub type EventReceiver = broadcast::Receiver<TelemetryEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: TelemetryEvent) {
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}
