//! Per-device operational state.
//!
//! Classification of raw codes lives in [`MachineState::from_code`]. The
//! tracker keeps the most recently normalized status per device: whichever
//! realtime sample or status frame went through the pipeline last wins,
//! regardless of its source timestamp.

use std::collections::HashMap;

use serde::Serialize;
use time::OffsetDateTime;

use moldwatch_types::{CanonicalSample, DeviceId, MachineState, SourceType};

use crate::messages::StatusUpdate;

/// Last known status of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    /// Derived operational state.
    pub state: MachineState,
    /// Raw status code that produced `state`.
    pub code: i64,
    /// Raw operation mode, if the source carried one.
    pub operation_mode: Option<i64>,
    /// Source timestamp of the reading that set this status.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// A transition of the derived state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    /// Device whose state changed.
    pub device_id: DeviceId,
    /// Previous state, if one was known.
    pub previous: Option<MachineState>,
    /// New state.
    pub current: MachineState,
}

/// Last-writer-wins status table.
#[derive(Debug, Default)]
pub struct StatusTracker {
    devices: HashMap<DeviceId, DeviceStatus>,
}

impl StatusTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a raw status code for a device.
    ///
    /// Returns the transition if the derived state changed.
    pub fn apply(
        &mut self,
        device_id: &DeviceId,
        code: i64,
        operation_mode: Option<i64>,
        timestamp: OffsetDateTime,
    ) -> Option<StatusChange> {
        let current = MachineState::from_code(code);
        let previous = self
            .devices
            .insert(
                device_id.clone(),
                DeviceStatus {
                    state: current,
                    code,
                    operation_mode,
                    timestamp,
                },
            )
            .map(|old| old.state);

        (previous != Some(current)).then(|| StatusChange {
            device_id: device_id.clone(),
            previous,
            current,
        })
    }

    /// Record the status carried by a realtime sample.
    ///
    /// Historical and SPC samples do not move the live status.
    pub fn apply_sample(&mut self, sample: &CanonicalSample) -> Option<StatusChange> {
        if sample.source_type != SourceType::Realtime {
            return None;
        }
        let code = sample.status?;
        self.apply(&sample.device_id, code, sample.operation_mode, sample.timestamp)
    }

    /// Record a status frame.
    pub fn apply_update(&mut self, update: &StatusUpdate) -> Option<StatusChange> {
        self.apply(
            &update.device_id,
            update.status,
            update.operation_mode,
            update.timestamp,
        )
    }

    /// Last known status of a device.
    pub fn get(&self, device_id: &DeviceId) -> Option<DeviceStatus> {
        self.devices.get(device_id).copied()
    }

    /// Derived state of a device, `Offline` if nothing is known.
    pub fn state(&self, device_id: &DeviceId) -> MachineState {
        self.get(device_id).map(|s| s.state).unwrap_or_default()
    }

    /// Forget a device.
    pub fn remove(&mut self, device_id: &DeviceId) {
        self.devices.remove(device_id);
    }

    /// Forget every device.
    pub fn clear(&mut self) {
        self.devices.clear();
    }
}
