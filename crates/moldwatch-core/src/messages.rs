//! Wire message types for the telemetry channel and the history endpoint.
//!
//! ```text
//! +-------------+   ControlMessage   +------------------+
//! |  Registry   | -----------------> |                  |
//! |             |                    | telemetry server |
//! |  Pipeline   | <----------------- |                  |
//! +-------------+      RawFrame      +------------------+
//!
//! +-------------+   HistoryRequest   +------------------+
//! | QueryFacade | -----------------> | history endpoint |
//! |             | <----------------- |                  |
//! +-------------+  HistoryResponse   +------------------+
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use moldwatch_types::{DeviceId, TimeRange};

/// Discriminator of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameKind {
    /// Periodic machine telemetry.
    Realtime,
    /// Per-cycle statistical process control record.
    Spc,
    /// Machine status change.
    Status,
    /// Operator-facing alert.
    Alert,
    /// A batch of historical rows pushed over the channel.
    HistoricalBatch,
}

impl FrameKind {
    /// Parse the wire tag.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "realtime" => Some(Self::Realtime),
            "spc" => Some(Self::Spc),
            "status" => Some(Self::Status),
            "alert" => Some(Self::Alert),
            "historical-batch" => Some(Self::HistoricalBatch),
            _ => None,
        }
    }
}

/// An inbound frame before normalization.
///
/// Everything except `kind` is kept untyped so that the normalizer can
/// reject bad input with a precise reason instead of a serde error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFrame {
    /// Message-kind tag (`realtime`, `spc`, `status`, `alert`, `historical-batch`).
    pub kind: String,
    /// Device identifier.
    #[serde(default)]
    pub device_id: Option<Value>,
    /// Source timestamp (epoch milliseconds or RFC 3339).
    #[serde(default)]
    pub timestamp: Option<Value>,
    /// Kind-specific payload.
    #[serde(default)]
    pub data: Value,
}

impl RawFrame {
    /// Decode a frame from a channel payload.
    pub fn from_bytes(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

/// Action carried by an outbound control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ControlAction {
    /// Start pushing live frames for a device.
    Subscribe,
    /// Stop pushing live frames for a device.
    Unsubscribe,
    /// Push a status frame for a device as soon as possible.
    RequestStatus,
}

/// Outbound control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    /// What to do.
    pub action: ControlAction,
    /// Which device.
    pub device_id: DeviceId,
}

impl ControlMessage {
    /// Build a subscribe message.
    pub fn subscribe(device_id: &DeviceId) -> Self {
        Self {
            action: ControlAction::Subscribe,
            device_id: device_id.clone(),
        }
    }

    /// Build an unsubscribe message.
    pub fn unsubscribe(device_id: &DeviceId) -> Self {
        Self {
            action: ControlAction::Unsubscribe,
            device_id: device_id.clone(),
        }
    }

    /// Build a status snapshot request.
    pub fn request_status(device_id: &DeviceId) -> Self {
        Self {
            action: ControlAction::RequestStatus,
            device_id: device_id.clone(),
        }
    }

    /// Serialize to a channel payload.
    pub fn to_bytes(&self) -> serde_json::Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

/// First frame sent on a fresh link when a session token is configured.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct AuthHandshake<'a> {
    action: &'static str,
    token: &'a str,
}

impl<'a> AuthHandshake<'a> {
    pub(crate) fn new(token: &'a str) -> Self {
        Self {
            action: "authenticate",
            token,
        }
    }

    pub(crate) fn to_bytes(&self) -> serde_json::Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

/// Request sent to the historical query endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    /// Device to query.
    pub device_id: DeviceId,
    /// Inclusive window start.
    #[serde(with = "time::serde::rfc3339")]
    pub range_start: OffsetDateTime,
    /// Inclusive window end.
    #[serde(with = "time::serde::rfc3339")]
    pub range_end: OffsetDateTime,
    /// Maximum number of rows to return.
    pub limit: usize,
}

impl HistoryRequest {
    /// Build a request for a device and window.
    pub fn new(device_id: &DeviceId, range: TimeRange, limit: usize) -> Self {
        Self {
            device_id: device_id.clone(),
            range_start: range.start,
            range_end: range.end,
            limit,
        }
    }

    /// The requested window.
    pub fn range(&self) -> TimeRange {
        TimeRange {
            start: self.range_start,
            end: self.range_end,
        }
    }
}

/// Response from the historical query endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryResponse {
    /// Raw rows, normalized by the caller.
    #[serde(default)]
    pub rows: Vec<Value>,
}

/// A status change extracted from a `status` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    /// Device whose status changed.
    pub device_id: DeviceId,
    /// Source timestamp.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Raw status code.
    pub status: i64,
    /// Raw operation mode, if present.
    pub operation_mode: Option<i64>,
}

/// Severity of an alert frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    /// Informational.
    #[default]
    Info,
    /// Needs attention.
    Warning,
    /// Needs immediate action.
    Critical,
}

impl AlertLevel {
    /// Parse a wire level, falling back to `Info` for unknown values.
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "warning" | "warn" => Self::Warning,
            "critical" | "error" | "alarm" => Self::Critical,
            _ => Self::Info,
        }
    }
}

/// An operator-facing alert extracted from an `alert` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertNotice {
    /// Device that raised the alert.
    pub device_id: DeviceId,
    /// Source timestamp.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Severity.
    pub level: AlertLevel,
    /// Human-readable message.
    pub message: String,
}
