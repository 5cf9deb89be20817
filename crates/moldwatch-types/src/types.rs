//! Core types for machine telemetry.

use core::fmt;
use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{ParseError, ParseResult};

/// Opaque device identifier.
///
/// The same key is used by the channel, the registry, the store and the
/// query endpoint, and it is stable across reconnects.
///
/// # Examples
///
/// ```
/// use moldwatch_types::DeviceId;
///
/// let id = DeviceId::parse(" m-1 ").unwrap();
/// assert_eq!(id.as_str(), "m-1");
/// assert!(DeviceId::parse("   ").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct DeviceId(String);

impl DeviceId {
    /// Parse an identifier, trimming surrounding whitespace.
    pub fn parse(raw: &str) -> ParseResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ParseError::InvalidDeviceId(raw.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for DeviceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    /// Infallible conversion for trusted identifiers (tests, configuration).
    ///
    /// Use [`DeviceId::parse`] for input coming off the wire.
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Where a canonical sample came from.
///
/// The ordering (`Historical < Realtime < Spc`) is used to order samples
/// that share a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum SourceType {
    /// Backfilled from the historical query endpoint.
    Historical,
    /// Pushed live over the channel as a realtime frame.
    Realtime,
    /// Pushed live over the channel as a per-cycle SPC frame.
    Spc,
}

impl SourceType {
    /// Whether the sample was delivered over the live channel.
    pub fn is_live(self) -> bool {
        matches!(self, SourceType::Realtime | SourceType::Spc)
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceType::Historical => write!(f, "historical"),
            SourceType::Realtime => write!(f, "realtime"),
            SourceType::Spc => write!(f, "spc"),
        }
    }
}

/// Operational state of a machine, derived from its raw status code.
///
/// Classification is a total function over the integer domain: any code
/// that is not recognized maps to [`MachineState::Offline`].
///
/// # Examples
///
/// ```
/// use moldwatch_types::MachineState;
///
/// assert_eq!(MachineState::from_code(2), MachineState::Production);
/// assert_eq!(MachineState::from_code(0), MachineState::Offline);
/// assert_eq!(MachineState::from_code(99), MachineState::Offline);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum MachineState {
    /// Powered off, unreachable, or unknown.
    #[default]
    Offline,
    /// Powered on but not producing.
    Online,
    /// Actively running production cycles.
    Production,
    /// Running with an active warning condition.
    Warning,
}

impl MachineState {
    /// Raw status code for offline machines.
    pub const CODE_OFFLINE: i64 = 0;
    /// Raw status code for online (idle) machines.
    pub const CODE_ONLINE: i64 = 1;
    /// Raw status code for machines in production.
    pub const CODE_PRODUCTION: i64 = 2;
    /// Raw status code for machines raising a warning.
    pub const CODE_WARNING: i64 = 3;

    /// Classify a raw status code.
    #[must_use]
    pub fn from_code(code: i64) -> Self {
        match code {
            Self::CODE_ONLINE => MachineState::Online,
            Self::CODE_PRODUCTION => MachineState::Production,
            Self::CODE_WARNING => MachineState::Warning,
            _ => MachineState::Offline,
        }
    }
}

impl From<i64> for MachineState {
    fn from(code: i64) -> Self {
        Self::from_code(code)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineState::Offline => write!(f, "offline"),
            MachineState::Online => write!(f, "online"),
            MachineState::Production => write!(f, "production"),
            MachineState::Warning => write!(f, "warning"),
        }
    }
}

/// A normalized telemetry reading for one device at one instant.
///
/// Samples are immutable once built; stores share them behind `Arc`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct CanonicalSample {
    /// Device that produced the reading.
    pub device_id: DeviceId,
    /// Source timestamp of the reading.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
    /// Which path delivered the reading.
    pub source_type: SourceType,
    /// Barrel/mold zone temperatures in degrees Celsius, keyed by zone id.
    ///
    /// Zones whose reading was missing or non-finite are absent.
    pub temperatures: BTreeMap<String, f64>,
    /// Hydraulic oil temperature in degrees Celsius.
    pub oil_temp: Option<f64>,
    /// Raw machine status code, if the frame carried one.
    pub status: Option<i64>,
    /// Raw operation mode code, if the frame carried one.
    pub operation_mode: Option<i64>,
    /// Production cycle number (always present for SPC samples).
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub cycle_number: Option<u64>,
}

impl CanonicalSample {
    /// Start building a sample.
    pub fn builder(
        device_id: impl Into<DeviceId>,
        timestamp: OffsetDateTime,
        source_type: SourceType,
    ) -> CanonicalSampleBuilder {
        CanonicalSampleBuilder {
            sample: CanonicalSample {
                device_id: device_id.into(),
                timestamp,
                source_type,
                temperatures: BTreeMap::new(),
                oil_temp: None,
                status: None,
                operation_mode: None,
                cycle_number: None,
            },
        }
    }

    /// Operational state derived from the status code, if one was present.
    pub fn machine_state(&self) -> Option<MachineState> {
        self.status.map(MachineState::from_code)
    }

    /// Temperature of a single zone.
    pub fn zone(&self, zone_id: &str) -> Option<f64> {
        self.temperatures.get(zone_id).copied()
    }
}

/// Builder for constructing a [`CanonicalSample`].
#[derive(Debug)]
#[must_use]
pub struct CanonicalSampleBuilder {
    sample: CanonicalSample,
}

impl CanonicalSampleBuilder {
    /// Set one zone temperature. Non-finite values are ignored.
    pub fn temperature(mut self, zone_id: impl Into<String>, value: f64) -> Self {
        if value.is_finite() {
            self.sample.temperatures.insert(zone_id.into(), value);
        }
        self
    }

    /// Set the oil temperature. Non-finite values are ignored.
    pub fn oil_temp(mut self, value: f64) -> Self {
        self.sample.oil_temp = value.is_finite().then_some(value);
        self
    }

    /// Set the raw status code.
    pub fn status(mut self, code: i64) -> Self {
        self.sample.status = Some(code);
        self
    }

    /// Set the raw operation mode.
    pub fn operation_mode(mut self, mode: i64) -> Self {
        self.sample.operation_mode = Some(mode);
        self
    }

    /// Set the production cycle number.
    pub fn cycle_number(mut self, cycle: u64) -> Self {
        self.sample.cycle_number = Some(cycle);
        self
    }

    /// Finish building.
    pub fn build(self) -> CanonicalSample {
        self.sample
    }
}

/// Lifecycle state of the shared telemetry channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ConnectionState {
    /// No link and no attempt in progress (or waiting for a retry).
    #[default]
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// The link is open.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Observable status of the shared telemetry channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct ConnectionStatus {
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Most recent connection error, cleared on successful connect.
    pub last_error: Option<String>,
    /// Consecutive failed attempts since the last successful connect.
    pub reconnect_attempts: u32,
    /// Incremented on every successful connect.
    pub generation: u64,
}

impl ConnectionStatus {
    /// Whether the link is currently open.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_device_id_parse_trims() {
        let id = DeviceId::parse("  press-07\t").unwrap();
        assert_eq!(id.as_str(), "press-07");
        assert_eq!(id.to_string(), "press-07");
    }

    #[test]
    fn test_device_id_parse_rejects_blank() {
        assert!(matches!(
            DeviceId::parse(""),
            Err(ParseError::InvalidDeviceId(_))
        ));
        assert!(DeviceId::parse(" \n ").is_err());
    }

    #[test]
    fn test_machine_state_known_codes() {
        assert_eq!(MachineState::from_code(0), MachineState::Offline);
        assert_eq!(MachineState::from_code(1), MachineState::Online);
        assert_eq!(MachineState::from_code(2), MachineState::Production);
        assert_eq!(MachineState::from_code(3), MachineState::Warning);
    }

    #[test]
    fn test_machine_state_unknown_codes_fail_safe() {
        for code in [-1, 4, 99, i64::MIN, i64::MAX] {
            assert_eq!(MachineState::from(code), MachineState::Offline);
        }
    }

    #[test]
    fn test_source_type_ordering_and_liveness() {
        assert!(SourceType::Historical < SourceType::Realtime);
        assert!(SourceType::Realtime < SourceType::Spc);
        assert!(!SourceType::Historical.is_live());
        assert!(SourceType::Realtime.is_live());
        assert!(SourceType::Spc.is_live());
    }

    #[test]
    fn test_builder_skips_non_finite() {
        let sample = CanonicalSample::builder(
            "m-1",
            datetime!(2024-03-01 08:00 UTC),
            SourceType::Realtime,
        )
        .temperature("z1", 210.5)
        .temperature("z2", f64::NAN)
        .temperature("z3", f64::INFINITY)
        .oil_temp(f64::NEG_INFINITY)
        .status(2)
        .build();

        assert_eq!(sample.zone("z1"), Some(210.5));
        assert_eq!(sample.zone("z2"), None);
        assert_eq!(sample.zone("z3"), None);
        assert_eq!(sample.oil_temp, None);
        assert_eq!(sample.machine_state(), Some(MachineState::Production));
    }

    #[test]
    fn test_connection_status_default() {
        let status = ConnectionStatus::default();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(!status.is_connected());
        assert_eq!(status.generation, 0);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_sample_serializes_camel_case() {
        let sample = CanonicalSample::builder(
            "m-1",
            datetime!(2024-03-01 08:00 UTC),
            SourceType::Spc,
        )
        .oil_temp(45.0)
        .cycle_number(17)
        .build();

        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["deviceId"], "m-1");
        assert_eq!(json["sourceType"], "spc");
        assert_eq!(json["oilTemp"], 45.0);
        assert_eq!(json["cycleNumber"], 17);
    }
}
