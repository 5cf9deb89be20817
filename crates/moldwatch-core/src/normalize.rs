//! Conversion of wire payloads into canonical samples.
//!
//! The normalizer is a pure transformation. It never touches the store; the
//! [`Pipeline`](crate::Pipeline) decides what to do with its output.
//!
//! Rules applied to every frame and row:
//!
//! - The device identifier must be a non-blank string (numbers are accepted
//!   and stringified).
//! - The timestamp must be integer epoch milliseconds or an RFC 3339 string
//!   between 1970-01-01 and the end of year 9999.
//! - Numeric fields accept JSON numbers or numeric strings. `null`, empty
//!   strings and non-finite values are absent readings, never zero.
//! - Anything else that cannot be interpreted rejects the whole frame.
//! - The source type comes from the frame kind, never from which fields
//!   happen to be present.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use time::macros::datetime;
use tracing::debug;

use moldwatch_types::{CanonicalSample, DeviceId, SourceType};

use crate::error::NormalizationError;
use crate::messages::{AlertLevel, AlertNotice, FrameKind, RawFrame, StatusUpdate};

type NormResult<T> = std::result::Result<T, NormalizationError>;

/// Output of normalizing one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    /// A single live sample (realtime or SPC).
    Sample(CanonicalSample),
    /// Historical rows pushed over the channel.
    Batch {
        /// Device the rows belong to.
        device_id: DeviceId,
        /// Rows that normalized successfully.
        samples: Vec<CanonicalSample>,
        /// Number of rows dropped.
        rejected: usize,
    },
    /// A status change.
    Status(StatusUpdate),
    /// An operator alert.
    Alert(AlertNotice),
}

impl Normalized {
    /// The device this output concerns.
    pub fn device_id(&self) -> &DeviceId {
        match self {
            Normalized::Sample(sample) => &sample.device_id,
            Normalized::Batch { device_id, .. } => device_id,
            Normalized::Status(update) => &update.device_id,
            Normalized::Alert(notice) => &notice.device_id,
        }
    }
}

/// Historical rows normalized for one device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBatch {
    /// Rows that normalized successfully.
    pub samples: Vec<CanonicalSample>,
    /// Number of rows dropped.
    pub rejected: usize,
}

/// Stateless converter from wire payloads to canonical types.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer;

impl Normalizer {
    /// Create a normalizer.
    pub fn new() -> Self {
        Self
    }

    /// Decode and normalize a raw channel payload.
    pub fn normalize_bytes(&self, payload: &[u8]) -> NormResult<Normalized> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| NormalizationError::Malformed(e.to_string()))?;
        if !value.is_object() {
            return Err(NormalizationError::Malformed(
                "frame is not a JSON object".to_string(),
            ));
        }
        let frame: RawFrame = serde_json::from_value(value)
            .map_err(|e| NormalizationError::Malformed(e.to_string()))?;
        self.normalize_frame(&frame)
    }

    /// Normalize a decoded frame.
    pub fn normalize_frame(&self, frame: &RawFrame) -> NormResult<Normalized> {
        let kind = FrameKind::parse(&frame.kind)
            .ok_or_else(|| NormalizationError::UnknownKind(frame.kind.clone()))?;
        let device_id = parse_device_id(frame.device_id.as_ref())?;

        match kind {
            FrameKind::Realtime | FrameKind::Spc => {
                let timestamp = parse_timestamp(frame.timestamp.as_ref())?;
                let data = data_object(&frame.data)?;
                let source = if kind == FrameKind::Spc {
                    SourceType::Spc
                } else {
                    SourceType::Realtime
                };
                build_sample(device_id, timestamp, source, data).map(Normalized::Sample)
            }
            FrameKind::Status => {
                let timestamp = parse_timestamp(frame.timestamp.as_ref())?;
                let data = data_object(&frame.data)?;
                let status = coerce_i64("status", data.get("status"))?
                    .ok_or(NormalizationError::MissingField("status"))?;
                let operation_mode = coerce_i64("operationMode", data.get("operationMode"))?;
                Ok(Normalized::Status(StatusUpdate {
                    device_id,
                    timestamp,
                    status,
                    operation_mode,
                }))
            }
            FrameKind::Alert => {
                let timestamp = parse_timestamp(frame.timestamp.as_ref())?;
                let data = data_object(&frame.data)?;
                let message = match data.get("message") {
                    Some(Value::String(text)) => text.clone(),
                    Some(Value::Null) | None => {
                        return Err(NormalizationError::MissingField("message"));
                    }
                    Some(_) => {
                        return Err(NormalizationError::invalid_field(
                            "message",
                            "expected a string",
                        ));
                    }
                };
                let level = data
                    .get("level")
                    .and_then(Value::as_str)
                    .map(AlertLevel::parse)
                    .unwrap_or_default();
                Ok(Normalized::Alert(AlertNotice {
                    device_id,
                    timestamp,
                    level,
                    message,
                }))
            }
            FrameKind::HistoricalBatch => {
                let data = data_object(&frame.data)?;
                let rows = match data.get("rows") {
                    Some(Value::Array(rows)) => rows,
                    Some(_) => {
                        return Err(NormalizationError::invalid_field(
                            "rows",
                            "expected an array",
                        ));
                    }
                    None => return Err(NormalizationError::MissingField("rows")),
                };
                let batch = self.normalize_rows(&device_id, rows);
                Ok(Normalized::Batch {
                    device_id,
                    samples: batch.samples,
                    rejected: batch.rejected,
                })
            }
        }
    }

    /// Normalize one historical query row for `device_id`.
    pub fn normalize_row(&self, device_id: &DeviceId, row: &Value) -> NormResult<CanonicalSample> {
        let fields = row.as_object().ok_or_else(|| {
            NormalizationError::Malformed("history row is not a JSON object".to_string())
        })?;
        let timestamp = parse_timestamp(fields.get("timestamp"))?;
        build_sample(device_id.clone(), timestamp, SourceType::Historical, fields)
    }

    /// Normalize a list of historical rows, dropping the ones that fail.
    pub fn normalize_rows(&self, device_id: &DeviceId, rows: &[Value]) -> RowBatch {
        let mut batch = RowBatch {
            samples: Vec::with_capacity(rows.len()),
            rejected: 0,
        };
        for (index, row) in rows.iter().enumerate() {
            match self.normalize_row(device_id, row) {
                Ok(sample) => batch.samples.push(sample),
                Err(e) => {
                    debug!("Dropping history row {} for {}: {}", index, device_id, e);
                    batch.rejected += 1;
                }
            }
        }
        batch
    }
}

fn data_object(data: &Value) -> NormResult<&Map<String, Value>> {
    static EMPTY: std::sync::OnceLock<Map<String, Value>> = std::sync::OnceLock::new();
    match data {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(EMPTY.get_or_init(Map::new)),
        _ => Err(NormalizationError::invalid_field("data", "expected an object")),
    }
}

fn build_sample(
    device_id: DeviceId,
    timestamp: OffsetDateTime,
    source: SourceType,
    fields: &Map<String, Value>,
) -> NormResult<CanonicalSample> {
    let temperatures = parse_temperatures(fields.get("temperatures"))?;
    let oil_temp = coerce_f64("oilTemp", fields.get("oilTemp"))?;
    let status = coerce_i64("status", fields.get("status"))?;
    let operation_mode = coerce_i64("operationMode", fields.get("operationMode"))?;
    let cycle_number = coerce_u64("cycleNumber", fields.get("cycleNumber"))?;

    if source == SourceType::Spc && cycle_number.is_none() {
        return Err(NormalizationError::MissingField("cycleNumber"));
    }

    let mut builder = CanonicalSample::builder(device_id, timestamp, source);
    for (zone, value) in temperatures {
        builder = builder.temperature(zone, value);
    }
    if let Some(oil) = oil_temp {
        builder = builder.oil_temp(oil);
    }
    if let Some(code) = status {
        builder = builder.status(code);
    }
    if let Some(mode) = operation_mode {
        builder = builder.operation_mode(mode);
    }
    if let Some(cycle) = cycle_number {
        builder = builder.cycle_number(cycle);
    }
    Ok(builder.build())
}

fn parse_device_id(raw: Option<&Value>) -> NormResult<DeviceId> {
    match raw {
        Some(Value::String(id)) => {
            DeviceId::parse(id).map_err(|_| NormalizationError::InvalidDeviceId)
        }
        Some(Value::Number(n)) => Ok(DeviceId::from(n.to_string())),
        _ => Err(NormalizationError::InvalidDeviceId),
    }
}

/// Parse epoch milliseconds (number or digit string) or RFC 3339.
fn parse_timestamp(raw: Option<&Value>) -> NormResult<OffsetDateTime> {
    let ts = parse_timestamp_value(raw)?;
    if ts < EARLIEST_TIMESTAMP || ts > LATEST_TIMESTAMP {
        return Err(NormalizationError::invalid_field(
            "timestamp",
            "outside 1970-01-01..=9999-12-31",
        ));
    }
    Ok(ts)
}

fn parse_timestamp_value(raw: Option<&Value>) -> NormResult<OffsetDateTime> {
    let invalid = |reason: &str| NormalizationError::invalid_field("timestamp", reason);
    match raw {
        None | Some(Value::Null) => Err(NormalizationError::MissingField("timestamp")),
        Some(Value::Number(n)) => {
            let millis = if let Some(ms) = n.as_i64() {
                ms
            } else {
                match n.as_f64() {
                    Some(ms) if ms.is_finite() => ms.trunc() as i64,
                    _ => return Err(invalid("not a finite number")),
                }
            };
            from_epoch_millis(millis).ok_or_else(|| invalid("epoch milliseconds out of range"))
        }
        Some(Value::String(text)) => {
            let text = text.trim();
            if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
                let millis: i64 = text.parse().map_err(|_| invalid("epoch milliseconds overflow"))?;
                return from_epoch_millis(millis)
                    .ok_or_else(|| invalid("epoch milliseconds out of range"));
            }
            OffsetDateTime::parse(text, &Rfc3339).map_err(|e| invalid(&e.to_string()))
        }
        Some(_) => Err(invalid("expected epoch milliseconds or an RFC 3339 string")),
    }
}

const EARLIEST_TIMESTAMP: OffsetDateTime = OffsetDateTime::UNIX_EPOCH;
const LATEST_TIMESTAMP: OffsetDateTime = datetime!(9999-12-31 23:59:59.999 UTC);

fn from_epoch_millis(millis: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
}

fn parse_temperatures(raw: Option<&Value>) -> NormResult<BTreeMap<String, f64>> {
    let mut zones = BTreeMap::new();
    match raw {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for (zone, value) in map {
                if let Some(reading) = coerce_f64(zone, Some(value))? {
                    zones.insert(zone.clone(), reading);
                }
            }
        }
        Some(_) => {
            return Err(NormalizationError::invalid_field(
                "temperatures",
                "expected an object keyed by zone",
            ));
        }
    }
    Ok(zones)
}

/// Coerce a reading to a finite float. Absent, null, blank and non-finite
/// values yield `None`.
fn coerce_f64(field: &str, raw: Option<&Value>) -> NormResult<Option<f64>> {
    let value = match raw {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(text)) => {
            let text = text.trim();
            if text.is_empty() {
                return Ok(None);
            }
            Some(text.parse::<f64>().map_err(|_| {
                NormalizationError::invalid_field(field, format!("'{text}' is not a number"))
            })?)
        }
        Some(other) => {
            return Err(NormalizationError::invalid_field(
                field,
                format!("expected a number, got {other}"),
            ));
        }
    };
    Ok(value.filter(|v| v.is_finite()))
}

fn coerce_i64(field: &str, raw: Option<&Value>) -> NormResult<Option<i64>> {
    let not_integer = |shown: &dyn std::fmt::Display| {
        NormalizationError::invalid_field(field, format!("'{shown}' is not an integer"))
    };
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => match (n.as_i64(), n.as_f64()) {
            (Some(v), _) => Ok(Some(v)),
            (None, Some(f)) if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                Ok(Some(f as i64))
            }
            _ => Err(not_integer(n)),
        },
        Some(Value::String(text)) => {
            let text = text.trim();
            if text.is_empty() {
                return Ok(None);
            }
            text.parse::<i64>().map(Some).map_err(|_| not_integer(&text))
        }
        Some(other) => Err(not_integer(other)),
    }
}

fn coerce_u64(field: &str, raw: Option<&Value>) -> NormResult<Option<u64>> {
    match coerce_i64(field, raw)? {
        Some(v) if v < 0 => Err(NormalizationError::invalid_field(
            field,
            "must not be negative",
        )),
        other => Ok(other.map(|v| v as u64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    fn normalize(value: Value) -> NormResult<Normalized> {
        Normalizer::new().normalize_bytes(&serde_json::to_vec(&value).unwrap())
    }

    fn sample(value: Value) -> CanonicalSample {
        match normalize(value).unwrap() {
            Normalized::Sample(sample) => sample,
            other => panic!("expected a sample, got {other:?}"),
        }
    }

    #[test]
    fn test_realtime_frame() {
        let s = sample(json!({
            "kind": "realtime",
            "deviceId": "press-07",
            "timestamp": 1_709_280_000_000_i64,
            "data": {
                "temperatures": { "z1": 210.5, "z2": "215.25", "z3": null, "z4": "NaN" },
                "oilTemp": 44.0,
                "status": 2,
                "operationMode": "1"
            }
        }));

        assert_eq!(s.device_id.as_str(), "press-07");
        assert_eq!(s.timestamp, datetime!(2024-03-01 08:00 UTC));
        assert_eq!(s.source_type, SourceType::Realtime);
        assert_eq!(s.zone("z1"), Some(210.5));
        assert_eq!(s.zone("z2"), Some(215.25));
        assert_eq!(s.zone("z3"), None);
        assert_eq!(s.zone("z4"), None);
        assert_eq!(s.temperatures.len(), 2);
        assert_eq!(s.oil_temp, Some(44.0));
        assert_eq!(s.status, Some(2));
        assert_eq!(s.operation_mode, Some(1));
        assert_eq!(s.cycle_number, None);
    }

    #[test]
    fn test_rfc3339_timestamp() {
        let s = sample(json!({
            "kind": "realtime",
            "deviceId": "m-1",
            "timestamp": "2024-03-01T09:00:00+01:00",
            "data": {}
        }));
        assert_eq!(s.timestamp, datetime!(2024-03-01 08:00 UTC));
    }

    #[test]
    fn test_digit_string_timestamp_is_epoch_millis() {
        let s = sample(json!({
            "kind": "realtime",
            "deviceId": 42,
            "timestamp": "1709280000000",
            "data": null
        }));
        assert_eq!(s.device_id.as_str(), "42");
        assert_eq!(s.timestamp, datetime!(2024-03-01 08:00 UTC));
    }

    #[test]
    fn test_spc_requires_cycle_number() {
        let err = normalize(json!({
            "kind": "spc",
            "deviceId": "m-1",
            "timestamp": 0,
            "data": { "oilTemp": 40 }
        }))
        .unwrap_err();
        assert_eq!(err, NormalizationError::MissingField("cycleNumber"));

        let s = sample(json!({
            "kind": "spc",
            "deviceId": "m-1",
            "timestamp": 0,
            "data": { "cycleNumber": 1207 }
        }));
        assert_eq!(s.source_type, SourceType::Spc);
        assert_eq!(s.cycle_number, Some(1207));
        assert_eq!(s.status, None);
    }

    #[test]
    fn test_source_type_comes_from_kind() {
        // A realtime frame carrying a cycle number stays realtime
        let s = sample(json!({
            "kind": "realtime",
            "deviceId": "m-1",
            "timestamp": 0,
            "data": { "cycleNumber": 3 }
        }));
        assert_eq!(s.source_type, SourceType::Realtime);
        assert_eq!(s.cycle_number, Some(3));
    }

    #[test]
    fn test_rejections() {
        let cases = [
            json!({ "kind": "realtime", "timestamp": 0, "data": {} }),
            json!({ "kind": "realtime", "deviceId": "  ", "timestamp": 0, "data": {} }),
            json!({ "kind": "realtime", "deviceId": "m", "data": {} }),
            json!({ "kind": "realtime", "deviceId": "m", "timestamp": "yesterday", "data": {} }),
            json!({ "kind": "realtime", "deviceId": "m", "timestamp": true, "data": {} }),
            json!({ "kind": "realtime", "deviceId": "m", "timestamp": 0,
                    "data": { "temperatures": { "z1": "hot" } } }),
            json!({ "kind": "realtime", "deviceId": "m", "timestamp": 0,
                    "data": { "temperatures": [1, 2] } }),
            json!({ "kind": "realtime", "deviceId": "m", "timestamp": 0,
                    "data": { "status": 2.5 } }),
            json!({ "kind": "spc", "deviceId": "m", "timestamp": 0,
                    "data": { "cycleNumber": -1 } }),
            json!({ "kind": "realtime", "deviceId": "m", "timestamp": 0, "data": "x" }),
        ];
        for case in cases {
            assert!(normalize(case.clone()).is_err(), "accepted {case}");
        }
    }

    #[test]
    fn test_timestamps_outside_supported_window() {
        for ts in [
            json!(-377_705_116_800_000_i64),
            json!(-1),
            json!(i64::MIN),
            json!(i64::MAX),
            json!(253_402_300_800_000_i64),
            json!("-0001-06-01T00:00:00Z"),
            json!("1969-12-31T23:59:59Z"),
        ] {
            let frame = json!({ "kind": "realtime", "deviceId": "m", "timestamp": ts, "data": {} });
            assert!(
                matches!(
                    normalize(frame),
                    Err(NormalizationError::InvalidField { ref field, .. }) if field == "timestamp"
                ),
                "accepted {ts}"
            );
        }

        let last = json!({
            "kind": "realtime", "deviceId": "m", "timestamp": 253_402_300_799_999_i64, "data": {}
        });
        assert!(normalize(last).is_ok());
    }

    #[test]
    fn test_unknown_kind_and_malformed_payload() {
        assert!(matches!(
            normalize(json!({ "kind": "telemetry", "deviceId": "m", "timestamp": 0 })),
            Err(NormalizationError::UnknownKind(kind)) if kind == "telemetry"
        ));
        assert!(matches!(
            Normalizer::new().normalize_bytes(b"not json"),
            Err(NormalizationError::Malformed(_))
        ));
        assert!(matches!(
            normalize(json!([1, 2, 3])),
            Err(NormalizationError::Malformed(_))
        ));
    }

    #[test]
    fn test_status_frame() {
        let out = normalize(json!({
            "kind": "status",
            "deviceId": "m-1",
            "timestamp": 1000,
            "data": { "status": "3" }
        }))
        .unwrap();
        match out {
            Normalized::Status(update) => {
                assert_eq!(update.status, 3);
                assert_eq!(update.operation_mode, None);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(
            normalize(json!({
                "kind": "status", "deviceId": "m-1", "timestamp": 1000, "data": {}
            }))
            .unwrap_err(),
            NormalizationError::MissingField("status")
        );
    }

    #[test]
    fn test_alert_frame() {
        let out = normalize(json!({
            "kind": "alert",
            "deviceId": "m-1",
            "timestamp": 1000,
            "data": { "level": "critical", "message": "Zone 3 over temperature" }
        }))
        .unwrap();
        match out {
            Normalized::Alert(notice) => {
                assert_eq!(notice.level, AlertLevel::Critical);
                assert_eq!(notice.message, "Zone 3 over temperature");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_historical_batch_drops_bad_rows_individually() {
        let out = normalize(json!({
            "kind": "historical-batch",
            "deviceId": "m-1",
            "data": { "rows": [
                { "timestamp": 1000, "temperatures": { "z1": 200 } },
                { "temperatures": { "z1": 201 } },
                { "timestamp": 3000, "oilTemp": "warm" },
                { "timestamp": "1970-01-01T00:00:04Z", "status": 1 }
            ] }
        }))
        .unwrap();

        match out {
            Normalized::Batch {
                device_id,
                samples,
                rejected,
            } => {
                assert_eq!(device_id.as_str(), "m-1");
                assert_eq!(samples.len(), 2);
                assert_eq!(rejected, 2);
                assert!(samples.iter().all(|s| s.source_type == SourceType::Historical));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_normalize_row() {
        let normalizer = Normalizer::new();
        let device = DeviceId::from("m-1");
        let row = json!({ "timestamp": 0, "oilTemp": "41.5", "cycleNumber": 9 });
        let s = normalizer.normalize_row(&device, &row).unwrap();
        assert_eq!(s.source_type, SourceType::Historical);
        assert_eq!(s.oil_temp, Some(41.5));
        assert_eq!(s.cycle_number, Some(9));

        assert!(normalizer.normalize_row(&device, &json!("row")).is_err());
    }
}
