//! Telemetry records and the envelopes they are built from.
//!
//! A [`RawEnvelope`] is what a source hands over: one uplink message from the
//! network server, still unparsed. A [`TelemetryRecord`] is what ends up in
//! the local record file.
//!
//! # Persisted Shape
//!
//! ```text
//! {
//!   "timestamp":   "2024-01-01T00:00:00Z",
//!   "device_id":   "sensor-1",
//!   "sensor_data": { "Bat": 3.6, "temp_SOIL": 21.4, ... },
//!   "raw_message": { "data": { "received_at": "...", "end_device_ids": {...}, ... } }
//! }
//! ```
//!
//! The uplink body always sits under `raw_message.data`, whichever source
//! produced the record. That is where the natural key is read from.

use crate::{Error, Result, UNKNOWN_DEVICE_ID};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;

/// Which channel delivered an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Pulled from the storage API during backfill.
    Historical,
    /// Pushed over the live subscription.
    Live,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Historical => "historical",
            Self::Live => "live",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An uplink message as received from a source, prior to field extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEnvelope {
    origin: Origin,
    body: Value,
}

impl RawEnvelope {
    /// Wrap the `result` object of one storage API line.
    pub fn historical(result: Value) -> Self {
        Self {
            origin: Origin::Historical,
            body: result,
        }
    }

    /// Wrap a message received over the live subscription.
    pub fn live(message: Value) -> Self {
        Self {
            origin: Origin::Live,
            body: message,
        }
    }

    /// Decode a live subscription payload.
    ///
    /// The payload must be a JSON object; anything else is rejected so the
    /// caller can log and drop it.
    pub fn from_live_payload(payload: &[u8]) -> Result<Self> {
        let message: Value = serde_json::from_slice(payload)?;
        if !message.is_object() {
            return Err(Error::InvalidEnvelope(format!(
                "expected a JSON object, got {}",
                json_type_name(&message)
            )));
        }
        Ok(Self::live(message))
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// The envelope exactly as received.
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// The uplink body.
    ///
    /// Some brokers wrap live messages as `{"data": {...}}`; when that wrapper
    /// is present the inner object is returned.
    pub fn uplink(&self) -> &Value {
        match self.origin {
            Origin::Historical => &self.body,
            Origin::Live => match self.body.get("data") {
                Some(inner) if inner.is_object() => inner,
                _ => &self.body,
            },
        }
    }

    /// Provider-assigned receipt timestamp, if present.
    pub fn received_at(&self) -> Option<&str> {
        self.uplink().get("received_at").and_then(Value::as_str)
    }

    /// `end_device_ids.device_id`, if present and a non-empty string.
    pub fn device_id(&self) -> Option<&str> {
        self.uplink()
            .get("end_device_ids")
            .and_then(|ids| ids.get("device_id"))
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
    }

    /// `uplink_message.decoded_payload`, if it is an object.
    pub fn decoded_payload(&self) -> Option<&Map<String, Value>> {
        self.uplink()
            .get("uplink_message")
            .and_then(|uplink| uplink.get("decoded_payload"))
            .and_then(Value::as_object)
    }
}

/// Deduplication identity of a record: device plus provider receipt time.
///
/// Receipt times are compared as exact strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey {
    pub device_id: String,
    pub received_at: String,
}

impl NaturalKey {
    pub fn new(device_id: impl Into<String>, received_at: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            received_at: received_at.into(),
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.device_id, self.received_at)
    }
}

/// One persisted telemetry reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Source receipt time for backfilled records, ingestion time for live ones.
    pub timestamp: String,

    pub device_id: String,

    /// Decoded sensor readings, passed through untouched.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub sensor_data: Map<String, Value>,

    /// The original envelope, with the uplink body under `data`.
    pub raw_message: Value,

    /// Fields written by other tools; carried through rewrites unchanged.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TelemetryRecord {
    /// Build a candidate record from an envelope.
    ///
    /// Missing or unusable device identifiers become [`UNKNOWN_DEVICE_ID`];
    /// the envelope itself is kept verbatim either way.
    pub fn from_envelope(envelope: &RawEnvelope, now: DateTime<Utc>) -> Self {
        let device_id = envelope
            .device_id()
            .unwrap_or(UNKNOWN_DEVICE_ID)
            .to_string();

        let sensor_data = envelope.decoded_payload().cloned().unwrap_or_default();

        let ingested_at = now.to_rfc3339_opts(SecondsFormat::Micros, true);
        let timestamp = match envelope.origin() {
            Origin::Historical => envelope
                .received_at()
                .map(str::to_string)
                .unwrap_or(ingested_at),
            Origin::Live => ingested_at,
        };

        let raw_message = match envelope.origin() {
            Origin::Historical => json!({ "data": envelope.body() }),
            Origin::Live => match envelope.body().get("data") {
                Some(inner) if inner.is_object() => envelope.body().clone(),
                _ => json!({ "data": envelope.body() }),
            },
        };

        Self {
            timestamp,
            device_id,
            sensor_data,
            raw_message,
            extra: Map::new(),
        }
    }

    /// Receipt timestamp from `raw_message.data.received_at`.
    pub fn received_at(&self) -> Option<&str> {
        self.raw_message
            .get("data")
            .and_then(|data| data.get("received_at"))
            .and_then(Value::as_str)
    }

    /// The natural key, or `None` when the envelope carries no receipt time.
    pub fn natural_key(&self) -> Option<NaturalKey> {
        self.received_at()
            .map(|received_at| NaturalKey::new(self.device_id.as_str(), received_at))
    }

    /// Compact `name=value` rendering of the sensor readings, for logs.
    pub fn reading_summary(&self) -> String {
        if self.sensor_data.is_empty() {
            return "no readings".to_string();
        }
        self.sensor_data
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
