//! Core data types used throughout the Historical Datastore
//!
//! # Key Types
//!
//! - **`Stream`**: a registered data stream with schema, retention and source
//! - **`ValueType`**: the declared value shape of a stream (float/string/bool)
//! - **`SourceConfig`**: optional ingestion source (currently MQTT)
//! - **`Duration` parsing**: InfluxQL-style duration strings ("7d", "1h30m")

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::senml::Record;

/// Separator for multiple stream ids in one request path
pub const ID_SEPARATOR: char = ',';

/// Value type of a data stream
///
/// Immutable after stream creation; every stored record must match it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// 64-bit floating point (`v` field)
    Float,
    /// UTF-8 string (`vs` field)
    String,
    /// Boolean (`vb` field)
    Bool,
}

impl ValueType {
    /// Check whether a normalized record carries exactly the value field
    /// this type requires, and no other.
    pub fn matches(&self, record: &Record) -> bool {
        let has_string = record.string_value.as_deref().is_some_and(|s| !s.is_empty());
        match self {
            ValueType::Float => {
                record.value.is_some() && !has_string && record.bool_value.is_none()
            }
            ValueType::String => {
                has_string && record.value.is_none() && record.bool_value.is_none()
            }
            ValueType::Bool => {
                record.bool_value.is_some() && record.value.is_none() && !has_string
            }
        }
    }

    /// Infer the type from the populated value field of a record
    pub fn infer(record: &Record) -> Option<Self> {
        if record.value.is_some() {
            Some(ValueType::Float)
        } else if record.string_value.as_deref().is_some_and(|s| !s.is_empty()) {
            Some(ValueType::String)
        } else if record.bool_value.is_some() {
            Some(ValueType::Bool)
        } else {
            None
        }
    }

    /// Get the type name as a string
    pub fn name(&self) -> &'static str {
        match self {
            ValueType::Float => "float",
            ValueType::String => "string",
            ValueType::Bool => "bool",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// MQTT ingestion source of a data stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MqttSource {
    /// Broker URL, e.g. "tcp://broker.example.com:1883"
    pub url: String,
    /// Topic to subscribe to
    pub topic: String,
    /// Quality of service for the subscription
    #[serde(default)]
    pub qos: u8,
    /// Optional basic-auth username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Optional basic-auth password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Ingestion source configuration of a data stream
///
/// Tagged variant: either no source (push-only stream) or an MQTT
/// subscription maintained by the broker connector.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    /// No ingestion source; records arrive via the HTTP data API only
    #[default]
    None,
    /// Subscribe to an MQTT topic
    Mqtt(MqttSource),
}

impl SourceConfig {
    /// The MQTT source, if this is an MQTT-sourced stream
    pub fn mqtt(&self) -> Option<&MqttSource> {
        match self {
            SourceConfig::Mqtt(m) => Some(m),
            SourceConfig::None => None,
        }
    }
}

/// A registered data stream
///
/// The central entity of the registry: a named, typed series of sensor
/// measurements with a retention setting and an optional ingestion source.
/// `id`, `name` and `type` are immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    /// Opaque unique identifier, assigned on creation when empty
    #[serde(default)]
    pub id: String,

    /// Unique external name; incoming records address the stream by it
    pub name: String,

    /// Declared value type, immutable for the stream's lifetime
    #[serde(rename = "type")]
    pub value_type: ValueType,

    /// Optional unit of measurement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    /// Retention period ("7d", "1h", ...) or empty for the engine default
    #[serde(default)]
    pub retention: String,

    /// Ingestion source configuration
    #[serde(default)]
    pub source: SourceConfig,

    /// Free-form metadata
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, serde_json::Value>,

    /// Creation timestamp, maintained by the registry
    #[serde(default)]
    pub created: DateTime<Utc>,

    /// Last-update timestamp, maintained by the registry
    #[serde(default)]
    pub updated: DateTime<Utc>,
}

impl Stream {
    /// Construct a stream with the given name and type, everything else
    /// defaulted. Used by tests and by auto-registration.
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            value_type,
            unit: None,
            retention: String::new(),
            source: SourceConfig::None,
            meta: BTreeMap::new(),
            created: DateTime::<Utc>::default(),
            updated: DateTime::<Utc>::default(),
        }
    }
}

/// Parse an InfluxQL-style duration string such as "7d", "90m" or "1h30m"
///
/// Supported units: `ns`, `us`/`µs`, `ms`, `s`, `m`, `h`, `d`, `w`.
/// The result must be positive.
pub fn parse_duration(s: &str) -> Result<Duration> {
    if s.is_empty() {
        return Err(Error::BadRequest("empty duration".into()));
    }

    let mut total = Duration::ZERO;
    let mut chars = s.chars().peekable();
    while chars.peek().is_some() {
        let mut digits = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_digit() {
                digits.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        let mut unit = String::new();
        while let Some(c) = chars.peek() {
            if !c.is_ascii_digit() {
                unit.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        let n: u64 = digits
            .parse()
            .map_err(|_| Error::BadRequest(format!("invalid duration: {s}")))?;
        let d = match unit.as_str() {
            "ns" => Duration::from_nanos(n),
            "us" | "µs" => Duration::from_micros(n),
            "ms" => Duration::from_millis(n),
            "s" => Duration::from_secs(n),
            "m" => Duration::from_secs(n * 60),
            "h" => Duration::from_secs(n * 3600),
            "d" => Duration::from_secs(n * 86_400),
            "w" => Duration::from_secs(n * 604_800),
            _ => return Err(Error::BadRequest(format!("invalid duration unit in: {s}"))),
        };
        total += d;
    }

    if total.is_zero() {
        return Err(Error::BadRequest(format!("duration must be positive: {s}")));
    }
    Ok(total)
}
