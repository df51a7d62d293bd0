//! Sensor-measurement (SenML) records
//!
//! Wire format for ingestion and query results: a pack (JSON array) of
//! records, each with a name, optional unit, a time in float seconds since
//! the epoch and exactly one of `v`/`vs`/`vb`. Base fields (`bn`, `bt`,
//! `bu`) are resolved into each record by [`Pack::normalize`].

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Times smaller than this (in absolute value) are relative to "now",
/// per the SenML rules for resolving record time.
const RELATIVE_TIME_CUTOFF: f64 = 268_435_456.0; // 2^28

/// One sensor-measurement record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Base name, prepended to `name` during normalization
    #[serde(rename = "bn", default, skip_serializing_if = "String::is_empty")]
    pub base_name: String,

    /// Base time, added to `time` during normalization
    #[serde(rename = "bt", default, skip_serializing_if = "is_zero")]
    pub base_time: f64,

    /// Base unit, used when `unit` is empty
    #[serde(rename = "bu", default, skip_serializing_if = "String::is_empty")]
    pub base_unit: String,

    /// Record name; resolves to a registered stream name
    #[serde(rename = "n", default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Unit of measurement
    #[serde(rename = "u", default, skip_serializing_if = "String::is_empty")]
    pub unit: String,

    /// Seconds since the epoch, sub-second precision allowed
    #[serde(rename = "t", default)]
    pub time: f64,

    /// Float value
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,

    /// String value
    #[serde(rename = "vs", default, skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,

    /// Boolean value
    #[serde(rename = "vb", default, skip_serializing_if = "Option::is_none")]
    pub bool_value: Option<bool>,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

impl Record {
    /// Count of populated value fields; valid records have at most one.
    /// An empty `vs` counts as absent, matching how typed streams treat it.
    fn value_field_count(&self) -> usize {
        let mut n = 0;
        if self.value.is_some() {
            n += 1;
        }
        if self.string_value.as_deref().is_some_and(|s| !s.is_empty()) {
            n += 1;
        }
        if self.bool_value.is_some() {
            n += 1;
        }
        n
    }
}

/// A pack of sensor-measurement records, as decoded from a request or
/// broker message payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pack(pub Vec<Record>);

impl Pack {
    /// Decode a JSON pack
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| Error::BadRequest(format!("error parsing senml pack: {e}")))
    }

    /// Resolve base name, time and unit into each record and clear the
    /// base fields. Relative times resolve against the current clock.
    /// Records must have a name and at most one value field after
    /// resolution; violations fail the whole pack.
    pub fn normalize(&self) -> Result<Vec<Record>> {
        let now = Utc::now().timestamp_millis() as f64 / 1e3;

        let mut base_name = String::new();
        let mut base_time = 0.0;
        let mut base_unit = String::new();

        let mut out = Vec::with_capacity(self.0.len());
        for r in &self.0 {
            if !r.base_name.is_empty() {
                base_name = r.base_name.clone();
            }
            if r.base_time != 0.0 {
                base_time = r.base_time;
            }
            if !r.base_unit.is_empty() {
                base_unit = r.base_unit.clone();
            }

            let mut resolved = r.clone();
            resolved.base_name = String::new();
            resolved.base_time = 0.0;
            resolved.base_unit = String::new();

            resolved.name = format!("{}{}", base_name, r.name);
            if resolved.name.is_empty() {
                return Err(Error::BadRequest("record has no name".into()));
            }

            resolved.time = base_time + r.time;
            if resolved.time.abs() < RELATIVE_TIME_CUTOFF {
                resolved.time += now;
            }

            if resolved.unit.is_empty() {
                resolved.unit = base_unit.clone();
            }

            if resolved.value_field_count() > 1 {
                return Err(Error::BadRequest(format!(
                    "record {} has more than one value field",
                    resolved.name
                )));
            }

            out.push(resolved);
        }
        Ok(out)
    }
}
