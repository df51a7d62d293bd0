//! Stream registry
//!
//! Authoritative store of stream records: schema (value type), retention
//! and ingestion source. Every mutation fans out through the notification
//! bus before it is considered complete; a vetoing subscriber rolls the
//! mutation back.
//!
//! Two backends share the trait: a volatile in-memory store and a durable
//! LMDB store.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::{parse_duration, Stream};

mod lmdb;
mod memory;

pub use lmdb::LmdbRegistry;
pub use memory::MemoryRegistry;

/// Maximum number of results returned per page
pub const MAX_PER_PAGE: usize = 100;

/// Registry operations
///
/// Paging is 1-based; results of `get_many` and `filter` are ordered by
/// stream id for deterministic traversal.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Create a stream. Assigns an id when empty, sets timestamps,
    /// enforces name uniqueness and retention validity. The created event
    /// is acknowledged by every subscriber before this returns.
    async fn create(&self, stream: Stream) -> Result<Stream>;

    /// Get a stream by id
    async fn get(&self, id: &str) -> Result<Stream>;

    /// Get a stream by its unique name
    async fn get_by_name(&self, name: &str) -> Result<Stream>;

    /// Update the mutable fields of a stream. Attempts to change `id`,
    /// `name` or `type` are rejected.
    async fn update(&self, id: &str, stream: Stream) -> Result<Stream>;

    /// Delete a stream. The deleted event is fanned out before the record
    /// is removed; a vetoing subscriber aborts the delete.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Page through all streams ordered by id. Returns the page and the
    /// total number of streams.
    async fn get_many(&self, page: usize, per_page: usize) -> Result<(Vec<Stream>, usize)>;

    /// Page through streams whose record matches `value` at the dot-path
    /// `path` under `op`. Records without the path are skipped.
    async fn filter(
        &self,
        path: &str,
        op: FilterOp,
        value: &str,
        page: usize,
        per_page: usize,
    ) -> Result<(Vec<Stream>, usize)>;
}

/// Matching operator for registry filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    /// Exact string equality
    Equals,
    /// Value starts with the operand
    Prefix,
    /// Value ends with the operand
    Suffix,
    /// Value contains the operand
    Contains,
}

impl FilterOp {
    /// Parse the path-segment form used by the filter API
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "equals" => Ok(FilterOp::Equals),
            "prefix" => Ok(FilterOp::Prefix),
            "suffix" => Ok(FilterOp::Suffix),
            "contains" => Ok(FilterOp::Contains),
            other => Err(Error::BadRequest(format!("unknown filter operator: {other}"))),
        }
    }

    fn matches(&self, field: &str, value: &str) -> bool {
        match self {
            FilterOp::Equals => field == value,
            FilterOp::Prefix => field.starts_with(value),
            FilterOp::Suffix => field.ends_with(value),
            FilterOp::Contains => field.contains(value),
        }
    }
}

/// Validate paging bounds shared by both backends
pub fn check_paging(page: usize, per_page: usize) -> Result<()> {
    if page < 1 {
        return Err(Error::BadRequest("page must be >= 1".into()));
    }
    if per_page < 1 || per_page > MAX_PER_PAGE {
        return Err(Error::BadRequest(format!(
            "per_page must be between 1 and {MAX_PER_PAGE}"
        )));
    }
    Ok(())
}

/// Slice one page out of an ordered result set
pub(crate) fn paginate<T: Clone>(items: &[T], page: usize, per_page: usize) -> Vec<T> {
    let start = (page - 1) * per_page;
    if start >= items.len() {
        return Vec::new();
    }
    let end = (start + per_page).min(items.len());
    items[start..end].to_vec()
}

/// Validate the user-settable fields of a stream before persisting
pub(crate) fn validate_stream(stream: &Stream, retention_periods: &[String]) -> Result<()> {
    if stream.name.is_empty() {
        return Err(Error::BadRequest("stream name must not be empty".into()));
    }
    if !stream.retention.is_empty() {
        parse_duration(&stream.retention)?;
        if !retention_periods.iter().any(|p| p == &stream.retention) {
            return Err(Error::BadRequest(format!(
                "retention {} is not among the configured periods [{}]",
                stream.retention,
                retention_periods.join(", ")
            )));
        }
    }
    if let Some(mqtt) = stream.source.mqtt() {
        if mqtt.url.is_empty() || mqtt.topic.is_empty() {
            return Err(Error::BadRequest(
                "mqtt source requires both url and topic".into(),
            ));
        }
        if mqtt.qos > 2 {
            return Err(Error::BadRequest("mqtt qos must be 0, 1 or 2".into()));
        }
    }
    Ok(())
}

/// Merge an update request into the stored record, rejecting changes to
/// the immutable fields. Returns the new record with `updated` untouched;
/// the backend stamps it.
pub(crate) fn merge_update(existing: &Stream, incoming: Stream) -> Result<Stream> {
    if !incoming.id.is_empty() && incoming.id != existing.id {
        return Err(Error::BadRequest("stream id cannot be changed".into()));
    }
    if !incoming.name.is_empty() && incoming.name != existing.name {
        return Err(Error::BadRequest("stream name cannot be changed".into()));
    }
    if incoming.value_type != existing.value_type {
        return Err(Error::BadRequest("stream type cannot be changed".into()));
    }

    let mut merged = existing.clone();
    merged.unit = incoming.unit;
    merged.retention = incoming.retention;
    merged.source = incoming.source;
    merged.meta = incoming.meta;
    Ok(merged)
}

/// Evaluate a dot-path filter against a JSON document. Missing paths and
/// non-scalar values never match.
pub(crate) fn value_matches(json: &Value, path: &str, op: FilterOp, value: &str) -> bool {
    let mut cursor = json;
    for segment in path.split('.') {
        match cursor.get(segment) {
            Some(next) => cursor = next,
            None => return false,
        }
    }
    let field = match cursor {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return false,
    };
    op.matches(&field, value)
}

/// Evaluate a dot-path filter against the JSON projection of a stream
pub(crate) fn stream_matches(stream: &Stream, path: &str, op: FilterOp, value: &str) -> bool {
    let Ok(json) = serde_json::to_value(stream) else {
        return false;
    };
    value_matches(&json, path, op, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MqttSource, SourceConfig, ValueType};

    fn stream() -> Stream {
        let mut s = Stream::new("home/temp", ValueType::Float);
        s.id = "a1".into();
        s.meta.insert("building".into(), serde_json::json!("west"));
        s
    }

    #[test]
    fn test_filter_op_parse() {
        assert_eq!(FilterOp::parse("equals").unwrap(), FilterOp::Equals);
        assert_eq!(FilterOp::parse("prefix").unwrap(), FilterOp::Prefix);
        assert!(FilterOp::parse("regex").is_err());
    }

    #[test]
    fn test_stream_matches_dot_path() {
        let s = stream();
        assert!(stream_matches(&s, "name", FilterOp::Equals, "home/temp"));
        assert!(stream_matches(&s, "name", FilterOp::Prefix, "home/"));
        assert!(stream_matches(&s, "name", FilterOp::Suffix, "temp"));
        assert!(stream_matches(&s, "type", FilterOp::Equals, "float"));
        assert!(stream_matches(&s, "meta.building", FilterOp::Contains, "es"));
        // missing path is skipped, not an error
        assert!(!stream_matches(&s, "meta.floor", FilterOp::Equals, "1"));
        // non-scalar value is skipped
        assert!(!stream_matches(&s, "meta", FilterOp::Equals, "west"));
    }

    #[test]
    fn test_validate_retention_against_periods() {
        let periods = vec!["1h".to_string(), "7d".to_string()];
        let mut s = stream();
        validate_stream(&s, &periods).unwrap();

        s.retention = "7d".into();
        validate_stream(&s, &periods).unwrap();

        s.retention = "3d".into();
        assert!(validate_stream(&s, &periods).is_err());

        s.retention = "bogus".into();
        assert!(validate_stream(&s, &periods).is_err());
    }

    #[test]
    fn test_validate_mqtt_source() {
        let mut s = stream();
        s.source = SourceConfig::Mqtt(MqttSource {
            url: String::new(),
            topic: "t".into(),
            qos: 0,
            username: None,
            password: None,
        });
        assert!(validate_stream(&s, &[]).is_err());

        s.source = SourceConfig::Mqtt(MqttSource {
            url: "tcp://b:1883".into(),
            topic: "t".into(),
            qos: 3,
            username: None,
            password: None,
        });
        assert!(validate_stream(&s, &[]).is_err());
    }

    #[test]
    fn test_merge_update_protects_immutable_fields() {
        let existing = stream();

        let mut incoming = existing.clone();
        incoming.retention = String::new();
        incoming.unit = Some("Cel".into());
        let merged = merge_update(&existing, incoming).unwrap();
        assert_eq!(merged.unit.as_deref(), Some("Cel"));
        assert_eq!(merged.id, existing.id);

        let mut incoming = existing.clone();
        incoming.name = "other".into();
        assert!(merge_update(&existing, incoming).is_err());

        let mut incoming = existing.clone();
        incoming.value_type = ValueType::Bool;
        assert!(merge_update(&existing, incoming).is_err());

        let mut incoming = existing.clone();
        incoming.id = "zz".into();
        assert!(merge_update(&existing, incoming).is_err());
    }

    #[test]
    fn test_check_paging_bounds() {
        assert!(check_paging(1, 1).is_ok());
        assert!(check_paging(1, MAX_PER_PAGE).is_ok());
        assert!(check_paging(0, 10).is_err());
        assert!(check_paging(1, 0).is_err());
        assert!(check_paging(1, MAX_PER_PAGE + 1).is_err());
    }

    #[test]
    fn test_paginate_slices() {
        let items: Vec<u32> = (0..10).collect();
        assert_eq!(paginate(&items, 1, 4), vec![0, 1, 2, 3]);
        assert_eq!(paginate(&items, 3, 4), vec![8, 9]);
        assert!(paginate(&items, 4, 4).is_empty());
    }
}
