//! Data API: storage trait, queries and ingestion
//!
//! The storage backend persists sensor-measurement records per stream and
//! participates in the registry notification loop (retention migration,
//! measurement cleanup). Queries spanning several streams share one global
//! `(page, per_page, limit)` window, split per stream by
//! [`per_item_pagination`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::notify::EventListener;
use crate::senml::Record;
use crate::types::Stream;

pub mod client;
pub mod influx;
pub mod ingest;
pub mod mqtt;

pub use client::{HttpInfluxClient, InfluxClient};
pub use influx::InfluxStorage;
pub use ingest::Ingester;
pub use mqtt::MqttConnector;

/// The only content type accepted for ingestion
pub const SENML_CONTENT_TYPE: &str = "application/senml+json";

/// Sort order for query results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sort {
    /// Oldest first
    Asc,
    /// Newest first (the default)
    #[default]
    Desc,
}

impl Sort {
    /// The keyword used in engine queries
    pub fn keyword(&self) -> &'static str {
        match self {
            Sort::Asc => "ASC",
            Sort::Desc => "DESC",
        }
    }

    /// Parse the query-string form; anything but "asc" is descending
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("asc") {
            Sort::Asc
        } else {
            Sort::Desc
        }
    }
}

/// A data query over one or more streams
#[derive(Debug, Clone)]
pub struct Query {
    /// Start of the time range; clamped to the epoch
    pub start: DateTime<Utc>,
    /// End of the time range; an end not after start makes the query
    /// open-ended
    pub end: DateTime<Utc>,
    /// Sort order by time
    pub sort: Sort,
    /// Cap on the total number of returned records; negative means
    /// unbounded
    pub limit: i64,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            start: DateTime::<Utc>::default(),
            end: DateTime::<Utc>::default(),
            sort: Sort::Desc,
            limit: -1,
        }
    }
}

/// Storage backend for sensor-measurement records
///
/// Backends also subscribe to the registry notification bus, reconciling
/// engine-level state (retention policies, measurements) with stream
/// lifecycle.
#[async_trait]
pub trait Storage: EventListener {
    /// Write a batch of records, keyed by stream id, with a parallel map
    /// of stream snapshots providing schema and retention
    async fn submit(
        &self,
        data: HashMap<String, Vec<Record>>,
        streams: HashMap<String, Stream>,
    ) -> Result<()>;

    /// Query records for the given streams under one global pagination
    /// window. Returns the combined record list and the total count
    /// (capped by `q.limit` when set).
    async fn query(
        &self,
        q: Query,
        page: usize,
        per_page: usize,
        streams: &[Stream],
    ) -> Result<(Vec<Record>, usize)>;

    /// Latest record of each stream that has data
    async fn get_last(&self, streams: &[Stream]) -> Result<Vec<Record>>;
}

/// Record set envelope returned by the query API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSet {
    /// URL of this record set
    pub url: String,
    /// The records
    pub data: Vec<Record>,
    /// Query execution time in milliseconds
    pub time: f64,
    /// Current page
    pub page: usize,
    /// Results per page
    #[serde(rename = "per_page")]
    pub per_page: usize,
    /// Total records matching the query
    pub total: usize,
}

/// Split a global `(page, per_page)` window and `limit` across `n` streams
///
/// Returns `(per_items, offsets)`: stream `i` contributes up to
/// `per_items[i]` records starting at `offsets[i]`. The per-page window and
/// the limit are divided evenly in caller order with the remainder going to
/// the leading streams, so the concatenation over streams forms a stable
/// global sequence. A negative `limit` means unbounded.
///
/// Offsets are derived from each stream's per-page share, so page
/// boundaries are only stable for a fixed `per_page`: callers must keep
/// `per_page` constant while paging through one result set.
pub fn per_item_pagination(
    limit: i64,
    page: usize,
    per_page: usize,
    n: usize,
) -> (Vec<usize>, Vec<usize>) {
    let mut per_items = vec![0usize; n];
    let mut offsets = vec![0usize; n];
    if n == 0 {
        return (per_items, offsets);
    }

    for i in 0..n {
        per_items[i] = per_page / n + usize::from(i < per_page % n);
        offsets[i] = (page - 1) * per_items[i];
    }

    if limit >= 0 {
        let limit = limit as usize;
        for i in 0..n {
            let budget = limit / n + usize::from(i < limit % n);
            let remaining = budget.saturating_sub(offsets[i]);
            per_items[i] = per_items[i].min(remaining);
        }
    }

    (per_items, offsets)
}
