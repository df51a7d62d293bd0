//! InfluxDB storage adapter
//!
//! Maps streams onto engine namespaces: one measurement `data_<id>` per
//! stream, grouped under the retention policy named after the stream's
//! retention period (`policy_<p>`, or the engine default `autogen` when the
//! period is empty). Fully qualified targets are
//! `"<db>"."<retention-policy>"."<measurement>"`.
//!
//! A preparation task pings the engine with exponential backoff, then
//! creates the configured retention policies idempotently. Submissions and
//! create notifications block until preparation completes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::notify::EventListener;
use crate::senml::Record;
use crate::types::{parse_duration, Stream, ValueType};

use super::client::{to_line_protocol, FieldValue, InfluxClient, Point, StatementResult};
use super::{per_item_pagination, Query, Storage};

/// Engine message fragment for writes partially dropped by retention
const PARTIAL_WRITE_DROPPED: &str = "partial write: points beyond retention policy dropped";

/// Engine message fragment for dropping something that is already gone
const MEASUREMENT_NOT_FOUND: &str = "measurement not found";

/// Safety margin subtracted from the retention window during migration so
/// records at the boundary survive clock skew with the engine
const MIGRATION_MARGIN: Duration = Duration::from_secs(60);

/// Retention policy name for a period, or the engine default for empty
pub fn retention_policy_name(period: &str) -> String {
    if period.is_empty() {
        "autogen".to_string()
    } else {
        format!("policy_{period}")
    }
}

/// Measurement name for a stream id
pub fn measurement_name(id: &str) -> String {
    format!("data_{id}")
}

/// Fully qualified measurement target
pub fn measurement_fq(database: &str, period: &str, measurement: &str) -> String {
    format!(
        "\"{database}\".\"{}\".\"{measurement}\"",
        retention_policy_name(period)
    )
}

/// Engine field name for a stream value type
pub fn field_for_type(t: ValueType) -> &'static str {
    match t {
        ValueType::Float => "value",
        ValueType::String => "stringValue",
        ValueType::Bool => "booleanValue",
    }
}

/// InfluxDB-backed record storage
pub struct InfluxStorage {
    client: Arc<dyn InfluxClient>,
    database: String,
    ready: watch::Receiver<bool>,
}

impl InfluxStorage {
    /// Create the adapter and spawn its preparation task. Callers gated on
    /// readiness block until the engine is reachable and all configured
    /// retention policies exist.
    pub fn new(
        client: Arc<dyn InfluxClient>,
        database: impl Into<String>,
        retention_periods: Vec<String>,
    ) -> Arc<Self> {
        let (tx, rx) = watch::channel(false);
        let storage = Arc::new(Self {
            client,
            database: database.into(),
            ready: rx,
        });
        tokio::spawn(prepare(
            storage.client.clone(),
            storage.database.clone(),
            retention_periods,
            tx,
        ));
        storage
    }

    /// The engine client, shared with the aggregation adapter
    pub(crate) fn client(&self) -> &Arc<dyn InfluxClient> {
        &self.client
    }

    /// The engine database name
    pub(crate) fn database(&self) -> &str {
        &self.database
    }

    /// Wait until the preparation task has completed
    pub(crate) async fn await_ready(&self) {
        let mut rx = self.ready.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn fq(&self, period: &str, measurement: &str) -> String {
        measurement_fq(&self.database, period, measurement)
    }

    /// Run a COUNT statement and sum the counts over all returned series
    async fn count(&self, statement: &str) -> Result<u64> {
        let results = self.client.query(statement).await?;
        Ok(sum_counts(&results))
    }

    /// Move a measurement's surviving records into a new retention policy.
    ///
    /// Four steps: stage the records newer than the new retention window
    /// into a temp measurement under the default policy, delete the
    /// measurement from all policies, move the staged records into the new
    /// policy, drop the temp measurement. Not atomic against concurrent
    /// writes; retention changes are administrative operations.
    pub(crate) async fn change_retention_policy(
        &self,
        measurement: &str,
        count_field: &str,
        old_period: &str,
        new_period: &str,
    ) -> Result<()> {
        let count = self
            .count(&format!(
                "SELECT COUNT({count_field}) FROM {} GROUP BY *",
                self.fq(old_period, measurement)
            ))
            .await?;
        if count == 0 {
            return Ok(());
        }

        let cutoff = if new_period.is_empty() {
            DateTime::<Utc>::default()
        } else {
            Utc::now() - parse_duration(new_period)? + MIGRATION_MARGIN
        };

        let temp = format!("temp_{}", Uuid::new_v4());
        let temp_fq = self.fq("", &temp);

        self.client
            .query(&format!(
                "SELECT * INTO {temp_fq} FROM {} WHERE time > '{}'",
                self.fq(old_period, measurement),
                rfc3339(cutoff)
            ))
            .await?;
        self.client
            .query(&format!("DELETE FROM \"{measurement}\""))
            .await?;
        self.client
            .query(&format!(
                "SELECT * INTO {} FROM {temp_fq}",
                self.fq(new_period, measurement)
            ))
            .await?;
        if let Err(e) = self
            .client
            .query(&format!("DROP MEASUREMENT \"{temp}\""))
            .await
        {
            if !e.to_string().contains(MEASUREMENT_NOT_FOUND) {
                return Err(e);
            }
        }
        info!(measurement, old_period, new_period, "changed retention policy");
        Ok(())
    }
}

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn sum_counts(results: &[StatementResult]) -> u64 {
    let Some(first) = results.first() else {
        return 0;
    };
    first
        .series
        .iter()
        .filter_map(|s| s.values.first())
        .filter_map(|row| row.get(1))
        .filter_map(|v| v.as_u64())
        .sum()
}

/// Ping the engine with exponential backoff, then create retention
/// policies. Failures creating a policy (other than it already existing)
/// are retried from the top.
async fn prepare(
    client: Arc<dyn InfluxClient>,
    database: String,
    retention_periods: Vec<String>,
    ready: watch::Sender<bool>,
) {
    let mut interval = Duration::from_secs(5);
    loop {
        match client.ping().await {
            Ok(version) => {
                info!(%version, "connected to storage engine");
                break;
            }
            Err(e) => {
                warn!(error = %e, retry_in = ?interval, "storage engine unreachable");
                tokio::time::sleep(interval).await;
                interval = (interval * 2).min(Duration::from_secs(60));
            }
        }
    }

    'create: loop {
        for period in &retention_periods {
            let statement = format!(
                "CREATE RETENTION POLICY \"{}\" ON \"{database}\" DURATION {period} REPLICATION 1",
                retention_policy_name(period)
            );
            match client.query(&statement).await {
                Ok(_) => info!(%period, "created retention policy"),
                Err(e) if e.to_string().contains("already exists") => {
                    debug!(%period, "retention policy already exists")
                }
                Err(e) => {
                    error!(error = %e, %period, "creating retention policy failed");
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    continue 'create;
                }
            }
        }
        break;
    }

    let _ = ready.send(true);
}

fn record_to_point(record: &Record, stream: &Stream) -> Result<Point> {
    let mut tags = BTreeMap::new();
    tags.insert("name".to_string(), record.name.clone());
    if !record.unit.is_empty() {
        tags.insert("units".to_string(), record.unit.clone());
    }

    let field = match stream.value_type {
        ValueType::Float => FieldValue::Float(record.value.ok_or_else(|| {
            Error::BadRequest(format!("record for {} has no float value", record.name))
        })?),
        ValueType::String => {
            let s = record
                .string_value
                .as_deref()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    Error::BadRequest(format!("record for {} has no string value", record.name))
                })?;
            FieldValue::String(s.to_string())
        }
        ValueType::Bool => FieldValue::Bool(record.bool_value.ok_or_else(|| {
            Error::BadRequest(format!("record for {} has no boolean value", record.name))
        })?),
    };

    // split float seconds into integer seconds and the sub-second part;
    // microseconds preserve all precision a float-encoded time carries
    let seconds = record.time.trunc();
    let micros = seconds as i64 * 1_000_000 + ((record.time - seconds) * 1e6).round() as i64;

    Ok(Point {
        measurement: measurement_name(&stream.id),
        tags,
        field: (field_for_type(stream.value_type).to_string(), field),
        timestamp_us: micros,
    })
}

fn series_to_records(series: &super::client::Series) -> Result<Vec<Record>> {
    let mut records = Vec::with_capacity(series.values.len());
    for row in &series.values {
        let mut record = Record::default();
        for (column, value) in series.columns.iter().zip(row) {
            if value.is_null() {
                continue;
            }
            match column.as_str() {
                "time" => {
                    let raw = value.as_str().ok_or_else(|| {
                        Error::Internal("engine returned a non-string time column".into())
                    })?;
                    let t = DateTime::parse_from_rfc3339(raw).map_err(|e| {
                        Error::Internal(format!("invalid time from engine: {raw}: {e}"))
                    })?;
                    record.time = t.timestamp_micros() as f64 / 1e6;
                }
                "name" => {
                    record.name = value.as_str().unwrap_or_default().to_string();
                }
                "units" => {
                    record.unit = value.as_str().unwrap_or_default().to_string();
                }
                "value" => {
                    record.value = value.as_f64();
                }
                "stringValue" => {
                    record.string_value = value.as_str().map(str::to_string);
                }
                "booleanValue" => {
                    record.bool_value = value.as_bool();
                }
                _ => {}
            }
        }
        records.push(record);
    }
    Ok(records)
}

#[async_trait]
impl Storage for InfluxStorage {
    async fn submit(
        &self,
        data: HashMap<String, Vec<Record>>,
        streams: HashMap<String, Stream>,
    ) -> Result<()> {
        self.await_ready().await;

        for (id, records) in &data {
            let stream = streams.get(id).ok_or_else(|| {
                Error::Internal(format!("submitted batch for unknown stream id {id}"))
            })?;

            let points = records
                .iter()
                .map(|r| record_to_point(r, stream))
                .collect::<Result<Vec<_>>>()?;

            let rp = retention_policy_name(&stream.retention);
            match self.client.write(&rp, to_line_protocol(&points)).await {
                Ok(()) => {}
                Err(e) if e.to_string().contains(PARTIAL_WRITE_DROPPED) => {
                    warn!(stream = %id, "{PARTIAL_WRITE_DROPPED}");
                }
                Err(e) => return Err(e),
            }
            debug!(stream = %id, points = records.len(), "submitted batch");
        }
        Ok(())
    }

    async fn query(
        &self,
        mut q: Query,
        page: usize,
        per_page: usize,
        streams: &[Stream],
    ) -> Result<(Vec<Record>, usize)> {
        let epoch = DateTime::<Utc>::default();
        if q.start < epoch {
            q.start = epoch;
            if q.end < epoch + Duration::from_secs(1) {
                return Err(Error::BadRequest(
                    "end must be after 1970-01-01T00:00:00Z".into(),
                ));
            }
        }

        let time_cond = if q.start < q.end {
            format!(
                "time > '{}' AND time < '{}'",
                rfc3339(q.start),
                rfc3339(q.end)
            )
        } else {
            format!("time > '{}'", rfc3339(q.start))
        };

        let (per_items, offsets) = per_item_pagination(q.limit, page, per_page, streams.len());

        let mut records = Vec::new();
        let mut total = 0usize;
        for (i, stream) in streams.iter().enumerate() {
            let fq = self.fq(&stream.retention, &measurement_name(&stream.id));

            let count = self
                .count(&format!(
                    "SELECT COUNT({}) FROM {fq} WHERE {time_cond}",
                    field_for_type(stream.value_type)
                ))
                .await?;
            if count == 0 {
                continue;
            }
            total += count as usize;

            // the engine treats LIMIT 0 as no limit
            if per_items[i] == 0 {
                continue;
            }

            let results = self
                .client
                .query(&format!(
                    "SELECT * FROM {fq} WHERE {time_cond} ORDER BY time {} LIMIT {} OFFSET {}",
                    q.sort.keyword(),
                    per_items[i],
                    offsets[i]
                ))
                .await?;

            let Some(result) = results.first() else {
                continue;
            };
            if result.series.len() > 1 {
                return Err(Error::Internal(
                    "unrecognized database schema for measurement".into(),
                ));
            }
            if let Some(series) = result.series.first() {
                records.extend(series_to_records(series)?);
            }
        }

        if q.limit > 0 && (q.limit as usize) < total {
            total = q.limit as usize;
        }
        Ok((records, total))
    }

    async fn get_last(&self, streams: &[Stream]) -> Result<Vec<Record>> {
        let mut records = Vec::with_capacity(streams.len());
        for stream in streams {
            let fq = self.fq(&stream.retention, &measurement_name(&stream.id));
            let results = self
                .client
                .query(&format!("SELECT * FROM {fq} ORDER BY time DESC LIMIT 1"))
                .await?;
            if let Some(series) = results.first().and_then(|r| r.series.first()) {
                records.extend(series_to_records(series)?);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl EventListener for InfluxStorage {
    fn name(&self) -> &'static str {
        "influx-storage"
    }

    async fn on_create(&self, _stream: &Stream) -> Result<()> {
        self.await_ready().await;
        Ok(())
    }

    async fn on_update(&self, old: &Stream, new: &Stream) -> Result<()> {
        self.await_ready().await;
        if old.retention != new.retention {
            self.change_retention_policy(
                &measurement_name(&old.id),
                field_for_type(old.value_type),
                &old.retention,
                &new.retention,
            )
            .await?;
        }
        Ok(())
    }

    async fn on_delete(&self, stream: &Stream) -> Result<()> {
        self.await_ready().await;
        let measurement = measurement_name(&stream.id);
        match self
            .client
            .query(&format!("DROP MEASUREMENT \"{measurement}\""))
            .await
        {
            Ok(_) => {
                info!(%measurement, "dropped measurement");
                Ok(())
            }
            Err(e) if e.to_string().contains(MEASUREMENT_NOT_FOUND) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_mapping() {
        assert_eq!(measurement_name("abc"), "data_abc");
        assert_eq!(retention_policy_name(""), "autogen");
        assert_eq!(retention_policy_name("7d"), "policy_7d");
        assert_eq!(
            measurement_fq("hds", "7d", "data_abc"),
            "\"hds\".\"policy_7d\".\"data_abc\""
        );
        assert_eq!(
            measurement_fq("hds", "", "data_abc"),
            "\"hds\".\"autogen\".\"data_abc\""
        );
    }

    #[test]
    fn test_field_for_type() {
        assert_eq!(field_for_type(ValueType::Float), "value");
        assert_eq!(field_for_type(ValueType::String), "stringValue");
        assert_eq!(field_for_type(ValueType::Bool), "booleanValue");
    }

    #[test]
    fn test_record_to_point_timestamp_microseconds() {
        let mut stream = Stream::new("s", ValueType::Float);
        stream.id = "abc".into();
        let record = Record {
            name: "s".into(),
            time: 1_500_000_000.123_456,
            value: Some(1.0),
            ..Default::default()
        };
        let point = record_to_point(&record, &stream).unwrap();
        assert_eq!(point.timestamp_us, 1_500_000_000_123_456);
        assert_eq!(point.measurement, "data_abc");
    }

    #[test]
    fn test_record_to_point_type_mismatch() {
        let stream = Stream::new("s", ValueType::Bool);
        let record = Record {
            name: "s".into(),
            time: 1.0,
            value: Some(1.0),
            ..Default::default()
        };
        assert!(record_to_point(&record, &stream).is_err());
    }

    #[test]
    fn test_series_to_records_decodes_columns() {
        let series = super::super::client::Series {
            name: "data_abc".into(),
            columns: vec![
                "time".into(),
                "booleanValue".into(),
                "name".into(),
                "stringValue".into(),
                "units".into(),
                "value".into(),
            ],
            values: vec![vec![
                serde_json::json!("2017-07-14T02:40:00Z"),
                serde_json::Value::Null,
                serde_json::json!("s1"),
                serde_json::Value::Null,
                serde_json::json!("Cel"),
                serde_json::json!(42.0),
            ]],
        };
        let records = series_to_records(&series).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "s1");
        assert_eq!(records[0].unit, "Cel");
        assert_eq!(records[0].value, Some(42.0));
        assert_eq!(records[0].time, 1_500_000_000.0);
        assert!(records[0].bool_value.is_none());
    }

    #[test]
    fn test_sum_counts_over_series() {
        let results = vec![StatementResult {
            series: vec![
                super::super::client::Series {
                    name: "m".into(),
                    columns: vec!["time".into(), "count".into()],
                    values: vec![vec![serde_json::json!(0), serde_json::json!(3)]],
                },
                super::super::client::Series {
                    name: "m".into(),
                    columns: vec!["time".into(), "count".into()],
                    values: vec![vec![serde_json::json!(0), serde_json::json!(4)]],
                },
            ],
            error: None,
        }];
        assert_eq!(sum_counts(&results), 7);
        assert_eq!(sum_counts(&[]), 0);
    }
}
