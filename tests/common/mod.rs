//! Shared test doubles: a semantic in-memory InfluxDB engine and a
//! scripted broker client.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use hds::data::client::{InfluxClient, Series, StatementResult};
use hds::data::mqtt::{BrokerClient, BrokerConnection, BrokerEvent, ConnectOptions};
use hds::data::{Query, Storage};
use hds::error::{Error, Result};
use hds::notify::EventListener;
use hds::registry::{FilterOp, MemoryRegistry, Registry};
use hds::senml::Record;
use hds::types::Stream;

// ============================================================================
// Fake InfluxDB engine
// ============================================================================

/// One stored point: a single field plus tags at a microsecond timestamp
#[derive(Debug, Clone)]
pub struct StoredPoint {
    pub time_us: i64,
    pub tags: BTreeMap<String, String>,
    pub field: (String, serde_json::Value),
}

#[derive(Debug, Default)]
pub struct EngineState {
    /// (retention policy, measurement) -> points
    pub data: HashMap<(String, String), Vec<StoredPoint>>,
    pub retention_policies: Vec<String>,
    pub continuous_queries: Vec<String>,
    pub statements: Vec<String>,
}

/// In-memory engine understanding the statement shapes the adapters issue
#[derive(Default)]
pub struct FakeInflux {
    pub state: Mutex<EngineState>,
    pub unreachable: AtomicBool,
    /// When set, every write fails with this message instead of storing
    pub write_error: Mutex<Option<String>>,
}

impl FakeInflux {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn points(&self, rp: &str, measurement: &str) -> Vec<StoredPoint> {
        self.state
            .lock()
            .data
            .get(&(rp.to_string(), measurement.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_points(&self, measurement: &str) -> usize {
        self.state
            .lock()
            .data
            .iter()
            .filter(|((_, m), _)| m == measurement)
            .map(|(_, points)| points.len())
            .sum()
    }

    fn matching(
        state: &EngineState,
        rp: &str,
        measurement: &str,
        cond: &TimeCond,
    ) -> Vec<StoredPoint> {
        state
            .data
            .get(&(rp.to_string(), measurement.to_string()))
            .map(|points| {
                points
                    .iter()
                    .filter(|p| cond.matches(p.time_us))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Parsed `time > 'x' [AND time < 'y']` condition
#[derive(Debug, Default, Clone, Copy)]
struct TimeCond {
    after_us: Option<i64>,
    before_us: Option<i64>,
}

impl TimeCond {
    fn matches(&self, time_us: i64) -> bool {
        if let Some(after) = self.after_us {
            if time_us <= after {
                return false;
            }
        }
        if let Some(before) = self.before_us {
            if time_us >= before {
                return false;
            }
        }
        true
    }
}

fn parse_rfc3339_us(raw: &str) -> i64 {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.timestamp_micros())
        .unwrap_or_default()
}

fn parse_time_cond(statement: &str) -> TimeCond {
    let mut cond = TimeCond::default();
    if let Some(idx) = statement.find("time > '") {
        let rest = &statement[idx + 8..];
        if let Some(end) = rest.find('\'') {
            cond.after_us = Some(parse_rfc3339_us(&rest[..end]));
        }
    }
    if let Some(idx) = statement.find("time < '") {
        let rest = &statement[idx + 8..];
        if let Some(end) = rest.find('\'') {
            cond.before_us = Some(parse_rfc3339_us(&rest[..end]));
        }
    }
    cond
}

/// Quoted segments of a statement, in order of appearance
fn quoted(statement: &str) -> Vec<String> {
    statement
        .split('"')
        .enumerate()
        .filter(|(i, _)| i % 2 == 1)
        .map(|(_, s)| s.to_string())
        .collect()
}

/// Parse a `"db"."rp"."measurement"` target into (rp, measurement)
fn parse_fq(fq: &str) -> (String, String) {
    let parts = quoted(fq);
    (parts[1].clone(), parts[2].clone())
}

/// Everything between `FROM ` and the next clause keyword
fn from_clause(statement: &str) -> &str {
    let idx = statement.find("FROM ").map(|i| i + 5).unwrap_or(0);
    let rest = &statement[idx..];
    let end = ["WHERE", "ORDER", "GROUP", "LIMIT"]
        .iter()
        .filter_map(|kw| rest.find(kw))
        .min()
        .unwrap_or(rest.len());
    rest[..end].trim()
}

fn number_after<'a>(statement: &'a str, keyword: &str) -> Option<i64> {
    let idx = statement.find(keyword)? + keyword.len();
    statement[idx..]
        .trim_start()
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

fn row_columns() -> Vec<String> {
    ["time", "booleanValue", "name", "stringValue", "units", "value"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn point_to_row(p: &StoredPoint) -> Vec<serde_json::Value> {
    let time = Utc
        .timestamp_micros(p.time_us)
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Micros, true);
    let mut row = vec![serde_json::Value::Null; 6];
    row[0] = serde_json::json!(time);
    if let Some(name) = p.tags.get("name") {
        row[2] = serde_json::json!(name);
    }
    if let Some(units) = p.tags.get("units") {
        row[4] = serde_json::json!(units);
    }
    let (field, value) = &p.field;
    match field.as_str() {
        "booleanValue" => row[1] = value.clone(),
        "stringValue" => row[3] = value.clone(),
        "value" => row[5] = value.clone(),
        _ => {}
    }
    row
}

fn unescape_line(part: &str) -> String {
    part.replace("\\ ", " ").replace("\\,", ",").replace("\\=", "=")
}

fn parse_line(line: &str) -> Option<StoredPoint> {
    // timestamp after the last space, field before it, series head first
    let (head, timestamp) = line.rsplit_once(' ')?;
    let (series, field_part) = head.split_once(' ')?;

    let mut series_parts = series.split(',');
    let _measurement = series_parts.next()?;
    let mut tags = BTreeMap::new();
    for tag in series_parts {
        let (k, v) = tag.split_once('=')?;
        tags.insert(unescape_line(k), unescape_line(v));
    }

    let (field_name, raw) = field_part.split_once('=')?;
    let value = if let Some(stripped) = raw.strip_prefix('"') {
        let inner = stripped.strip_suffix('"')?;
        serde_json::json!(inner.replace("\\\"", "\"").replace("\\\\", "\\"))
    } else if raw == "true" || raw == "false" {
        serde_json::json!(raw == "true")
    } else {
        serde_json::json!(raw.parse::<f64>().ok()?)
    };

    Some(StoredPoint {
        time_us: timestamp.parse().ok()?,
        tags,
        field: (field_name.to_string(), value),
    })
}

fn line_measurement(line: &str) -> String {
    let head = line.split(' ').next().unwrap_or_default();
    unescape_line(head.split(',').next().unwrap_or_default())
}

fn empty_result() -> Vec<StatementResult> {
    vec![StatementResult::default()]
}

#[async_trait]
impl InfluxClient for FakeInflux {
    async fn ping(&self) -> Result<String> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("engine down".into()));
        }
        Ok("fake".to_string())
    }

    async fn write(&self, retention_policy: &str, lines: String) -> Result<()> {
        if let Some(message) = self.write_error.lock().clone() {
            return Err(Error::Internal(message));
        }
        let mut state = self.state.lock();
        for line in lines.lines() {
            let measurement = line_measurement(line);
            let point = parse_line(line)
                .ok_or_else(|| Error::Internal(format!("unparseable line: {line}")))?;
            state
                .data
                .entry((retention_policy.to_string(), measurement))
                .or_default()
                .push(point);
        }
        Ok(())
    }

    async fn query(&self, statement: &str) -> Result<Vec<StatementResult>> {
        let mut state = self.state.lock();
        state.statements.push(statement.to_string());

        if statement.starts_with("CREATE RETENTION POLICY") {
            let name = quoted(statement)[0].clone();
            if state.retention_policies.contains(&name) {
                return Err(Error::Internal("retention policy already exists".into()));
            }
            state.retention_policies.push(name);
            return Ok(empty_result());
        }

        if statement.starts_with("CREATE CONTINUOUS QUERY") {
            let name = quoted(statement)[0].clone();
            state.continuous_queries.push(name);
            return Ok(empty_result());
        }

        if statement.starts_with("DROP CONTINUOUS QUERY") {
            let name = quoted(statement)[0].clone();
            let before = state.continuous_queries.len();
            state.continuous_queries.retain(|cq| cq != &name);
            if state.continuous_queries.len() == before {
                return Err(Error::Internal("continuous query not found".into()));
            }
            return Ok(empty_result());
        }

        if statement.starts_with("DROP MEASUREMENT") {
            let measurement = quoted(statement)[0].clone();
            let before = state.data.len();
            state.data.retain(|(_, m), _| m != &measurement);
            if state.data.len() == before {
                return Err(Error::Internal("measurement not found".into()));
            }
            return Ok(empty_result());
        }

        if statement.starts_with("DELETE FROM") {
            let measurement = quoted(statement)[0].clone();
            state.data.retain(|(_, m), _| m != &measurement);
            return Ok(empty_result());
        }

        if statement.starts_with("SELECT COUNT(") {
            let (rp, measurement) = parse_fq(from_clause(statement));
            let cond = parse_time_cond(statement);
            let count = FakeInflux::matching(&state, &rp, &measurement, &cond).len();
            if count == 0 {
                return Ok(empty_result());
            }
            return Ok(vec![StatementResult {
                series: vec![Series {
                    name: measurement,
                    columns: vec!["time".into(), "count".into()],
                    values: vec![vec![
                        serde_json::json!("1970-01-01T00:00:00Z"),
                        serde_json::json!(count),
                    ]],
                }],
                error: None,
            }]);
        }

        if statement.starts_with("SELECT * INTO") {
            let into_clause = &statement["SELECT * INTO".len()..];
            let fq_end = into_clause.find(" FROM ").unwrap_or(into_clause.len());
            let (dest_rp, dest_m) = parse_fq(&into_clause[..fq_end]);
            let (src_rp, src_m) = parse_fq(from_clause(statement));
            let cond = parse_time_cond(statement);
            let moved = FakeInflux::matching(&state, &src_rp, &src_m, &cond);
            state
                .data
                .entry((dest_rp, dest_m))
                .or_default()
                .extend(moved);
            return Ok(empty_result());
        }

        if statement.starts_with("SELECT *") {
            let (rp, measurement) = parse_fq(from_clause(statement));
            let cond = parse_time_cond(statement);
            let mut points = FakeInflux::matching(&state, &rp, &measurement, &cond);
            if statement.contains("ORDER BY time ASC") {
                points.sort_by_key(|p| p.time_us);
            } else {
                points.sort_by_key(|p| std::cmp::Reverse(p.time_us));
            }
            let offset = number_after(statement, "OFFSET").unwrap_or(0).max(0) as usize;
            let limit = number_after(statement, "LIMIT").unwrap_or(i64::MAX).max(0) as usize;
            let page: Vec<_> = points.into_iter().skip(offset).take(limit).collect();
            if page.is_empty() {
                return Ok(empty_result());
            }
            return Ok(vec![StatementResult {
                series: vec![Series {
                    name: measurement,
                    columns: row_columns(),
                    values: page.iter().map(point_to_row).collect(),
                }],
                error: None,
            }]);
        }

        Err(Error::Internal(format!("fake engine: unsupported statement: {statement}")))
    }
}

// ============================================================================
// Storage double recording submissions
// ============================================================================

#[derive(Default)]
pub struct RecordingStorage {
    pub submissions: Mutex<Vec<(HashMap<String, Vec<Record>>, HashMap<String, Stream>)>>,
}

impl RecordingStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn submitted_records(&self) -> usize {
        self.submissions
            .lock()
            .iter()
            .map(|(data, _)| data.values().map(Vec::len).sum::<usize>())
            .sum()
    }
}

#[async_trait]
impl EventListener for RecordingStorage {
    fn name(&self) -> &'static str {
        "recording-storage"
    }
    async fn on_create(&self, _s: &Stream) -> Result<()> {
        Ok(())
    }
    async fn on_update(&self, _o: &Stream, _n: &Stream) -> Result<()> {
        Ok(())
    }
    async fn on_delete(&self, _s: &Stream) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Storage for RecordingStorage {
    async fn submit(
        &self,
        data: HashMap<String, Vec<Record>>,
        streams: HashMap<String, Stream>,
    ) -> Result<()> {
        self.submissions.lock().push((data, streams));
        Ok(())
    }
    async fn query(
        &self,
        _q: Query,
        _page: usize,
        _per_page: usize,
        _streams: &[Stream],
    ) -> Result<(Vec<Record>, usize)> {
        Ok((Vec::new(), 0))
    }
    async fn get_last(&self, _streams: &[Stream]) -> Result<Vec<Record>> {
        Ok(Vec::new())
    }
}

// ============================================================================
// Scripted broker client
// ============================================================================

#[derive(Default)]
pub struct MockConnectionState {
    pub broker_url: String,
    pub topics: Mutex<HashMap<String, u8>>,
    pub subscribe_calls: AtomicUsize,
    pub unsubscribe_calls: AtomicUsize,
    pub disconnected: AtomicBool,
}

pub struct MockConnection {
    pub state: Arc<MockConnectionState>,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn subscribe(&self, topic: &str, qos: u8) -> Result<()> {
        self.state.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.state.topics.lock().insert(topic.to_string(), qos);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.state.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.state.topics.lock().remove(topic);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Broker factory whose reachability tests can flip at runtime. Captures
/// every connection and the connector's event channel so tests can inject
/// inbound messages.
#[derive(Default)]
pub struct MockBroker {
    pub reachable: AtomicBool,
    pub connections: Mutex<Vec<Arc<MockConnectionState>>>,
    pub events: Mutex<Option<mpsc::Sender<BrokerEvent>>>,
}

impl MockBroker {
    pub fn new(reachable: bool) -> Arc<Self> {
        let broker = Arc::new(Self::default());
        broker.reachable.store(reachable, Ordering::SeqCst);
        broker
    }

    pub fn live_connections(&self) -> Vec<Arc<MockConnectionState>> {
        self.connections
            .lock()
            .iter()
            .filter(|c| !c.disconnected.load(Ordering::SeqCst))
            .cloned()
            .collect()
    }

    pub async fn inject(&self, broker_url: &str, topic: &str, payload: &[u8]) {
        let sender = self.events.lock().clone().expect("no connection made yet");
        sender
            .send(BrokerEvent::Message {
                broker_url: broker_url.to_string(),
                topic: topic.to_string(),
                payload: payload.to_vec(),
            })
            .await
            .expect("connector event channel closed");
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn connect(
        &self,
        opts: ConnectOptions,
        events: mpsc::Sender<BrokerEvent>,
    ) -> Result<Box<dyn BrokerConnection>> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(Error::Unavailable(format!(
                "broker {} unreachable",
                opts.broker_url
            )));
        }
        let state = Arc::new(MockConnectionState {
            broker_url: opts.broker_url.clone(),
            ..Default::default()
        });
        self.connections.lock().push(state.clone());
        *self.events.lock() = Some(events);
        Ok(Box::new(MockConnection { state }))
    }
}

// ============================================================================
// Registry wrapper counting lookups
// ============================================================================

pub struct CountingRegistry {
    pub inner: Arc<MemoryRegistry>,
    pub name_lookups: AtomicUsize,
}

impl CountingRegistry {
    pub fn new(inner: Arc<MemoryRegistry>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            name_lookups: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Registry for CountingRegistry {
    async fn create(&self, stream: Stream) -> Result<Stream> {
        self.inner.create(stream).await
    }
    async fn get(&self, id: &str) -> Result<Stream> {
        self.inner.get(id).await
    }
    async fn get_by_name(&self, name: &str) -> Result<Stream> {
        self.name_lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.get_by_name(name).await
    }
    async fn update(&self, id: &str, stream: Stream) -> Result<Stream> {
        self.inner.update(id, stream).await
    }
    async fn delete(&self, id: &str) -> Result<()> {
        self.inner.delete(id).await
    }
    async fn get_many(&self, page: usize, per_page: usize) -> Result<(Vec<Stream>, usize)> {
        self.inner.get_many(page, per_page).await
    }
    async fn filter(
        &self,
        path: &str,
        op: FilterOp,
        value: &str,
        page: usize,
        per_page: usize,
    ) -> Result<(Vec<Stream>, usize)> {
        self.inner.filter(path, op, value, page, per_page).await
    }
}
