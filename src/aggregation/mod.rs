//! Aggregation adapter
//!
//! Maintains pre-computed aggregate measurements beside the raw data, one
//! per (aggregation, stream) pair, materialized as engine continuous
//! queries over float streams. The adapter subscribes to the registry
//! notification bus with the same readiness and veto semantics as the
//! storage adapter; aggregate computation itself happens inside the
//! engine.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::AggregationConfig;
use crate::data::influx::{measurement_fq, measurement_name as data_measurement_name};
use crate::data::InfluxStorage;
use crate::error::{Error, Result};
use crate::notify::EventListener;
use crate::registry::{check_paging, FilterOp};
use crate::types::{Stream, ValueType};

const CQ_NOT_FOUND: &str = "continuous query not found";
const MEASUREMENT_NOT_FOUND: &str = "measurement not found";

/// One aggregation applied to every float stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregation {
    /// Deterministic identifier derived from interval and aggregates
    pub id: String,
    /// Aggregation interval, a duration string
    pub interval: String,
    /// Aggregate functions computed per interval
    pub aggregates: Vec<String>,
    /// Retention period of the aggregated measurement
    pub retention: String,
}

impl Aggregation {
    /// Build an aggregation from configuration; the id is a v5 UUID over
    /// the sorted content so equal definitions share an identity
    pub fn from_config(conf: &AggregationConfig) -> Self {
        let mut aggregates = conf.aggregates.clone();
        aggregates.sort();
        let material = format!("{}/{}", conf.interval, aggregates.join(","));
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, material.as_bytes()).to_string();
        Self {
            id,
            interval: conf.interval.clone(),
            aggregates,
            retention: conf.retention.clone(),
        }
    }
}

/// Measurement name for an (aggregation, stream) pair
pub fn measurement_name(aggregation_id: &str, stream_id: &str) -> String {
    format!("aggr_{aggregation_id}_{stream_id}")
}

fn cq_name(aggregation_id: &str, stream_id: &str) -> String {
    format!("cq_{}", measurement_name(aggregation_id, stream_id))
}

fn paginate(items: Vec<Aggregation>, page: usize, per_page: usize) -> (Vec<Aggregation>, usize) {
    let total = items.len();
    let start = (page - 1) * per_page;
    if start >= total {
        return (Vec::new(), total);
    }
    let end = (start + per_page).min(total);
    (items[start..end].to_vec(), total)
}

/// InfluxDB-backed aggregation adapter
pub struct InfluxAggr {
    storage: Arc<InfluxStorage>,
    aggregations: Vec<Aggregation>,
}

impl InfluxAggr {
    /// Create the adapter over the same engine the storage adapter uses
    pub fn new(storage: Arc<InfluxStorage>, configs: &[AggregationConfig]) -> Arc<Self> {
        let aggregations = configs.iter().map(Aggregation::from_config).collect();
        Arc::new(Self { storage, aggregations })
    }

    /// Page through the configured aggregations
    pub fn index(&self, page: usize, per_page: usize) -> Result<(Vec<Aggregation>, usize)> {
        check_paging(page, per_page)?;
        Ok(paginate(self.aggregations.clone(), page, per_page))
    }

    /// Page through aggregations matching a dot-path filter
    pub fn filter(
        &self,
        path: &str,
        op: FilterOp,
        value: &str,
        page: usize,
        per_page: usize,
    ) -> Result<(Vec<Aggregation>, usize)> {
        check_paging(page, per_page)?;
        let matched: Vec<Aggregation> = self
            .aggregations
            .iter()
            .filter(|a| {
                serde_json::to_value(a)
                    .map(|json| crate::registry::value_matches(&json, path, op, value))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        Ok(paginate(matched, page, per_page))
    }

    /// Look up one aggregation by id
    pub fn get(&self, aggregation_id: &str) -> Result<Aggregation> {
        self.aggregations
            .iter()
            .find(|a| a.id == aggregation_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no aggregation with id {aggregation_id}")))
    }

    fn select_expression(aggregation: &Aggregation) -> String {
        aggregation
            .aggregates
            .iter()
            .map(|f| format!("{f}(\"value\") AS \"{f}\""))
            .collect::<Vec<_>>()
            .join(", ")
    }

    async fn create_artifacts(&self, aggregation: &Aggregation, stream: &Stream) -> Result<()> {
        let db = self.storage.database();
        let statement = format!(
            "CREATE CONTINUOUS QUERY \"{}\" ON \"{db}\" BEGIN SELECT {} INTO {} FROM {} GROUP BY time({}), * END",
            cq_name(&aggregation.id, &stream.id),
            Self::select_expression(aggregation),
            measurement_fq(
                db,
                &aggregation.retention,
                &measurement_name(&aggregation.id, &stream.id)
            ),
            measurement_fq(db, &stream.retention, &data_measurement_name(&stream.id)),
            aggregation.interval,
        );
        match self.storage.client().query(&statement).await {
            Ok(_) => {
                info!(aggregation = %aggregation.id, stream = %stream.id,
                    "created aggregation artifacts");
                Ok(())
            }
            Err(e) if e.to_string().contains("already exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn drop_artifacts(&self, aggregation: &Aggregation, stream: &Stream) -> Result<()> {
        let db = self.storage.database();
        let drop_cq = format!(
            "DROP CONTINUOUS QUERY \"{}\" ON \"{db}\"",
            cq_name(&aggregation.id, &stream.id)
        );
        match self.storage.client().query(&drop_cq).await {
            Ok(_) => {}
            Err(e) if e.to_string().contains(CQ_NOT_FOUND) => {}
            Err(e) => return Err(e),
        }

        let drop_measurement = format!(
            "DROP MEASUREMENT \"{}\"",
            measurement_name(&aggregation.id, &stream.id)
        );
        match self.storage.client().query(&drop_measurement).await {
            Ok(_) => {
                debug!(aggregation = %aggregation.id, stream = %stream.id,
                    "dropped aggregation artifacts");
                Ok(())
            }
            Err(e) if e.to_string().contains(MEASUREMENT_NOT_FOUND) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl EventListener for InfluxAggr {
    fn name(&self) -> &'static str {
        "influx-aggr"
    }

    async fn on_create(&self, stream: &Stream) -> Result<()> {
        self.storage.await_ready().await;
        if stream.value_type != ValueType::Float {
            return Ok(());
        }
        for aggregation in &self.aggregations {
            self.create_artifacts(aggregation, stream).await?;
        }
        Ok(())
    }

    async fn on_update(&self, _old: &Stream, _new: &Stream) -> Result<()> {
        // aggregate measurements carry the aggregation's own retention,
        // independent of the stream's; nothing to reconcile here
        self.storage.await_ready().await;
        Ok(())
    }

    async fn on_delete(&self, stream: &Stream) -> Result<()> {
        self.storage.await_ready().await;
        if stream.value_type != ValueType::Float {
            return Ok(());
        }
        for aggregation in &self.aggregations {
            self.drop_artifacts(aggregation, stream).await?;
        }
        Ok(())
    }
}
