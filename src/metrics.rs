//! Prometheus metrics for the Historical Datastore
//!
//! Counters for the ingestion paths, registry mutations and broker
//! connector health, exposed as text on `/metrics`.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_int_gauge, CounterVec, Encoder, IntGauge, TextEncoder,
};

lazy_static! {
    /// Records ingested, by source (http, mqtt)
    pub static ref RECORDS_INGESTED: CounterVec = register_counter_vec!(
        "hds_records_ingested_total",
        "Records accepted into storage",
        &["source"]
    ).unwrap();

    /// Records dropped before storage, by source and reason
    pub static ref RECORDS_DROPPED: CounterVec = register_counter_vec!(
        "hds_records_dropped_total",
        "Records rejected or dropped before storage",
        &["source", "reason"]
    ).unwrap();

    /// Registry mutations, by operation and outcome
    pub static ref REGISTRY_MUTATIONS: CounterVec = register_counter_vec!(
        "hds_registry_mutations_total",
        "Registry create/update/delete operations",
        &["operation", "status"]
    ).unwrap();

    /// Broker reconnects observed by the connector
    pub static ref BROKER_RECONNECTS: CounterVec = register_counter_vec!(
        "hds_broker_reconnects_total",
        "Broker session reconnects",
        &["broker"]
    ).unwrap();

    /// Subscriptions the connector is still retrying
    pub static ref FAILED_REGISTRATIONS: IntGauge = register_int_gauge!(
        "hds_failed_registrations",
        "Broker subscriptions pending retry"
    ).unwrap();
}

/// Render all registered metrics in the Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
