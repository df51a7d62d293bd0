//! Historical Datastore - ingestion, registry and query service for
//! time-series sensor measurements
//!
//! This library provides the core of the datastore:
//! - A stream registry with schema and retention metadata and a
//!   synchronous change-notification bus
//! - An InfluxDB storage adapter with retention-change migration
//! - An MQTT connector maintaining broker subscriptions from registry state
//! - SenML ingestion with validation and optional auto-registration
//! - An aggregation adapter materializing pre-computed aggregates

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aggregation;
pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod notify;
pub mod registry;
pub mod senml;
pub mod types;

// Re-export main types
pub use config::Config;
pub use error::{Error, Result};
pub use notify::{EventListener, Notifier};
pub use registry::Registry;
pub use types::{SourceConfig, Stream, ValueType};
