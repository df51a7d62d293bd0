//! Ingestion facade for the HTTP data API
//!
//! Validates incoming sensor-measurement packs (content type, record
//! names, value types against the registered schema), optionally
//! auto-registers unknown streams, groups records by stream and hands the
//! batch to the storage adapter. Also resolves stream id lists for the
//! query side.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::senml::{Pack, Record};
use crate::types::{Stream, ValueType};

use super::{Query, Storage, SENML_CONTENT_TYPE};

/// Validates and routes push-ingested records to the storage adapter
pub struct Ingester {
    registry: Arc<dyn Registry>,
    storage: Arc<dyn Storage>,
    auto_registration: bool,
}

impl Ingester {
    /// Create the facade. With `auto_registration` a record for an
    /// unknown stream name creates the stream with the inferred type.
    pub fn new(
        registry: Arc<dyn Registry>,
        storage: Arc<dyn Storage>,
        auto_registration: bool,
    ) -> Self {
        Self {
            registry,
            storage,
            auto_registration,
        }
    }

    /// Validate and store one ingestion request.
    ///
    /// When `ids` is given (the `POST /data/{id}` form) every record must
    /// belong to one of those streams; otherwise records resolve by name
    /// against the whole registry.
    pub async fn submit(
        &self,
        content_type: &str,
        payload: &[u8],
        ids: Option<&[String]>,
    ) -> Result<()> {
        let media_type = content_type.split(';').next().unwrap_or_default().trim();
        if media_type != SENML_CONTENT_TYPE {
            return Err(Error::Unsupported(format!(
                "unsupported content type: {media_type}. only {SENML_CONTENT_TYPE} is supported"
            )));
        }

        let records = Pack::decode(payload)?.normalize()?;

        let addressed = match ids {
            Some(ids) => {
                let mut by_name = HashMap::new();
                for stream in self.resolve_ids(ids).await? {
                    by_name.insert(stream.name.clone(), stream);
                }
                Some(by_name)
            }
            None => None,
        };

        let mut data: HashMap<String, Vec<Record>> = HashMap::new();
        let mut streams: HashMap<String, Stream> = HashMap::new();
        for record in records {
            let stream = match &addressed {
                Some(by_name) => by_name
                    .get(&record.name)
                    .cloned()
                    .ok_or_else(|| {
                        Error::NotFound(format!(
                            "record for stream {} not addressed by the request",
                            record.name
                        ))
                    })?,
                None => self.resolve_name(&record).await?,
            };

            if !stream.value_type.matches(&record) {
                return Err(Error::BadRequest(format!(
                    "record for {} has a value incompatible with the registered type {}",
                    record.name, stream.value_type
                )));
            }

            data.entry(stream.id.clone()).or_default().push(record);
            streams.entry(stream.id.clone()).or_insert(stream);
        }

        if data.is_empty() {
            return Ok(());
        }
        let batches = data.len();
        let record_count: usize = data.values().map(Vec::len).sum();
        self.storage
            .submit(data, streams)
            .await
            .map_err(|e| Error::Internal(format!("error writing data: {e}")))?;
        crate::metrics::RECORDS_INGESTED
            .with_label_values(&["http"])
            .inc_by(record_count as f64);
        debug!(batches, "ingested push request");
        Ok(())
    }

    /// Resolve a record's stream by name, auto-registering when enabled
    async fn resolve_name(&self, record: &Record) -> Result<Stream> {
        match self.registry.get_by_name(&record.name).await {
            Ok(stream) => Ok(stream),
            Err(e) if e.is_not_found() && self.auto_registration => {
                let value_type = ValueType::infer(record).ok_or_else(|| {
                    Error::BadRequest(format!("record for {} carries no value", record.name))
                })?;
                let created = self
                    .registry
                    .create(Stream::new(record.name.clone(), value_type))
                    .await?;
                info!(stream = %created.name, value_type = %created.value_type,
                    "auto-registered stream");
                Ok(created)
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve a comma-separated id list into stream snapshots
    pub async fn resolve_ids(&self, ids: &[String]) -> Result<Vec<Stream>> {
        let mut streams = Vec::with_capacity(ids.len());
        for id in ids {
            streams.push(self.registry.get(id).await?);
        }
        Ok(streams)
    }

    /// Query records of the addressed streams
    pub async fn query(
        &self,
        ids: &[String],
        q: Query,
        page: usize,
        per_page: usize,
    ) -> Result<(Vec<Record>, usize)> {
        let streams = self.resolve_ids(ids).await?;
        self.storage.query(q, page, per_page, &streams).await
    }

    /// Latest record of each addressed stream
    pub async fn get_last(&self, ids: &[String]) -> Result<Vec<Record>> {
        let streams = self.resolve_ids(ids).await?;
        self.storage.get_last(&streams).await
    }
}
