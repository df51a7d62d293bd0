//! In-memory registry backend
//!
//! Streams live in a `BTreeMap` keyed by id so paging order is
//! deterministic, with a name index beside it. Mutations hold the write
//! lock across persistence and event fan-out: a vetoing subscriber rolls
//! the mutation back before any reader can observe it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::notify::Notifier;
use crate::types::Stream;

use super::{
    check_paging, merge_update, paginate, stream_matches, validate_stream, FilterOp, Registry,
};

#[derive(Default)]
struct Inner {
    streams: BTreeMap<String, Stream>,
    names: HashMap<String, String>,
}

/// Volatile registry backend
pub struct MemoryRegistry {
    retention_periods: Vec<String>,
    notifier: Arc<Notifier>,
    inner: RwLock<Inner>,
}

impl MemoryRegistry {
    /// Create an empty registry publishing on `notifier`
    pub fn new(retention_periods: Vec<String>, notifier: Arc<Notifier>) -> Self {
        Self {
            retention_periods,
            notifier,
            inner: RwLock::new(Inner::default()),
        }
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn create(&self, mut stream: Stream) -> Result<Stream> {
        validate_stream(&stream, &self.retention_periods)?;

        let mut inner = self.inner.write().await;
        if inner.names.contains_key(&stream.name) {
            return Err(Error::Conflict(format!(
                "a stream named {} already exists",
                stream.name
            )));
        }
        if stream.id.is_empty() {
            stream.id = Uuid::new_v4().to_string();
        } else if inner.streams.contains_key(&stream.id) {
            return Err(Error::Conflict(format!(
                "a stream with id {} already exists",
                stream.id
            )));
        }
        stream.created = Utc::now();
        stream.updated = stream.created;

        inner.streams.insert(stream.id.clone(), stream.clone());
        inner.names.insert(stream.name.clone(), stream.id.clone());

        if let Err(e) = self.notifier.created(&stream).await {
            inner.streams.remove(&stream.id);
            inner.names.remove(&stream.name);
            return Err(e);
        }

        info!(id = %stream.id, name = %stream.name, "stream created");
        Ok(stream)
    }

    async fn get(&self, id: &str) -> Result<Stream> {
        let inner = self.inner.read().await;
        inner
            .streams
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no stream with id {id}")))
    }

    async fn get_by_name(&self, name: &str) -> Result<Stream> {
        let inner = self.inner.read().await;
        let id = inner
            .names
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("no stream named {name}")))?;
        Ok(inner.streams[id].clone())
    }

    async fn update(&self, id: &str, stream: Stream) -> Result<Stream> {
        let mut inner = self.inner.write().await;
        let existing = inner
            .streams
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no stream with id {id}")))?;

        let mut merged = merge_update(&existing, stream)?;
        validate_stream(&merged, &self.retention_periods)?;
        merged.updated = Utc::now();

        inner.streams.insert(id.to_string(), merged.clone());

        if let Err(e) = self.notifier.updated(&existing, &merged).await {
            inner.streams.insert(id.to_string(), existing);
            return Err(e);
        }

        info!(id = %merged.id, name = %merged.name, "stream updated");
        Ok(merged)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let existing = inner
            .streams
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no stream with id {id}")))?;

        // Deletion publishes first so subscribers can reclaim resources;
        // a veto leaves the record in place.
        self.notifier.deleted(&existing).await?;

        inner.streams.remove(id);
        inner.names.remove(&existing.name);

        info!(id = %existing.id, name = %existing.name, "stream deleted");
        Ok(())
    }

    async fn get_many(&self, page: usize, per_page: usize) -> Result<(Vec<Stream>, usize)> {
        check_paging(page, per_page)?;
        let inner = self.inner.read().await;
        let all: Vec<Stream> = inner.streams.values().cloned().collect();
        let total = all.len();
        Ok((paginate(&all, page, per_page), total))
    }

    async fn filter(
        &self,
        path: &str,
        op: FilterOp,
        value: &str,
        page: usize,
        per_page: usize,
    ) -> Result<(Vec<Stream>, usize)> {
        check_paging(page, per_page)?;
        let inner = self.inner.read().await;
        let matched: Vec<Stream> = inner
            .streams
            .values()
            .filter(|s| stream_matches(s, path, op, value))
            .cloned()
            .collect();
        let total = matched.len();
        Ok((paginate(&matched, page, per_page), total))
    }
}
