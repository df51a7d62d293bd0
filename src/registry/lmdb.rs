//! Durable registry backend over LMDB
//!
//! One LMDB database holds two key families: `stream/<id>` maps to the
//! serialized stream record and `name/<name>` maps to the id. Both keys
//! are written in a single transaction so the index can never drift from
//! the records. Lexicographic key order over the `stream/` prefix gives
//! deterministic paging by id.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use heed::types::Str;
use heed::{Database, Env, EnvOpenOptions};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::notify::Notifier;
use crate::types::Stream;

use super::{
    check_paging, merge_update, paginate, stream_matches, validate_stream, FilterOp, Registry,
};

const STREAM_PREFIX: &str = "stream/";
const NAME_PREFIX: &str = "name/";

const MAP_SIZE: usize = 256 * 1024 * 1024;

/// Durable registry backend
pub struct LmdbRegistry {
    retention_periods: Vec<String>,
    notifier: Arc<Notifier>,
    env: Env,
    db: Database<Str, Str>,
    // serializes persist + publish + rollback across mutations
    write_lock: Mutex<()>,
}

fn stream_key(id: &str) -> String {
    format!("{STREAM_PREFIX}{id}")
}

fn name_key(name: &str) -> String {
    format!("{NAME_PREFIX}{name}")
}

impl LmdbRegistry {
    /// Open or create the registry database at `path`
    pub fn open(
        path: impl AsRef<Path>,
        retention_periods: Vec<String>,
        notifier: Arc<Notifier>,
    ) -> Result<Self> {
        std::fs::create_dir_all(path.as_ref())?;
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(MAP_SIZE)
                .max_dbs(1)
                .open(path.as_ref())?
        };
        let mut wtxn = env.write_txn()?;
        let db: Database<Str, Str> = env.create_database(&mut wtxn, Some("registry"))?;
        wtxn.commit()?;

        Ok(Self {
            retention_periods,
            notifier,
            env,
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn read_stream(&self, id: &str) -> Result<Option<Stream>> {
        let rtxn = self.env.read_txn()?;
        match self.db.get(&rtxn, &stream_key(id))? {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    fn read_all(&self) -> Result<Vec<Stream>> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for item in self.db.prefix_iter(&rtxn, STREAM_PREFIX)? {
            let (_, raw) = item?;
            out.push(serde_json::from_str(raw)?);
        }
        Ok(out)
    }

    fn put_stream(&self, stream: &Stream) -> Result<()> {
        let raw = serde_json::to_string(stream)?;
        let mut wtxn = self.env.write_txn()?;
        self.db.put(&mut wtxn, &stream_key(&stream.id), &raw)?;
        self.db.put(&mut wtxn, &name_key(&stream.name), &stream.id)?;
        wtxn.commit()?;
        Ok(())
    }

    fn remove_stream(&self, stream: &Stream) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.db.delete(&mut wtxn, &stream_key(&stream.id))?;
        self.db.delete(&mut wtxn, &name_key(&stream.name))?;
        wtxn.commit()?;
        Ok(())
    }
}

#[async_trait]
impl Registry for LmdbRegistry {
    async fn create(&self, mut stream: Stream) -> Result<Stream> {
        validate_stream(&stream, &self.retention_periods)?;

        let _guard = self.write_lock.lock().await;

        {
            let rtxn = self.env.read_txn()?;
            if self.db.get(&rtxn, &name_key(&stream.name))?.is_some() {
                return Err(Error::Conflict(format!(
                    "a stream named {} already exists",
                    stream.name
                )));
            }
            if !stream.id.is_empty() && self.db.get(&rtxn, &stream_key(&stream.id))?.is_some() {
                return Err(Error::Conflict(format!(
                    "a stream with id {} already exists",
                    stream.id
                )));
            }
        }

        if stream.id.is_empty() {
            stream.id = Uuid::new_v4().to_string();
        }
        stream.created = Utc::now();
        stream.updated = stream.created;

        self.put_stream(&stream)?;

        if let Err(e) = self.notifier.created(&stream).await {
            // reverse mutation: the record never becomes visible to callers
            self.remove_stream(&stream)?;
            return Err(e);
        }

        info!(id = %stream.id, name = %stream.name, "stream created");
        Ok(stream)
    }

    async fn get(&self, id: &str) -> Result<Stream> {
        self.read_stream(id)?
            .ok_or_else(|| Error::NotFound(format!("no stream with id {id}")))
    }

    async fn get_by_name(&self, name: &str) -> Result<Stream> {
        let id = {
            let rtxn = self.env.read_txn()?;
            self.db
                .get(&rtxn, &name_key(name))?
                .map(str::to_string)
                .ok_or_else(|| Error::NotFound(format!("no stream named {name}")))?
        };
        self.get(&id).await
    }

    async fn update(&self, id: &str, stream: Stream) -> Result<Stream> {
        let _guard = self.write_lock.lock().await;

        let existing = self
            .read_stream(id)?
            .ok_or_else(|| Error::NotFound(format!("no stream with id {id}")))?;

        let mut merged = merge_update(&existing, stream)?;
        validate_stream(&merged, &self.retention_periods)?;
        merged.updated = Utc::now();

        self.put_stream(&merged)?;

        if let Err(e) = self.notifier.updated(&existing, &merged).await {
            self.put_stream(&existing)?;
            return Err(e);
        }

        info!(id = %merged.id, name = %merged.name, "stream updated");
        Ok(merged)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let existing = self
            .read_stream(id)?
            .ok_or_else(|| Error::NotFound(format!("no stream with id {id}")))?;

        // publish first; a veto aborts before anything is removed
        self.notifier.deleted(&existing).await?;

        self.remove_stream(&existing)?;

        info!(id = %existing.id, name = %existing.name, "stream deleted");
        Ok(())
    }

    async fn get_many(&self, page: usize, per_page: usize) -> Result<(Vec<Stream>, usize)> {
        check_paging(page, per_page)?;
        let all = self.read_all()?;
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
        let matched: Vec<Stream> = self
            .read_all()?
            .into_iter()
            .filter(|s| stream_matches(s, path, op, value))
            .collect();
        let total = matched.len();
        Ok((paginate(&matched, page, per_page), total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueType;

    fn registry(dir: &tempfile::TempDir) -> LmdbRegistry {
        LmdbRegistry::open(
            dir.path(),
            vec!["1h".into(), "7d".into()],
            Arc::new(Notifier::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);

        let mut s = Stream::new("s1", ValueType::Float);
        s.retention = "7d".into();
        let created = reg.create(s).await.unwrap();

        let fetched = reg.get(&created.id).await.unwrap();
        assert_eq!(fetched, created);
        assert_eq!(reg.get_by_name("s1").await.unwrap().id, created.id);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let reg = registry(&dir);
            reg.create(Stream::new("s1", ValueType::Bool)).await.unwrap().id
        };
        let reg = registry(&dir);
        let fetched = reg.get(&id).await.unwrap();
        assert_eq!(fetched.name, "s1");
        assert_eq!(fetched.value_type, ValueType::Bool);
    }

    #[tokio::test]
    async fn test_duplicate_name_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.create(Stream::new("s1", ValueType::Float)).await.unwrap();
        let err = reg.create(Stream::new("s1", ValueType::Float)).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_delete_clears_both_keys() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        let created = reg.create(Stream::new("s1", ValueType::Float)).await.unwrap();
        reg.delete(&created.id).await.unwrap();
        assert!(reg.get(&created.id).await.unwrap_err().is_not_found());
        assert!(reg.get_by_name("s1").await.unwrap_err().is_not_found());

        // the name is free again
        reg.create(Stream::new("s1", ValueType::Float)).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_many_pages_in_id_order() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        for i in 0..7 {
            reg.create(Stream::new(format!("s{i}"), ValueType::Float))
                .await
                .unwrap();
        }
        let (page, total) = reg.get_many(2, 3).await.unwrap();
        assert_eq!(total, 7);
        assert_eq!(page.len(), 3);

        let (all, _) = reg.get_many(1, 100).await.unwrap();
        let ids: Vec<_> = all.iter().map(|s| s.id.clone()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
