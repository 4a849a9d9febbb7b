//! Durable home of the position record.
//!
//! Every backend writes the whole record in one atomic step: a Redis `SET`,
//! or a temp-file write + fsync + rename. `save` returns only once the value
//! is durable.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::db::redis::RedisPool;
use crate::services::position::PositionRecord;
use crate::utils::errors::StoreError;

#[async_trait]
pub trait PositionStore: Send + Sync {
    /// `None` when nothing was ever saved.
    async fn load(&self) -> Result<Option<PositionRecord>, StoreError>;
    async fn save(&self, record: &PositionRecord) -> Result<(), StoreError>;
}

// ---- redis -------------------------------------------------------------

pub struct RedisPositionStore {
    redis: RedisPool,
    key: String,
}

impl RedisPositionStore {
    pub fn new(redis: RedisPool, key: impl Into<String>) -> Self {
        Self { redis, key: key.into() }
    }
}

#[async_trait]
impl PositionStore for RedisPositionStore {
    async fn load(&self) -> Result<Option<PositionRecord>, StoreError> {
        Ok(self.redis.get_json(&self.key).await?)
    }

    async fn save(&self, record: &PositionRecord) -> Result<(), StoreError> {
        self.redis.set_json(&self.key, record).await?;
        Ok(())
    }
}

// ---- json file ---------------------------------------------------------

pub struct JsonFilePositionStore {
    path: PathBuf,
}

impl JsonFilePositionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl PositionStore for JsonFilePositionStore {
    async fn load(&self) -> Result<Option<PositionRecord>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, record: &PositionRecord) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(record)?;
        let tmp = self.tmp_path();

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await?;
        log::debug!("position record written to {}", self.path.display());
        Ok(())
    }
}

// ---- memory ------------------------------------------------------------

/// Process-local store for tests and dry wiring. Counts saves.
#[derive(Default)]
pub struct MemoryPositionStore {
    inner: Mutex<(Option<PositionRecord>, usize)>,
}

impl MemoryPositionStore {
    pub fn with_record(record: PositionRecord) -> Self {
        Self { inner: Mutex::new((Some(record), 0)) }
    }

    pub fn snapshot(&self) -> Option<PositionRecord> {
        self.inner.lock().map(|g| g.0.clone()).unwrap_or(None)
    }

    pub fn saves(&self) -> usize {
        self.inner.lock().map(|g| g.1).unwrap_or(0)
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn load(&self) -> Result<Option<PositionRecord>, StoreError> {
        Ok(self.snapshot())
    }

    async fn save(&self, record: &PositionRecord) -> Result<(), StoreError> {
        let mut g = self
            .inner
            .lock()
            .map_err(|_| StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, "store lock poisoned")))?;
        g.0 = Some(record.clone());
        g.1 += 1;
        Ok(())
    }
}
