//! Durable key-value storage for cache entries.
//!
//! Values are JSON text. `ethers` serializes U256 as a hex string and IndexMap
//! keeps insertion order, so big integers and ordered maps survive a round trip
//! without ever passing through f64.

use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Result, SdkError};

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Fails with `SdkError::QuotaExceeded` when the store is full.
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
    async fn keys(&self) -> Result<Vec<String>>;
}

/// Process-local store. An optional byte quota emulates a bounded backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: DashMap<String, String>,
    used_bytes: AtomicUsize,
    quota_bytes: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let new_size = key.len() + value.len();
        let old_size = self
            .values
            .get(key)
            .map(|v| key.len() + v.value().len())
            .unwrap_or(0);
        if let Some(quota) = self.quota_bytes {
            let projected = self
                .used_bytes
                .load(Ordering::Relaxed)
                .saturating_sub(old_size)
                + new_size;
            if projected > quota {
                return Err(SdkError::QuotaExceeded);
            }
        }
        self.values.insert(key.to_string(), value.to_string());
        self.used_bytes.fetch_sub(old_size, Ordering::Relaxed);
        self.used_bytes.fetch_add(new_size, Ordering::Relaxed);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        if let Some((k, v)) = self.values.remove(key) {
            self.used_bytes.fetch_sub(k.len() + v.len(), Ordering::Relaxed);
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.values.iter().map(|e| e.key().clone()).collect())
    }
}

/// One JSON file per key inside a directory. File names are the hex-encoded key.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        debug!("FileStore opened at {}", dir.display());
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(key)))
    }
}

fn is_quota_error(err: &std::io::Error) -> bool {
    // ENOSPC / EDQUOT
    matches!(err.raw_os_error(), Some(28) | Some(122))
}

#[async_trait]
impl DurableStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        tokio::fs::write(self.path_for(key), value)
            .await
            .map_err(|e| {
                if is_quota_error(&e) {
                    SdkError::QuotaExceeded
                } else {
                    e.into()
                }
            })
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(bytes) = hex::decode(stem) {
                if let Ok(key) = String::from_utf8(bytes) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }
}

#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

#[cfg(feature = "redis")]
mod redis_store {
    use super::*;
    use log::info;
    use redis::aio::ConnectionManager;
    use redis::{AsyncCommands, Client};

    /// Redis-backed store. Keys are namespaced so `keys()` only sees ours.
    #[derive(Clone)]
    pub struct RedisStore {
        conn: ConnectionManager,
        namespace: String,
    }

    fn redis_err(e: redis::RedisError) -> SdkError {
        if e.to_string().contains("OOM") {
            SdkError::QuotaExceeded
        } else {
            SdkError::Storage(e.to_string())
        }
    }

    impl RedisStore {
        pub async fn connect(url: &str, namespace: impl Into<String>) -> Result<Self> {
            let client = Client::open(url).map_err(redis_err)?;
            let conn = ConnectionManager::new(client).await.map_err(redis_err)?;
            info!("RedisStore connected to {}", url);
            Ok(Self {
                conn,
                namespace: namespace.into(),
            })
        }

        fn full_key(&self, key: &str) -> String {
            format!("{}:{}", self.namespace, key)
        }
    }

    #[async_trait]
    impl DurableStore for RedisStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            let mut conn = self.conn.clone();
            conn.get(self.full_key(key)).await.map_err(redis_err)
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            let mut conn = self.conn.clone();
            conn.set::<_, _, ()>(self.full_key(key), value)
                .await
                .map_err(redis_err)
        }

        async fn remove(&self, key: &str) -> Result<()> {
            let mut conn = self.conn.clone();
            conn.del::<_, ()>(self.full_key(key)).await.map_err(redis_err)
        }

        async fn keys(&self) -> Result<Vec<String>> {
            let mut conn = self.conn.clone();
            let prefix = format!("{}:", self.namespace);
            let raw: Vec<String> = conn
                .keys(format!("{}*", prefix))
                .await
                .map_err(redis_err)?;
            Ok(raw
                .into_iter()
                .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
                .collect())
        }
    }
}
