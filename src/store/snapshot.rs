// src/store/snapshot.rs
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};

/// Durable key/value backing for store snapshots. One key holds one JSON
/// document. Implementations are swappable; the process keeps working when
/// the backing store misbehaves.
#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Snapshots as JSON files under a state directory, one file per key.
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait::async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading snapshot {key:?}")),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating state dir {:?}", self.dir))?;
        tokio::fs::write(self.path_for(key), value)
            .await
            .with_context(|| format!("writing snapshot {key:?}"))
    }
}

/// In-memory snapshots, for tests and for running without persistence.
#[derive(Default)]
pub struct MemorySnapshotStore {
    inner: Mutex<HashMap<String, String>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .inner
            .lock()
            .expect("snapshot map mutex poisoned")
            .get(key)
            .cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .lock()
            .expect("snapshot map mutex poisoned")
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
