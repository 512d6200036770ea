pub mod gc;

use crate::codec;
use crate::error::CacheError;
use crate::file_info::FileInformation;
use cacheproxy_store::{Options, Store, StoreError, StoreStats};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Key-value storage for cached responses, as seen by the proxy.
///
/// Implementations are blocking; async callers go through
/// `tokio::task::spawn_blocking`.
pub trait CacheStorage: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<FileInformation, CacheError>;

    fn set(&self, key: &str, info: &FileInformation) -> Result<(), CacheError>;
}

/// Run a lookup on the blocking pool.
pub async fn load(storage: &Arc<dyn CacheStorage>, key: &str) -> Result<FileInformation, CacheError> {
    let storage = Arc::clone(storage);
    let key = key.to_owned();
    tokio::task::spawn_blocking(move || storage.get(&key))
        .await
        .unwrap_or_else(|e| Err(CacheError::Task(e.to_string())))
}

/// Run a write on the blocking pool.
pub async fn save(
    storage: &Arc<dyn CacheStorage>,
    key: &str,
    info: FileInformation,
) -> Result<(), CacheError> {
    let storage = Arc::clone(storage);
    let key = key.to_owned();
    tokio::task::spawn_blocking(move || storage.set(&key, &info))
        .await
        .unwrap_or_else(|e| Err(CacheError::Task(e.to_string())))
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub dir: PathBuf,
    /// Expiry applied to every written entry.
    pub entry_ttl: Duration,
    pub gc_interval: Duration,
    pub gc_discard_ratio: f64,
    pub sync_writes: bool,
}

impl StoreSettings {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            entry_ttl: Duration::from_secs(36 * 60 * 60),
            gc_interval: Duration::from_secs(5 * 60),
            gc_discard_ratio: 0.7,
            sync_writes: false,
        }
    }
}

struct Maintenance {
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Disk-backed response cache.
///
/// Owns the store and its compaction task. Reads and writes are serialized
/// through one mutex so that a lookup followed by an overwrite is never
/// interleaved with another caller's operation.
pub struct RemoteFileCache {
    store: Arc<Store>,
    entry_ttl: Duration,
    serial: Mutex<()>,
    maintenance: Mutex<Maintenance>,
}

impl RemoteFileCache {
    /// Open the store and start its compaction task. Must be called from
    /// within a tokio runtime.
    pub fn open(settings: StoreSettings) -> Result<Self, StoreError> {
        let options = Options::new(&settings.dir).sync_writes(settings.sync_writes);
        let store = Arc::new(Store::open(options)?);

        let shutdown = CancellationToken::new();
        let handle = gc::spawn_gc(
            Arc::clone(&store),
            settings.gc_interval,
            settings.gc_discard_ratio,
            shutdown.clone(),
        );

        Ok(Self {
            store,
            entry_ttl: settings.entry_ttl,
            serial: Mutex::new(()),
            maintenance: Mutex::new(Maintenance {
                shutdown,
                handle: Some(handle),
            }),
        })
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// Stop the compaction task, wait for it, then flush and close the store.
    /// Safe to call more than once.
    pub async fn close(&self) -> Result<(), StoreError> {
        let handle = {
            let mut m = self.maintenance.lock();
            m.shutdown.cancel();
            m.handle.take()
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "store gc task failed");
            }
        }

        let _guard = self.serial.lock();
        self.store.close()
    }
}

impl CacheStorage for RemoteFileCache {
    fn get(&self, key: &str) -> Result<FileInformation, CacheError> {
        let _guard = self.serial.lock();
        let bytes = self.store.get(key.as_bytes())?;
        tracing::info!(key, "loaded entry from cache");
        Ok(codec::decode(&bytes)?)
    }

    fn set(&self, key: &str, info: &FileInformation) -> Result<(), CacheError> {
        let _guard = self.serial.lock();
        let bytes = codec::encode(info)?;
        self.store.set_with_ttl(key.as_bytes(), &bytes, self.entry_ttl)?;
        Ok(())
    }
}

impl Drop for RemoteFileCache {
    fn drop(&mut self) {
        self.maintenance.lock().shutdown.cancel();
    }
}
