use crate::expiry;
use crate::{Result, StoreError};
use bytes::Bytes;
use parking_lot::RwLock;
use rocksdb::{IteratorMode, WriteOptions, DB};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Store construction options.
#[derive(Debug, Clone)]
pub struct Options {
    pub dir: PathBuf,
    /// fsync the write-ahead log on every write.
    pub sync_writes: bool,
}

impl Options {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sync_writes: false,
        }
    }

    pub fn sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }
}

/// Snapshot of engine occupancy, from RocksDB's own estimates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Entries held by the engine. Superseded and expired versions count
    /// until compaction removes them.
    pub entries: u64,
    pub sst_bytes: u64,
    pub memtable_bytes: u64,
}

fn engine_options() -> rocksdb::Options {
    let mut opts = rocksdb::Options::default();
    opts.create_if_missing(true);
    opts.set_allow_concurrent_memtable_write(true);
    opts.set_compaction_filter("drop_expired", expiry::drop_expired);
    opts
}

fn property(db: &DB, name: &str) -> u64 {
    match db.property_int_value(name) {
        Ok(value) => value.unwrap_or(0),
        Err(e) => {
            tracing::debug!(property = name, error = %e, "rocksdb property unavailable");
            0
        }
    }
}

/// Disk-backed key-value store with per-entry expiry.
///
/// The engine handles concurrent readers and writers itself; the lock here
/// only guards the handle against `close`. Compaction holds it shared, so
/// reads and writes proceed while it runs.
pub struct Store {
    dir: PathBuf,
    db: RwLock<Option<DB>>,
    sync_writes: bool,
}

impl Store {
    /// Open (or create) the store in `options.dir`. RocksDB's `LOCK` file is
    /// an OS advisory lock, so a handle left behind by a crashed process does
    /// not block the next open.
    pub fn open(options: Options) -> Result<Self> {
        fs::create_dir_all(&options.dir)?;
        let db = DB::open(&engine_options(), &options.dir)?;

        tracing::info!(
            dir = %options.dir.display(),
            entries = property(&db, "rocksdb.estimate-num-keys"),
            "store opened"
        );

        Ok(Self {
            dir: options.dir,
            db: RwLock::new(Some(db)),
            sync_writes: options.sync_writes,
        })
    }

    /// Current value for `key`. Absent and expired keys are both `NotFound`.
    pub fn get(&self, key: &[u8]) -> Result<Bytes> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(StoreError::Closed)?;
        let stored = db.get(key)?.ok_or(StoreError::NotFound)?;

        let Some((expires_at, _)) = expiry::split(&stored) else {
            return Err(StoreError::Corrupt(stored.len()));
        };
        if expiry::is_expired(expires_at, expiry::now_ms()) {
            return Err(StoreError::NotFound);
        }
        Ok(Bytes::from(stored).slice(expiry::HEADER_LEN..))
    }

    /// Write a value that never expires.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(key, value, None)
    }

    /// Write a value that expires `ttl` from now. Replaces any previous value.
    pub fn set_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<()> {
        self.write(key, value, Some(ttl))
    }

    fn write(&self, key: &[u8], value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let stored = expiry::wrap(value, expiry::expiry_from_ttl(expiry::now_ms(), ttl));
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);

        let guard = self.db.read();
        let db = guard.as_ref().ok_or(StoreError::Closed)?;
        db.put_opt(key, stored, &opts)?;
        Ok(())
    }

    /// Compact the whole key range if at least `discard_ratio` of the
    /// entries the engine holds are superseded or expired.
    ///
    /// Returns `Ok(())` after compacting and [`StoreError::NoRewrite`] when
    /// the reclaimable share is below the ratio, so callers can loop until
    /// the error.
    pub fn run_value_log_gc(&self, discard_ratio: f64) -> Result<()> {
        if !(discard_ratio > 0.0 && discard_ratio < 1.0) {
            return Err(StoreError::InvalidDiscardRatio(discard_ratio));
        }

        let guard = self.db.read();
        let db = guard.as_ref().ok_or(StoreError::Closed)?;

        let entries = property(db, "rocksdb.estimate-num-keys");
        if entries == 0 {
            return Err(StoreError::NoRewrite);
        }

        let now = expiry::now_ms();
        let mut live = 0u64;
        for item in db.iterator(IteratorMode::Start) {
            let (_, stored) = item?;
            match expiry::split(&stored) {
                Some((expires_at, _)) if expiry::is_expired(expires_at, now) => {}
                _ => live += 1,
            }
        }

        let reclaimable = entries.saturating_sub(live) as f64 / entries as f64;
        if reclaimable < discard_ratio {
            return Err(StoreError::NoRewrite);
        }

        db.compact_range(None::<&[u8]>, None::<&[u8]>);
        tracing::info!(entries, live, reclaimable, "store compacted");
        Ok(())
    }

    /// Flush and fsync the write-ahead log.
    pub fn sync(&self) -> Result<()> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(StoreError::Closed)?;
        db.flush_wal(true)?;
        Ok(())
    }

    /// Zeroed once the store is closed.
    pub fn stats(&self) -> StoreStats {
        let guard = self.db.read();
        let Some(db) = guard.as_ref() else {
            return StoreStats::default();
        };
        StoreStats {
            entries: property(db, "rocksdb.estimate-num-keys"),
            sst_bytes: property(db, "rocksdb.total-sst-files-size"),
            memtable_bytes: property(db, "rocksdb.cur-size-all-mem-tables"),
        }
    }

    /// Flush memtables and release the directory. Waits for a running
    /// compaction. Calling it again is a no-op.
    pub fn close(&self) -> Result<()> {
        let Some(db) = self.db.write().take() else {
            return Ok(());
        };
        let flushed = db.flush();
        drop(db);
        flushed?;
        tracing::info!(dir = %self.dir.display(), "store closed");
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "failed to close store cleanly");
        }
    }
}
