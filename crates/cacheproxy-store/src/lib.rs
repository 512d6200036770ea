//! Disk-backed key-value store for the cache proxy.
//!
//! A thin layer over RocksDB. Every value is stored behind an 8-byte
//! little-endian absolute expiry (milliseconds since the Unix epoch, `0` for
//! never). Reads treat an expired value as absent; a compaction filter drops
//! expired values for good, so [`Store::run_value_log_gc`] reclaims both
//! superseded and expired data.

mod expiry;
pub mod store;

pub use store::{Options, Store, StoreStats};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rocksdb: {0}")]
    Engine(#[from] rocksdb::Error),

    #[error("stored value is shorter than its expiry header ({0} bytes)")]
    Corrupt(usize),

    #[error("store is closed")]
    Closed,

    /// The reclaimable share is below the requested ratio.
    #[error("nothing worth compacting")]
    NoRewrite,

    #[error("discard ratio must be in (0, 1), got {0}")]
    InvalidDiscardRatio(f64),
}

pub type Result<T> = std::result::Result<T, StoreError>;
