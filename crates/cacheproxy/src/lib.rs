//! Caching reverse proxy for a single http origin.
//!
//! Inbound requests are keyed by method, origin and decoded path and query.
//! A usable cached record is replayed as-is; otherwise the request is
//! forwarded and the origin response, when its content class is tracked,
//! is written to an on-disk RocksDB store for later requests.

pub mod cache_key;
pub mod codec;
pub mod config;
pub mod director;
pub mod error;
pub mod file_info;
pub mod interceptor;
pub mod proxy;
pub mod repository;
pub mod sniff;
pub mod telemetry;
pub mod transport;

pub use error::{CacheError, ForwardError, ProxyError};
pub use file_info::{FileEnvelope, FileInformation, FileMime};
pub use proxy::{CacheableProxy, ProxySettings};
pub use repository::{CacheStorage, RemoteFileCache, StoreSettings};
pub use transport::{RewriteLayer, RewriteTransport};
