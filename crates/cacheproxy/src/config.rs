use crate::proxy::ProxySettings;
use crate::repository::StoreSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_seconds: u64,
    /// Prometheus endpoint; disabled when unset.
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_tracked")]
    pub tracked: Vec<String>,
    #[serde(default = "default_gc_interval")]
    pub gc_interval_seconds: u64,
    #[serde(default = "default_gc_discard_ratio")]
    pub gc_discard_ratio: f64,
    /// fsync after every cache write.
    #[serde(default)]
    pub sync_writes: bool,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self::default()
    }

    /// The cache TTL also bounds how long the store keeps an entry.
    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            dir: self.cache.dir.clone(),
            entry_ttl: Duration::from_secs(self.cache.ttl_seconds),
            gc_interval: Duration::from_secs(self.cache.gc_interval_seconds),
            gc_discard_ratio: self.cache.gc_discard_ratio,
            sync_writes: self.cache.sync_writes,
        }
    }

    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            host: self.server.host.clone(),
            port: self.server.port,
            cache_ttl: Duration::from_secs(self.cache.ttl_seconds),
            tracked: self.cache.tracked.clone(),
            upstream_timeout: Duration::from_millis(self.upstream.timeout_ms),
            drain_timeout: Duration::from_secs(self.server.drain_timeout_seconds),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            drain_timeout_seconds: default_drain_timeout(),
            metrics_addr: None,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            ttl_seconds: default_ttl(),
            tracked: default_tracked(),
            gc_interval_seconds: default_gc_interval(),
            gc_discard_ratio: default_gc_discard_ratio(),
            sync_writes: false,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_drain_timeout() -> u64 {
    30
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_dir() -> PathBuf {
    PathBuf::from("http_cache.store")
}
fn default_ttl() -> u64 {
    36 * 60 * 60
}
fn default_tracked() -> Vec<String> {
    [".html", ".htm", "text/html", ".jpg", ".jpeg", "image/jpeg"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_gc_interval() -> u64 {
    300
}
fn default_gc_discard_ratio() -> f64 {
    0.7
}
