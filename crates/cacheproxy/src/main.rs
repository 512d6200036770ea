use cacheproxy::config::Config;
use cacheproxy::{telemetry, CacheStorage, CacheableProxy, ProxyError, RemoteFileCache};
use clap::{CommandFactory, Parser};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "cacheproxy", about = "Caching reverse proxy for a single http origin")]
struct Args {
    /// Port to listen on (0 picks a free port)
    #[arg(long)]
    port: Option<u16>,

    /// Origin to proxy, e.g. http://127.0.0.1:3000
    #[arg(long)]
    target_url: Option<String>,

    /// Configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    telemetry::init_tracing();

    let args = Args::parse();
    let mut config = load_config(&args.config);
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(url) = args.target_url {
        config.upstream.url = Some(url);
    }

    let Some(target_url) = config.upstream.url.clone() else {
        if let Err(e) = Args::command().print_help() {
            tracing::error!(error = %e, "failed to print usage");
        }
        return ExitCode::SUCCESS;
    };

    let shutdown = CancellationToken::new();

    if let Some(addr) = config.server.metrics_addr.clone() {
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = telemetry::serve_metrics(addr, token).await {
                tracing::error!(error = %e, "metrics endpoint failed");
            }
        });
    }

    let cache = match RemoteFileCache::open(config.store_settings()) {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            tracing::error!(error = %e, dir = %config.cache.dir.display(), "failed to open cache store");
            return ExitCode::FAILURE;
        }
    };

    let storage: Arc<dyn CacheStorage> = cache.clone();
    let proxy = match CacheableProxy::new(storage, &target_url, config.proxy_settings()) {
        Ok(proxy) => Arc::new(proxy),
        Err(e) => {
            tracing::error!(error = %e, "failed to create proxy");
            close_cache(&cache).await;
            return ExitCode::FAILURE;
        }
    };

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    tracing::info!(
        target = %target_url,
        port = config.server.port,
        cache_dir = %config.cache.dir.display(),
        ttl_seconds = config.cache.ttl_seconds,
        tracked = ?config.cache.tracked,
        "cacheproxy starting"
    );

    let (ready_tx, ready_rx) = oneshot::channel();
    let server = tokio::spawn(Arc::clone(&proxy).listen(shutdown.clone(), ready_tx));
    if let Ok(addr) = ready_rx.await {
        tracing::info!(addr = %addr, serve_host = %proxy.serve_host(), "cacheproxy ready");
    }

    let outcome = match server.await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(ProxyError::DrainTimeout(drain))) => {
            tracing::warn!(drain_seconds = drain.as_secs(), "shutdown finished with open connections");
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "proxy failed");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!(error = %e, "proxy task panicked");
            ExitCode::FAILURE
        }
    };

    shutdown.cancel();
    close_cache(&cache).await;
    tracing::info!("cacheproxy shut down");
    outcome
}

fn load_config(path: &Path) -> Config {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file found, using defaults");
        return Config::default_config();
    }
    match Config::load(path) {
        Ok(c) => {
            tracing::info!(path = %path.display(), "loaded config");
            c
        }
        Err(e) => {
            tracing::error!(error = %e, path = %path.display(), "failed to load config, using defaults");
            Config::default_config()
        }
    }
}

async fn close_cache(cache: &RemoteFileCache) {
    if let Err(e) = cache.close().await {
        tracing::error!(error = %e, "failed to close cache store");
    }
}

/// Listen for SIGINT (Ctrl+C) or SIGTERM and cancel the shutdown token.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl+C");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    tracing::info!("shutdown signal received, draining connections");
    token.cancel();
}
