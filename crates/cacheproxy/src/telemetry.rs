use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

pub const CACHE_HITS: &str = "cacheproxy_cache_hits_total";
pub const CACHE_MISSES: &str = "cacheproxy_cache_misses_total";
pub const CACHE_WRITES: &str = "cacheproxy_cache_writes_total";
pub const ORIGIN_ERRORS: &str = "cacheproxy_origin_errors_total";
pub const GC_COMPACTIONS: &str = "cacheproxy_gc_compactions_total";

/// JSON logs on stdout, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}

/// Install the Prometheus recorder and serve `/metrics` on `addr` until
/// `shutdown` fires.
pub async fn serve_metrics(
    addr: String,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let router = Router::new().route(
        "/metrics",
        get(move || {
            let h = handle.clone();
            async move { h.render() }
        }),
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "metrics endpoint listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}
