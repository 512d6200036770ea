use cacheproxy_store::{Store, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Periodic compaction for one store.
///
/// Every `interval` the task compacts until the store reports less than
/// `discard_ratio` of its entries reclaimable. It checks `shutdown` only
/// between ticks; a running compaction pass always completes.
pub fn spawn_gc(
    store: Arc<Store>,
    interval: Duration,
    discard_ratio: f64,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let store = Arc::clone(&store);
                    match tokio::task::spawn_blocking(move || run_gc(&store, discard_ratio)).await {
                        Ok(0) => tracing::debug!("store gc: nothing to reclaim"),
                        Ok(passes) => {
                            metrics::counter!(crate::telemetry::GC_COMPACTIONS).increment(passes as u64);
                            tracing::info!(passes, "store gc finished");
                        }
                        Err(e) => tracing::error!(error = %e, "store gc task panicked"),
                    }
                }
            }
        }

        tracing::debug!("store gc stopped");
    })
}

/// Compact until the store has nothing worth reclaiming. Returns the number
/// of compaction passes.
pub fn run_gc(store: &Store, discard_ratio: f64) -> usize {
    let mut passes = 0;
    loop {
        let before = store.stats().entries;
        match store.run_value_log_gc(discard_ratio) {
            Ok(()) => passes += 1,
            Err(StoreError::NoRewrite) => break,
            Err(e) => {
                tracing::warn!(error = %e, "store gc stopped early");
                break;
            }
        }
        // Engine estimates can lag; a pass that freed nothing ends the run.
        if store.stats().entries >= before {
            break;
        }
    }
    passes
}
