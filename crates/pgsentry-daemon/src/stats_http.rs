//! Internal statistics endpoint.
//!
//! Serves one fixed JSON document at `/` from the process-global
//! counters plus live endpoint counts. A summarizer task refreshes the
//! 5-minute points-per-minute figure.

use crate::core::Core;
use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use pgsentry_common::stats;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const SUMMARIZATION_INTERVAL: Duration = Duration::from_secs(300);

async fn stats_handler(State(core): State<Arc<Core>>) -> Json<Value> {
    let snap = stats::snapshot();
    let (configured, monitored) = core.monitored_counts();
    let unreachable = core.descriptors.unreachable_count();
    Json(json!({
        "secondsFromLastSuccessfulDatastoreWrite":
            Utc::now().timestamp() - snap.last_successful_write_epoch,
        "totalMetricsFetchedCounter": snap.total_metrics_fetched,
        "totalMetricsReusedFromCacheCounter": snap.metrics_reused_from_cache,
        "totalDatasetsFetchedCounter": snap.total_datasets_fetched,
        "metricPointsPerMinuteLast5MinAvg": snap.effective_points_per_minute(),
        "metricsDropped": snap.metrics_dropped,
        "totalMetricFetchFailuresCounter": snap.metric_fetch_failures,
        "datastoreWriteFailuresCounter": snap.datastore_write_failures,
        "datastoreSuccessfulWritesCounter": snap.datastore_write_successes,
        "datastoreAvgSuccessfulWriteTimeMillis": snap.avg_successful_write_time_ms(),
        "databasesMonitored": monitored,
        "databasesConfigured": configured,
        "unreachableDBs": unreachable,
        "gathererUptimeSeconds": snap.uptime_seconds,
    }))
}

/// Serve the stats document until the process exits, re-binding after
/// a minute on listener failure.
pub async fn run_stats_server(core: Arc<Core>, port: u16) {
    loop {
        let app = Router::new()
            .route("/", get(stats_handler))
            .with_state(Arc::clone(&core));
        let bind_result = tokio::net::TcpListener::bind(("0.0.0.0", port)).await;
        match bind_result {
            Ok(listener) => {
                tracing::info!(port, "internal statistics interface listening");
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!(error = %e, "statistics server failed");
                }
            }
            Err(e) => {
                tracing::error!(port, error = %e, "could not bind the statistics interface");
            }
        }
        tokio::time::sleep(Duration::from_secs(60)).await;
    }
}

/// Recompute the 1-minute fetch rate over the last summarization
/// window every five minutes.
pub async fn run_stats_summarizer() {
    let mut previous_count = 0u64;
    let mut last_tick = tokio::time::Instant::now();
    loop {
        tokio::time::sleep(SUMMARIZATION_INTERVAL).await;
        let current = stats::TOTAL_METRICS_FETCHED.load(Ordering::Relaxed);
        let elapsed_s = last_tick.elapsed().as_secs_f64().max(1.0);
        let per_minute = ((current - previous_count) as f64 * 60.0 / elapsed_s).round() as i64;
        stats::POINTS_PER_MINUTE_LAST_5MIN.store(per_minute, Ordering::Relaxed);
        previous_count = current;
        last_tick = tokio::time::Instant::now();
    }
}
