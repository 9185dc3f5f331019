//! The per-(endpoint, metric) fetcher task.
//!
//! Fetches on its interval, refreshes the endpoint's version record
//! and its own metric variant every five minutes, honors disabled
//! windows, detects server restarts from `db_stats` uptime
//! regressions, and reacts to supervisor control messages between
//! ticks.

use crate::changes::ChangeState;
use crate::config::Datastore;
use crate::core::Core;
use crate::fetch::{self, METRIC_OBJECT_CHANGES, RECO_METRIC_NAME, RECO_PREFIX};
use chrono::Utc;
use pgsentry_common::stats;
use pgsentry_common::types::{
    ControlMessage, DbKind, FetchMessage, MetricRow, MetricValue, MetricVersionDef, StoreMessage,
    VersionInfo, EPOCH_COLUMN_NAME,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Version record and metric variant refresh cadence inside a fetcher.
const DEFINITION_REFRESH: Duration = Duration::from_secs(300);
/// Fetch errors are logged at most this often per fetcher.
const ERROR_NOTIFICATION_INTERVAL: Duration = Duration::from_secs(600);

/// Interval for this fetcher from an interval map. The recommendations
/// umbrella may be configured under any reco_* key.
fn interval_for(config: &HashMap<String, f64>, metric: &str) -> f64 {
    if let Some(interval) = config.get(metric) {
        return *interval;
    }
    if metric == RECO_METRIC_NAME {
        if let Some(interval) = config
            .iter()
            .find(|(key, _)| key.starts_with(RECO_PREFIX))
            .map(|(_, interval)| *interval)
        {
            return interval;
        }
    }
    0.0
}

/// Inspect a fresh `db_stats` result for a postmaster uptime
/// regression; a shrinking uptime means restart or failover. Returns
/// the synthesized event message and updates the carried uptime.
pub fn detect_restart_event(
    last_uptime_s: &mut i64,
    messages: &[StoreMessage],
) -> Option<StoreMessage> {
    let first = messages.first()?;
    let row = first.data.first()?;
    let uptime = row.get("postmaster_uptime_s")?.as_i64()?;
    let previous = *last_uptime_s;
    *last_uptime_s = uptime;
    if previous == -1 || uptime >= previous {
        return None;
    }

    let details = format!(
        "Detected server restart (or failover) of \"{}\"",
        first.db_unique
    );
    tracing::warn!("{details}");
    let mut event_row = MetricRow::new();
    event_row.insert("details".to_string(), MetricValue::Text(details));
    if let Some(epoch) = row.get(EPOCH_COLUMN_NAME) {
        event_row.insert(EPOCH_COLUMN_NAME.to_string(), epoch.clone());
    }
    Some(StoreMessage {
        db_unique: first.db_unique.clone(),
        kind: first.kind,
        metric_name: METRIC_OBJECT_CHANGES.to_string(),
        custom_tags: first.custom_tags.clone(),
        data: vec![event_row],
        ..Default::default()
    })
}

#[allow(clippy::too_many_arguments)]
pub async fn metric_gatherer_loop(
    core: Arc<Core>,
    db_unique: String,
    db_unique_orig: String,
    kind: DbKind,
    metric_name: String,
    mut config: HashMap<String, f64>,
    mut control_rx: mpsc::Receiver<ControlMessage>,
    store_tx: mpsc::Sender<Vec<StoreMessage>>,
) {
    let mut interval_s = interval_for(&config, &metric_name);
    let mut host_state = ChangeState::new();
    let mut last_uptime_s: i64 = -1;
    let mut last_error_notification: Option<Instant> = None;
    let mut last_definition_refresh: Option<Instant> = None;
    let mut failed_fetches = 0u64;
    let mut vme = VersionInfo::default();
    let mut mvp = MetricVersionDef::default();
    let mut stmt_timeout_override: i64 = 0;

    let prometheus_async = core.config.datastore().ok() == Some(Datastore::Prometheus)
        && core.config.metrics.prometheus_async_mode;

    loop {
        let refresh_due = last_definition_refresh.map_or(true, |t| t.elapsed() >= DEFINITION_REFRESH);
        if refresh_due {
            match core
                .descriptors
                .version_info(&core.connections, &db_unique, kind, false)
                .await
            {
                Ok(info) => vme = info,
                Err(e) => {
                    tracing::debug!(db = %db_unique, metric = %metric_name, error = %e, "version refresh failed");
                }
            }
            match core.registry.resolve(&metric_name, &vme) {
                Ok(def) => {
                    stmt_timeout_override = if def.metric_attrs.statement_timeout_seconds > 0 {
                        def.metric_attrs.statement_timeout_seconds
                    } else {
                        0
                    };
                    mvp = def;
                }
                Err(_) => {
                    stmt_timeout_override = 0;
                }
            }
            last_definition_refresh = Some(Instant::now());
        }

        let host_config = core
            .monitored_db(&db_unique)
            .map(|md| md.host_config)
            .unwrap_or_default();
        let disabled = pgsentry_metrics::schedule::is_metric_disabled(
            Utc::now(),
            &metric_name,
            &mvp,
            &host_config,
        );
        if disabled {
            tracing::debug!(db = %db_unique, metric = %metric_name, "ignoring fetch, metric disabled for current time range");
        } else {
            let msg = FetchMessage {
                db_unique: db_unique.clone(),
                db_unique_orig: db_unique_orig.clone(),
                metric_name: metric_name.clone(),
                kind,
                interval: Duration::from_secs_f64(interval_s.max(0.0)),
                stmt_timeout_override,
            };

            let started = Instant::now();
            let result = fetch::fetch_metrics(&core, &msg, &mut host_state, &store_tx).await;
            let elapsed = started.elapsed();
            if elapsed > msg.interval && interval_s > 0.0 {
                tracing::warn!(
                    db = %db_unique,
                    metric = %metric_name,
                    fetch_s = elapsed.as_secs_f64(),
                    interval_s,
                    "fetch took longer than the gathering interval"
                );
            }

            match result {
                Err(e) => {
                    failed_fetches += 1;
                    stats::record_fetch_failure();
                    let notify_due = last_error_notification
                        .map_or(true, |t| t.elapsed() >= ERROR_NOTIFICATION_INTERVAL);
                    if notify_due {
                        tracing::error!(db = %db_unique, metric = %metric_name, error = %e, "failed to fetch metric data");
                        if failed_fetches > 1 {
                            tracing::error!(
                                db = %db_unique,
                                metric = %metric_name,
                                failed_fetches,
                                "total failed fetches"
                            );
                        }
                        last_error_notification = Some(Instant::now());
                    }
                }
                Ok(Some(mut messages)) => {
                    let empty = messages.first().is_some_and(|m| m.data.is_empty());
                    if empty && prometheus_async {
                        core.snapshot_cache.purge(&db_unique, Some(&metric_name));
                    }
                    if !empty {
                        if metric_name == "db_stats" {
                            if let Some(event) = detect_restart_event(&mut last_uptime_s, &messages)
                            {
                                messages.push(event);
                            }
                        }
                        stats::record_dataset_fetched();
                        if store_tx.send(messages).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(None) => {}
            }
        }

        tokio::select! {
            control = control_rx.recv() => {
                match control {
                    Some(ControlMessage::Start(new_config)) => {
                        config = new_config;
                        interval_s = interval_for(&config, &metric_name);
                        tracing::debug!(db = %db_unique, metric = %metric_name, interval_s, "gatherer interval updated");
                    }
                    Some(ControlMessage::Stop) | None => {
                        tracing::debug!(db = %db_unique, metric = %metric_name, "exiting gatherer loop");
                        return;
                    }
                }
            }
            _ = tokio::time::sleep(Duration::from_secs_f64(if interval_s > 0.0 { interval_s } else { 1.0 })) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_stats_message(uptime_s: i64, epoch_ns: i64) -> Vec<StoreMessage> {
        let mut row = MetricRow::new();
        row.insert(EPOCH_COLUMN_NAME.into(), MetricValue::Int(epoch_ns));
        row.insert("postmaster_uptime_s".into(), MetricValue::Int(uptime_s));
        vec![StoreMessage {
            db_unique: "prod1".into(),
            metric_name: "db_stats".into(),
            data: vec![row],
            ..Default::default()
        }]
    }

    #[test]
    fn uptime_regression_synthesizes_object_changes() {
        let mut last = -1i64;
        assert!(detect_restart_event(&mut last, &db_stats_message(3600, 10)).is_none());
        assert_eq!(last, 3600);

        let event = detect_restart_event(&mut last, &db_stats_message(120, 20)).unwrap();
        assert_eq!(last, 120);
        assert_eq!(event.metric_name, METRIC_OBJECT_CHANGES);
        assert_eq!(
            event.data[0].get("details"),
            Some(&MetricValue::Text(
                "Detected server restart (or failover) of \"prod1\"".into()
            ))
        );
        assert_eq!(event.data[0].get(EPOCH_COLUMN_NAME), Some(&MetricValue::Int(20)));
    }

    #[test]
    fn growing_uptime_is_quiet() {
        let mut last = -1i64;
        detect_restart_event(&mut last, &db_stats_message(100, 1));
        assert!(detect_restart_event(&mut last, &db_stats_message(160, 2)).is_none());
        assert!(detect_restart_event(&mut last, &db_stats_message(160, 3)).is_none());
    }

    #[test]
    fn reco_interval_falls_back_to_prefixed_keys() {
        let config = HashMap::from([("reco_add_index".to_string(), 600.0)]);
        assert_eq!(interval_for(&config, RECO_METRIC_NAME), 600.0);
        assert_eq!(interval_for(&config, "db_stats"), 0.0);

        let config = HashMap::from([
            ("recommendations".to_string(), 300.0),
            ("db_stats".to_string(), 60.0),
        ]);
        assert_eq!(interval_for(&config, RECO_METRIC_NAME), 300.0);
        assert_eq!(interval_for(&config, "db_stats"), 60.0);
    }

    #[test]
    fn rows_without_uptime_are_ignored() {
        let mut last = -1i64;
        let mut row = MetricRow::new();
        row.insert(EPOCH_COLUMN_NAME.into(), MetricValue::Int(1));
        let messages = vec![StoreMessage {
            db_unique: "prod1".into(),
            metric_name: "db_stats".into(),
            data: vec![row],
            ..Default::default()
        }];
        assert!(detect_restart_event(&mut last, &messages).is_none());
        assert_eq!(last, -1);
    }
}
