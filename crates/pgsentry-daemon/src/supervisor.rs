//! The supervisor reconciliation loop.
//!
//! Every refresh iteration: reload metric definitions and the
//! monitored endpoint set, apply the emergency pause and per-endpoint
//! gates, then reconcile the desired fetcher set against the running
//! one with per-fetcher control channels. Config errors are fatal on
//! the very first iteration only; afterwards the last good state is
//! kept running.

use crate::config::Datastore;
use crate::core::Core;
use crate::discovery;
use crate::fetch::{RECO_METRIC_NAME, RECO_PREFIX};
use crate::fetcher;
use anyhow::{Context, Result};
use chrono::Utc;
use pgsentry_common::types::{
    ControlMessage, MetricRow, MetricValue, MonitoredDatabase, StoreMessage, EPOCH_COLUMN_NAME,
    TAG_PREFIX,
};
use pgsentry_metrics::loader;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// Minimum seconds between metric definition rescans.
const METRIC_DEFINITION_REFRESH_S: i64 = 120;
/// Synthetic metric carrying the monitored endpoint listing.
const MONITORED_DBS_SYNC_METRIC: &str = "configured_dbs";
/// An empty database is slightly below this; smaller floors are noise.
const MIN_SIZE_FLOOR_MB: i64 = 8;

type FetcherKey = (String, String);

pub struct Supervisor {
    core: Arc<Core>,
    store_tx: mpsc::Sender<Vec<StoreMessage>>,
    control_channels: HashMap<FetcherKey, mpsc::Sender<ControlMessage>>,
    intervals: HashMap<FetcherKey, f64>,
    last_metrics_refresh: i64,
    last_monitored_sync: Option<Instant>,
    probed_ok: HashSet<String>,
    failed_initial_connect: HashSet<String>,
    last_recovery_state: HashMap<String, bool>,
    prev_loop_dbs: Vec<MonitoredDatabase>,
    first_loop: bool,
}

impl Supervisor {
    pub fn new(core: Arc<Core>, store_tx: mpsc::Sender<Vec<StoreMessage>>) -> Self {
        Self {
            core,
            store_tx,
            control_channels: HashMap::new(),
            intervals: HashMap::new(),
            last_metrics_refresh: 0,
            last_monitored_sync: None,
            probed_ok: HashSet::new(),
            failed_initial_connect: HashSet::new(),
            last_recovery_state: HashMap::new(),
            prev_loop_dbs: Vec::new(),
            first_loop: true,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let refresh_interval =
            Duration::from_secs(self.core.config.connection.servers_refresh_loop_seconds.max(1));
        loop {
            if let Err(e) = self.iteration().await {
                if self.first_loop {
                    return Err(e);
                }
                tracing::error!(error = %e, "supervisor iteration failed, using last valid configuration");
            }
            self.first_loop = false;

            tokio::select! {
                _ = tokio::time::sleep(refresh_interval) => {}
                _ = shutdown.changed() => {
                    self.stop_all_fetchers().await;
                    return Ok(());
                }
            }
        }
    }

    async fn stop_all_fetchers(&mut self) {
        let count = self.control_channels.len();
        for (_, control_tx) in self.control_channels.drain() {
            let _ = control_tx.send(ControlMessage::Stop).await;
        }
        self.intervals.clear();
        tracing::info!(fetchers = count, "sent stop to all gatherers");
    }

    async fn iteration(&mut self) -> Result<()> {
        self.refresh_metric_definitions()?;

        let mut monitored = self.load_monitored_set().await?;

        let triggerfile = &self.core.config.gatherer.emergency_pause_triggerfile;
        if !triggerfile.is_empty() && Path::new(triggerfile).exists() {
            tracing::warn!(
                path = %triggerfile,
                "emergency pause triggerfile detected, ignoring currently configured DBs"
            );
            monitored.clear();
        }

        self.core.update_monitored(&monitored);

        let sync_due = self.last_monitored_sync.map_or(true, |t| {
            t.elapsed()
                >= Duration::from_secs(
                    self.core.config.gatherer.monitored_dbs_sync_interval_seconds,
                )
        });
        if sync_due && !monitored.is_empty() {
            let _ = self
                .store_tx
                .send(monitored_dbs_snapshot_messages(&monitored))
                .await;
            self.last_monitored_sync = Some(Instant::now());
        }

        tracing::info!(
            endpoints = monitored.len(),
            metrics = self.core.registry.metric_count(),
            "host info refreshed"
        );

        let mut hosts_to_shut_down: HashSet<String> = HashSet::new();
        for md in &monitored {
            self.reconcile_endpoint(md, &mut hosts_to_shut_down).await;
        }

        self.shut_down_stale_fetchers(&hosts_to_shut_down).await;
        self.close_removed_resources(&monitored, &hosts_to_shut_down);

        self.prev_loop_dbs = monitored;
        Ok(())
    }

    fn refresh_metric_definitions(&mut self) -> Result<()> {
        let now = Utc::now().timestamp();
        if now - self.last_metrics_refresh <= METRIC_DEFINITION_REFRESH_S {
            return Ok(());
        }
        let folder = Path::new(&self.core.config.metrics.folder);
        match loader::read_metrics_from_folder(folder) {
            Ok(loaded) => {
                self.core
                    .registry
                    .replace(loaded.defs, loaded.storage_name_remaps);
                self.last_metrics_refresh = now;
            }
            Err(e) => {
                if self.first_loop {
                    return Err(e).context("could not read metric definitions");
                }
                tracing::error!(error = %e, "could not refresh metric definitions");
            }
        }
        match loader::read_preset_configs(folder) {
            Ok(presets) => {
                *self.core.presets.write().unwrap_or_else(|p| p.into_inner()) = presets;
            }
            Err(e) => {
                if self.first_loop {
                    return Err(e).context("could not read preset metric config");
                }
                tracing::error!(error = %e, "could not read preset metric config");
            }
        }
        Ok(())
    }

    async fn load_monitored_set(&mut self) -> Result<Vec<MonitoredDatabase>> {
        let config_path = self.core.config.connection.config_path.clone();
        let entries = discovery::read_monitoring_config(Path::new(&config_path))
            .context("could not read monitoring config")?;

        let (entries, removed) =
            discovery::filter_by_group(entries, &self.core.config.gatherer.group);
        if removed > 0 {
            tracing::info!(removed, "filtered out config entries based on group filter");
        }

        let presets = self
            .core
            .presets
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let mut entries = discovery::apply_presets(entries, &presets);
        discovery::decrypt_passwords(&mut entries, self.core.config.aes_keyphrase().as_deref());

        Ok(discovery::expand_discovery_entries(entries).await)
    }

    async fn reconcile_endpoint(
        &mut self,
        md: &MonitoredDatabase,
        hosts_to_shut_down: &mut HashSet<String>,
    ) {
        let db_unique = md.unique_name.clone();
        let was_dormant = self.core.descriptors.is_dormant(&db_unique);
        let mut metric_config = md.metrics.clone();

        self.core.connections.register(md).await;

        // no fetchers before one successful connectivity probe
        if !self.probed_ok.contains(&db_unique) {
            if self.failed_initial_connect.contains(&db_unique) {
                tracing::info!(db = %db_unique, "retrying to connect to uninitialized DB");
            } else {
                tracing::info!(db = %db_unique, "new host found, checking connectivity");
            }
            match self
                .core
                .descriptors
                .version_info(&self.core.connections, &db_unique, md.kind, true)
                .await
            {
                Ok(ver) => {
                    tracing::info!(
                        db = %db_unique,
                        version = %ver.version_str,
                        in_recovery = ver.is_in_recovery,
                        "connect OK"
                    );
                    self.failed_initial_connect.remove(&db_unique);
                    self.probed_ok.insert(db_unique.clone());
                    self.last_recovery_state
                        .insert(db_unique.clone(), ver.is_in_recovery);
                    if ver.is_in_recovery && md.only_if_master {
                        tracing::info!(db = %db_unique, "not added to monitoring due to master-only property");
                        self.core.descriptors.set_recovery_ignored(&db_unique, true);
                        return;
                    }
                    // stagger startup against a fetch stampede
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => {
                    tracing::error!(
                        db = %db_unique,
                        error = %e,
                        "could not start metric gathering due to connection problem"
                    );
                    self.failed_initial_connect.insert(db_unique.clone());
                    return;
                }
            }
        }

        if md.kind.is_postgres_family() {
            if !self
                .apply_postgres_gates(md, &mut metric_config, hosts_to_shut_down)
                .await
            {
                return;
            }
            if was_dormant && !self.core.descriptors.is_dormant(&db_unique) {
                tracing::debug!(db = %db_unique, "re-instating connection pool limits for previously dormant DB");
                self.core.connections.set_dormant(&db_unique, false);
            }
        }

        // pull mode without background fetchers: scrape-time fetching
        let datastore = self.core.config.datastore().ok();
        if datastore == Some(Datastore::Prometheus)
            && !self.core.config.metrics.prometheus_async_mode
        {
            return;
        }
        if datastore == Some(Datastore::Prometheus) {
            self.core.snapshot_cache.register_db(&db_unique);
        }

        for (config_key, interval) in metric_config.clone() {
            let metric = if config_key.starts_with(RECO_PREFIX) {
                RECO_METRIC_NAME.to_string()
            } else {
                config_key
            };
            let interval = metric_config.get(&metric).copied().unwrap_or(interval);
            let def_ok = metric == RECO_METRIC_NAME || self.core.registry.has_metric(&metric);
            let key = (db_unique.clone(), metric.clone());
            let running = self.control_channels.contains_key(&key);

            if def_ok && !running {
                if interval > 0.0 {
                    tracing::info!(db = %db_unique, metric = %metric, interval, "starting gatherer");
                    let (control_tx, control_rx) = mpsc::channel(1);
                    self.control_channels.insert(key.clone(), control_tx);
                    self.intervals.insert(key, interval);
                    tokio::spawn(fetcher::metric_gatherer_loop(
                        Arc::clone(&self.core),
                        db_unique.clone(),
                        md.unique_name_orig.clone(),
                        md.kind,
                        metric,
                        metric_config.clone(),
                        control_rx,
                        self.store_tx.clone(),
                    ));
                }
            } else if (!def_ok && running) || interval <= 0.0 {
                // definition files removed or interval zeroed
                tracing::warn!(db = %db_unique, metric = %metric, "shutting down gatherer");
                if let Some(control_tx) = self.control_channels.remove(&key) {
                    let _ = control_tx.send(ControlMessage::Stop).await;
                }
                self.intervals.remove(&key);
            } else if !def_ok {
                if self.core.should_complain_lookup(&metric) {
                    tracing::warn!(db = %db_unique, metric = %metric, "metric definition not found");
                }
            } else if self.intervals.get(&key) != Some(&interval) {
                tracing::warn!(db = %db_unique, metric = %metric, interval, "sending interval update");
                if let Some(control_tx) = self.control_channels.get(&key) {
                    let _ = control_tx
                        .send(ControlMessage::Start(metric_config.clone()))
                        .await;
                }
                self.intervals.insert(key, interval);
            }
        }
    }

    /// Size and role gating for full PostgreSQL endpoints. Returns
    /// false when the endpoint must not run fetchers this iteration,
    /// with `metric_config` possibly switched to the standby map.
    async fn apply_postgres_gates(
        &mut self,
        md: &MonitoredDatabase,
        metric_config: &mut HashMap<String, f64>,
        hosts_to_shut_down: &mut HashSet<String>,
    ) -> bool {
        let db_unique = &md.unique_name;

        if self.core.config.gatherer.min_db_size_mb >= MIN_SIZE_FLOOR_MB {
            let size_mb = self
                .core
                .descriptors
                .db_size_mb(&self.core.connections, db_unique)
                .await;
            // only gate when the size is actually known
            if size_mb != 0 {
                if size_mb < self.core.config.gatherer.min_db_size_mb {
                    tracing::info!(
                        db = %db_unique,
                        size_mb,
                        "DB ignored due to the minimum size filter"
                    );
                    hosts_to_shut_down.insert(db_unique.clone());
                    self.core.descriptors.set_undersized(db_unique, true);
                    self.core.connections.set_dormant(db_unique, true);
                    return false;
                }
                self.core.descriptors.set_undersized(db_unique, false);
            }
        }

        let ver = match self
            .core
            .descriptors
            .version_info(&self.core.connections, db_unique, md.kind, false)
            .await
        {
            Ok(ver) => ver,
            // probe errors are retried on the next loop
            Err(_) => return true,
        };

        if ver.is_in_recovery && md.only_if_master {
            tracing::info!(db = %db_unique, "to be removed from monitoring due to master-only property and status change");
            hosts_to_shut_down.insert(db_unique.clone());
            self.core.descriptors.set_recovery_ignored(db_unique, true);
            self.core.connections.set_dormant(db_unique, true);
            return false;
        }

        let last_known = self
            .last_recovery_state
            .get(db_unique)
            .copied()
            .unwrap_or(false);
        if last_known != ver.is_in_recovery {
            if ver.is_in_recovery && !md.metrics_standby.is_empty() {
                tracing::warn!(db = %db_unique, "switching metrics collection to standby config");
                *metric_config = md.metrics_standby.clone();
            } else {
                tracing::warn!(db = %db_unique, "switching metrics collection to primary config");
                *metric_config = md.metrics.clone();
                self.core.descriptors.set_recovery_ignored(db_unique, false);
            }
            self.last_recovery_state
                .insert(db_unique.clone(), ver.is_in_recovery);
        } else if ver.is_in_recovery && !md.metrics_standby.is_empty() {
            *metric_config = md.metrics_standby.clone();
        }

        true
    }

    /// Stop fetchers whose endpoint disappeared, lost its role, or
    /// whose metric was removed from the interval map.
    async fn shut_down_stale_fetchers(&mut self, hosts_to_shut_down: &HashSet<String>) {
        let keys: Vec<FetcherKey> = self.control_channels.keys().cloned().collect();
        let mut stopped = 0usize;

        for key in keys {
            let (db, metric) = key.clone();
            let whole_db_down = hosts_to_shut_down.contains(&db);
            let db_info = self.core.monitored_db(&db);
            let removed = db_info.is_none();

            let mut single_metric_disabled = false;
            if !whole_db_down && !removed {
                let md = db_info.expect("endpoint present");
                let in_recovery = self
                    .core
                    .descriptors
                    .cached_version(&db)
                    .map(|v| v.is_in_recovery)
                    .unwrap_or(false);
                let current_config = if in_recovery && !md.metrics_standby.is_empty() {
                    &md.metrics_standby
                } else {
                    &md.metrics
                };
                let lookup_key = if metric == RECO_METRIC_NAME {
                    // any reco_* entry keeps the recommendations fetcher alive
                    current_config
                        .keys()
                        .find(|k| k.starts_with(RECO_PREFIX) || *k == RECO_METRIC_NAME)
                        .cloned()
                        .unwrap_or_else(|| metric.clone())
                } else {
                    metric.clone()
                };
                let interval = current_config.get(&lookup_key).copied().unwrap_or(0.0);
                single_metric_disabled = interval <= 0.0;
            }

            if whole_db_down || removed || single_metric_disabled {
                tracing::info!(db = %db, metric = %metric, "shutting down gatherer");
                if let Some(control_tx) = self.control_channels.remove(&key) {
                    let _ = control_tx.send(ControlMessage::Stop).await;
                }
                self.intervals.remove(&key);
                self.core.descriptors.clear_unreachable(&db);
                self.core.snapshot_cache.purge(&db, Some(&metric));
                stopped += 1;
            }
        }

        if stopped > 0 {
            tracing::warn!(stopped, "sent stop to gatherers (they may take up to one interval to exit)");
        }
    }

    /// Release connections and caches for endpoints that left the
    /// config; role-shutdown endpoints stay registered but dormant.
    fn close_removed_resources(
        &mut self,
        current: &[MonitoredDatabase],
        hosts_to_shut_down: &HashSet<String>,
    ) {
        let current_names: HashSet<&str> =
            current.iter().map(|md| md.unique_name.as_str()).collect();
        let removed: Vec<String> = self
            .prev_loop_dbs
            .iter()
            .map(|md| md.unique_name.clone())
            .filter(|name| !current_names.contains(name.as_str()))
            .collect();
        for name in removed {
            tracing::debug!(db = %name, "closing resources for removed endpoint");
            self.core.connections.close(&name);
            self.core.descriptors.remove(&name);
            self.core.snapshot_cache.purge(&name, None);
            self.probed_ok.remove(&name);
            self.failed_initial_connect.remove(&name);
            self.last_recovery_state.remove(&name);
        }

        for db in hosts_to_shut_down {
            self.core.snapshot_cache.purge(db, None);
        }
    }
}

/// One synthetic `configured_dbs` row per monitored endpoint, so the
/// sink carries a record of what was being watched and when.
pub fn monitored_dbs_snapshot_messages(dbs: &[MonitoredDatabase]) -> Vec<StoreMessage> {
    let now_ns = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    dbs.iter()
        .map(|md| {
            let mut row = MetricRow::new();
            row.insert("tag_group".to_string(), MetricValue::Text(md.group.clone()));
            row.insert(
                "master_only".to_string(),
                MetricValue::Int(md.only_if_master as i64),
            );
            row.insert(EPOCH_COLUMN_NAME.to_string(), MetricValue::Int(now_ns));
            row.insert(
                "continuous_discovery_prefix".to_string(),
                MetricValue::Text(md.unique_name_orig.clone()),
            );
            for (key, value) in &md.custom_tags {
                row.insert(
                    format!("{TAG_PREFIX}{key}"),
                    MetricValue::Text(value.clone()),
                );
            }
            StoreMessage {
                db_unique: md.unique_name.clone(),
                kind: md.kind,
                metric_name: MONITORED_DBS_SYNC_METRIC.to_string(),
                custom_tags: md.custom_tags.clone(),
                data: vec![row],
                ..Default::default()
            }
        })
        .collect()
}
