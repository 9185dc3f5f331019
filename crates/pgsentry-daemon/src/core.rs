//! The shared state of one gatherer process.
//!
//! Everything the fetchers, supervisor, and stats endpoint share is
//! owned here and passed around as one `Arc<Core>`; the only globals
//! are the statistics counters.

use crate::config::DaemonConfig;
use chrono::Utc;
use pgsentry_collector::{ConnectionManager, DescriptorCache, InstanceCache};
use pgsentry_common::types::MonitoredDatabase;
use pgsentry_metrics::MetricRegistry;
use pgsentry_sink::snapshot::SnapshotCache;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Missing-definition complaints are logged at most once per hour per
/// key.
const LOOKUP_COMPLAINT_INTERVAL_S: i64 = 3600;

pub struct Core {
    pub config: DaemonConfig,
    pub registry: MetricRegistry,
    pub presets: RwLock<HashMap<String, HashMap<String, f64>>>,
    pub monitored: RwLock<HashMap<String, MonitoredDatabase>>,
    pub descriptors: DescriptorCache,
    pub connections: ConnectionManager,
    pub instance_cache: InstanceCache,
    pub snapshot_cache: Arc<SnapshotCache>,
    lookup_complaints: Mutex<HashMap<String, i64>>,
}

impl Core {
    pub fn new(config: DaemonConfig) -> Self {
        let max_parallel = config.gatherer.max_parallel_connections_per_db;
        Self {
            config,
            registry: MetricRegistry::new(),
            presets: RwLock::new(HashMap::new()),
            monitored: RwLock::new(HashMap::new()),
            descriptors: DescriptorCache::new(),
            connections: ConnectionManager::new(max_parallel),
            instance_cache: InstanceCache::new(),
            snapshot_cache: Arc::new(SnapshotCache::new()),
            lookup_complaints: Mutex::new(HashMap::new()),
        }
    }

    pub fn monitored_db(&self, db_unique: &str) -> Option<MonitoredDatabase> {
        self.monitored
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(db_unique)
            .cloned()
    }

    pub fn update_monitored(&self, dbs: &[MonitoredDatabase]) {
        let next: HashMap<String, MonitoredDatabase> = dbs
            .iter()
            .map(|md| (md.unique_name.clone(), md.clone()))
            .collect();
        *self.monitored.write().unwrap_or_else(|p| p.into_inner()) = next;
    }

    /// (configured, monitored) endpoint counts: configured includes
    /// dormant endpoints, monitored does not.
    pub fn monitored_counts(&self) -> (usize, usize) {
        let monitored = self.monitored.read().unwrap_or_else(|p| p.into_inner());
        let configured = monitored.len();
        let active = monitored
            .keys()
            .filter(|db| !self.descriptors.is_dormant(db))
            .count();
        (configured, active)
    }

    /// Rate limit for "definition not found" style complaints: true
    /// when this key has not been complained about within the hour.
    pub fn should_complain_lookup(&self, key: &str) -> bool {
        let now = Utc::now().timestamp();
        let mut complaints = self
            .lookup_complaints
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        match complaints.get(key) {
            Some(last) if now - last <= LOOKUP_COMPLAINT_INTERVAL_S => false,
            _ => {
                complaints.insert(key.to_string(), now);
                true
            }
        }
    }
}
