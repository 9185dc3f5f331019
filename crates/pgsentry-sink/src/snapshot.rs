//! Pull-mode snapshot cache.
//!
//! In async pull mode nothing is written out of process: the persister
//! parks the latest result per (endpoint, metric) here and the scrape
//! handler serves from it. Entries appear only for endpoints the
//! supervisor has registered, and are purged when an endpoint or
//! metric leaves the monitored set or a fetch comes back empty.

use anyhow::Result;
use async_trait::async_trait;
use pgsentry_common::types::StoreMessage;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Default)]
pub struct SnapshotCache {
    entries: RwLock<HashMap<String, HashMap<String, Vec<StoreMessage>>>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the per-endpoint slot; writes land only on registered
    /// endpoints.
    pub fn register_db(&self, db_unique: &str) {
        self.entries
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .entry(db_unique.to_string())
            .or_default();
    }

    pub fn put(&self, db_unique: &str, metric: &str, batch: Vec<StoreMessage>) {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        if let Some(per_metric) = entries.get_mut(db_unique) {
            per_metric.insert(metric.to_string(), batch);
        }
    }

    /// Drop one metric's snapshot, or the whole endpoint when `metric`
    /// is `None`.
    pub fn purge(&self, db_unique: &str, metric: Option<&str>) {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        match metric {
            Some(metric) => {
                if let Some(per_metric) = entries.get_mut(db_unique) {
                    per_metric.remove(metric);
                }
            }
            None => {
                entries.remove(db_unique);
            }
        }
    }

    /// Everything cached for one endpoint, for the scrape handler.
    pub fn get_db(&self, db_unique: &str) -> Vec<StoreMessage> {
        self.entries
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(db_unique)
            .map(|per_metric| per_metric.values().flatten().cloned().collect())
            .unwrap_or_default()
    }
}

/// Sink adapter parking batches in a shared [`SnapshotCache`].
pub struct SnapshotSink {
    name: String,
    cache: Arc<SnapshotCache>,
}

impl SnapshotSink {
    pub fn new(name: impl Into<String>, cache: Arc<SnapshotCache>) -> Self {
        Self {
            name: name.into(),
            cache,
        }
    }
}

#[async_trait]
impl crate::MetricsSink for SnapshotSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&mut self, batch: &[StoreMessage]) -> Result<()> {
        // no batching in pull mode, each batch is one fetch result
        let Some(first) = batch.first() else {
            return Ok(());
        };
        if first.data.is_empty() {
            return Ok(());
        }
        self.cache
            .put(&first.db_unique, &first.metric_name, batch.to_vec());
        tracing::debug!(
            db = %first.db_unique,
            metric = %first.metric_name,
            rows = first.data.len(),
            "snapshot cache updated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MetricsSink;
    use pgsentry_common::types::{MetricRow, MetricValue};

    fn batch(db: &str, metric: &str, rows: usize) -> Vec<StoreMessage> {
        let data = (0..rows)
            .map(|i| {
                let mut row = MetricRow::new();
                row.insert("epoch_ns".into(), MetricValue::Int(i as i64));
                row
            })
            .collect();
        vec![StoreMessage {
            db_unique: db.into(),
            metric_name: metric.into(),
            data,
            ..Default::default()
        }]
    }

    #[tokio::test]
    async fn writes_require_a_registered_endpoint() {
        let cache = Arc::new(SnapshotCache::new());
        let mut sink = SnapshotSink::new("snapshot", Arc::clone(&cache));

        sink.write(&batch("db1", "m", 2)).await.unwrap();
        assert!(cache.get_db("db1").is_empty());

        cache.register_db("db1");
        sink.write(&batch("db1", "m", 2)).await.unwrap();
        assert_eq!(cache.get_db("db1").len(), 1);
    }

    #[tokio::test]
    async fn empty_results_do_not_overwrite() {
        let cache = Arc::new(SnapshotCache::new());
        cache.register_db("db1");
        let mut sink = SnapshotSink::new("snapshot", Arc::clone(&cache));

        sink.write(&batch("db1", "m", 2)).await.unwrap();
        sink.write(&batch("db1", "m", 0)).await.unwrap();
        assert_eq!(cache.get_db("db1").len(), 1);
    }

    #[test]
    fn purge_metric_and_whole_endpoint() {
        let cache = SnapshotCache::new();
        cache.register_db("db1");
        cache.put("db1", "m1", batch("db1", "m1", 1));
        cache.put("db1", "m2", batch("db1", "m2", 1));

        cache.purge("db1", Some("m1"));
        assert_eq!(cache.get_db("db1").len(), 1);

        cache.purge("db1", None);
        assert!(cache.get_db("db1").is_empty());
    }
}
