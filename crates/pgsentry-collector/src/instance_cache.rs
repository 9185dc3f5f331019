//! Instance-level metric cache.
//!
//! Continuous-discovery siblings live on one physical instance, so an
//! instance-scoped metric fetched for one child is valid for all of
//! them. Keyed by the original (pre-discovery) endpoint name plus the
//! metric name. Timestamps and data sit under separate locks; the
//! staleness check happens under the timestamp lock only, so a read
//! can race a concurrent refresh and at worst trigger one extra query.

use chrono::{DateTime, Utc};
use pgsentry_common::types::MetricData;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

type Key = (String, String);

#[derive(Default)]
pub struct InstanceCache {
    data: Mutex<HashMap<Key, MetricData>>,
    stamps: Mutex<HashMap<Key, DateTime<Utc>>>,
}

impl InstanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the cached rows, if present and younger than
    /// `max_age`. The copy keeps downstream mutation away from the
    /// cache.
    pub fn get_if_fresh(
        &self,
        db_unique_orig: &str,
        metric: &str,
        max_age: Duration,
    ) -> Option<MetricData> {
        let key = (db_unique_orig.to_string(), metric.to_string());
        {
            let stamps = self.stamps.lock().unwrap_or_else(|p| p.into_inner());
            let stamp = stamps.get(&key)?;
            let age = (Utc::now() - *stamp).to_std().unwrap_or_default();
            if age > max_age {
                return None;
            }
        }
        let data = self.data.lock().unwrap_or_else(|p| p.into_inner());
        data.get(&key).cloned()
    }

    /// Store a copy of freshly fetched rows. Empty results are not
    /// cached, an empty hit would mask the sibling's own fetch.
    pub fn put(&self, db_unique_orig: &str, metric: &str, data: &MetricData) {
        if data.is_empty() {
            return;
        }
        let key = (db_unique_orig.to_string(), metric.to_string());
        self.data
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.clone(), data.clone());
        self.stamps
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key, Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgsentry_common::types::{MetricRow, MetricValue};

    fn rows() -> MetricData {
        let mut row = MetricRow::new();
        row.insert("epoch_ns".into(), MetricValue::Int(1));
        row.insert("numbackends".into(), MetricValue::Int(5));
        vec![row]
    }

    #[test]
    fn fresh_entries_are_returned_as_copies() {
        let cache = InstanceCache::new();
        cache.put("parent", "db_stats", &rows());

        let mut hit = cache
            .get_if_fresh("parent", "db_stats", Duration::from_secs(30))
            .unwrap();
        hit[0].insert("numbackends".into(), MetricValue::Int(99));

        // mutation of the copy must not leak back
        let hit2 = cache
            .get_if_fresh("parent", "db_stats", Duration::from_secs(30))
            .unwrap();
        assert_eq!(hit2[0].get("numbackends"), Some(&MetricValue::Int(5)));
    }

    #[test]
    fn misses_on_unknown_key_and_empty_data() {
        let cache = InstanceCache::new();
        assert!(cache
            .get_if_fresh("parent", "db_stats", Duration::from_secs(30))
            .is_none());
        cache.put("parent", "db_stats", &MetricData::new());
        assert!(cache
            .get_if_fresh("parent", "db_stats", Duration::from_secs(30))
            .is_none());
    }

    #[test]
    fn zero_max_age_rejects_everything_stale() {
        let cache = InstanceCache::new();
        cache.put("parent", "db_stats", &rows());
        // a zero window only accepts entries written this very instant;
        // sleep past it to make the outcome deterministic
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(cache
            .get_if_fresh("parent", "db_stats", Duration::from_millis(1))
            .is_none());
    }
}
