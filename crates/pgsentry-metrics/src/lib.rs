//! Versioned SQL metric definitions.
//!
//! Definitions are keyed by metric name, then by the minimum server
//! version a variant supports. The registry holds the in-memory map
//! behind a reader-writer lock; resolution always works on a cloned
//! snapshot so no lock is held across recursive lookups.

pub mod error;
pub mod loader;
pub mod resolver;
pub mod schedule;

use pgsentry_common::types::{MetricVersionDef, VersionInfo};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

pub use error::MetricLookupError;

/// metric name -> minimum server version -> variant. The inner map is
/// ordered, which is what greatest-version-not-above selection needs.
pub type MetricDefs = HashMap<String, BTreeMap<Decimal, MetricVersionDef>>;

/// In-memory store of metric definitions plus the storage-name remap
/// table derived from them. Swapped wholesale on refresh.
#[derive(Default)]
pub struct MetricRegistry {
    defs: RwLock<MetricDefs>,
    storage_name_remaps: RwLock<HashMap<String, String>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all definitions atomically, e.g. after a folder rescan
    /// or a control-database refresh.
    pub fn replace(&self, defs: MetricDefs, remaps: HashMap<String, String>) {
        let count = defs.len();
        *self.defs.write().unwrap_or_else(|p| p.into_inner()) = defs;
        *self
            .storage_name_remaps
            .write()
            .unwrap_or_else(|p| p.into_inner()) = remaps;
        tracing::debug!(metrics = count, "metric definitions refreshed");
    }

    /// A deep copy of the current definition map.
    pub fn snapshot(&self) -> MetricDefs {
        self.defs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn has_metric(&self, metric: &str) -> bool {
        self.defs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(metric)
    }

    pub fn metric_count(&self) -> usize {
        self.defs.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Names of all metrics with the given prefix.
    pub fn metric_names_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.defs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// The sink-side name a metric's results are stored under, when the
    /// definition remaps it.
    pub fn storage_name_for(&self, metric: &str) -> Option<String> {
        self.storage_name_remaps
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(metric)
            .cloned()
    }

    /// Resolve the variant for a metric against a server's version and
    /// extension set. Operates on a snapshot of the definitions.
    pub fn resolve(
        &self,
        metric: &str,
        vinfo: &VersionInfo,
    ) -> Result<MetricVersionDef, MetricLookupError> {
        let defs = self.snapshot();
        resolver::resolve(&defs, metric, vinfo)
    }
}
