//! Server descriptor cache.
//!
//! Tracks what is known about each monitored endpoint: version,
//! recovery role, extensions, execution environment, approximate size,
//! and the three gating states (unreachable, undersized,
//! recovery-ignored). Version probes are serialized per endpoint so a
//! freshly discovered instance with dozens of child databases is hit
//! by exactly one probe connection at a time.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

use pgsentry_common::types::{DbKind, ExecEnv, MetricValue, VersionInfo};

use crate::manager::ConnectionManager;
use crate::rows;

/// Version info is refreshed at most this often per endpoint.
pub const VERSION_STALENESS: Duration = Duration::from_secs(300);
/// Size probing runs at most this often per endpoint.
pub const SIZE_CACHING_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// Extension listings exist from this server version on.
pub const MIN_EXTENSION_INFO_VERSION: &str = "9.1";

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// "4.1.2 (karasukiboshi)" or "PgBouncer 1.12.0" -> 4.1 / 1.12
fn major_minor_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+\.\d+").expect("valid regex"))
}

fn leading_version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+(\.\d+)?").expect("valid regex"))
}

/// Leading `major[.minor]` of a version-ish string as a decimal.
pub fn version_prefix(s: &str) -> Option<Decimal> {
    leading_version_re()
        .find(s)
        .and_then(|m| Decimal::from_str(m.as_str()).ok())
}

#[derive(Default)]
pub struct DescriptorCache {
    versions: RwLock<HashMap<String, VersionInfo>>,
    probe_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    unreachable: RwLock<HashMap<String, DateTime<Utc>>>,
    undersized: RwLock<HashMap<String, bool>>,
    recovery_ignored: RwLock<HashMap<String, bool>>,
    size_cache: RwLock<HashMap<String, (i64, DateTime<Utc>)>>,
}

impl DescriptorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached_version(&self, db_unique: &str) -> Option<VersionInfo> {
        self.versions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(db_unique)
            .cloned()
    }

    fn probe_lock(&self, db_unique: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.probe_locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(
            locks
                .entry(db_unique.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Current version info for an endpoint, probing the server when
    /// the cached entry is older than [`VERSION_STALENESS`] or `force`
    /// is set. Only one connection-based probe runs per endpoint.
    pub async fn version_info(
        &self,
        manager: &ConnectionManager,
        db_unique: &str,
        kind: DbKind,
        force: bool,
    ) -> Result<VersionInfo> {
        if !force {
            if let Some(cached) = self.cached_version(db_unique) {
                let age = Utc::now() - cached.last_checked_on;
                if age.to_std().unwrap_or_default() < VERSION_STALENESS {
                    return Ok(cached);
                }
            }
        }

        let lock = self.probe_lock(db_unique);
        let _guard = lock.lock().await;

        // another task may have refreshed while we waited on the lock
        if !force {
            if let Some(cached) = self.cached_version(db_unique) {
                let age = Utc::now() - cached.last_checked_on;
                if age.to_std().unwrap_or_default() < VERSION_STALENESS {
                    return Ok(cached);
                }
            }
        }

        let previous = self.cached_version(db_unique);
        let mut info = match kind {
            DbKind::Pgbouncer => self.probe_pool_version(manager, db_unique, "SHOW VERSION").await?,
            DbKind::Pgpool => {
                self.probe_pool_version(manager, db_unique, "SHOW POOL_VERSION")
                    .await?
            }
            _ => self.probe_postgres(manager, db_unique).await?,
        };
        info.last_checked_on = Utc::now();

        if let Some(prev) = previous {
            if prev.is_in_recovery != info.is_in_recovery {
                tracing::warn!(
                    db = %db_unique,
                    in_recovery = info.is_in_recovery,
                    "recovery state changed"
                );
            }
        }

        self.versions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(db_unique.to_string(), info.clone());
        Ok(info)
    }

    async fn probe_postgres(
        &self,
        manager: &ConnectionManager,
        db_unique: &str,
    ) -> Result<VersionInfo> {
        let mut info = VersionInfo::default();

        let messages = manager
            .execute(
                db_unique,
                Some(PROBE_TIMEOUT),
                "select current_setting('server_version') as ver, \
                 pg_is_in_recovery()::int as in_recovery, \
                 current_database() as real_dbname",
            )
            .await?;
        let data = rows::messages_to_data(&messages);
        let row = data
            .first()
            .ok_or_else(|| anyhow!("empty version probe result"))?;

        info.version_str = match row.get("ver") {
            Some(MetricValue::Text(s)) => s.clone(),
            Some(v) => v.as_f64().map(|f| f.to_string()).unwrap_or_default(),
            None => String::new(),
        };
        info.version = version_prefix(&info.version_str)
            .ok_or_else(|| anyhow!("unparseable server version: {}", info.version_str))?;
        info.is_in_recovery = row.get("in_recovery").and_then(|v| v.as_i64()) == Some(1);
        info.real_dbname = match row.get("real_dbname") {
            Some(MetricValue::Text(s)) => s.clone(),
            _ => String::new(),
        };

        // the remaining probes are informative, failures tolerated
        if let Ok(messages) = manager
            .execute(
                db_unique,
                Some(PROBE_TIMEOUT),
                "select rolsuper::int as is_superuser from pg_catalog.pg_roles where rolname = session_user",
            )
            .await
        {
            info.is_superuser = rows::first_cell(&messages).and_then(|v| v.as_i64()) == Some(1);
        }

        let min_ext_version = Decimal::from_str(MIN_EXTENSION_INFO_VERSION).expect("valid decimal");
        if info.version >= min_ext_version {
            if let Ok(messages) = manager
                .execute(
                    db_unique,
                    Some(PROBE_TIMEOUT),
                    "select extname, extversion from pg_catalog.pg_extension",
                )
                .await
            {
                for row in rows::messages_to_data(&messages) {
                    let name = match row.get("extname") {
                        Some(MetricValue::Text(s)) => s.clone(),
                        _ => continue,
                    };
                    let raw = match row.get("extversion") {
                        Some(MetricValue::Text(s)) => s.clone(),
                        Some(v) => v.as_f64().map(|f| f.to_string()).unwrap_or_default(),
                        None => continue,
                    };
                    match version_prefix(&raw) {
                        Some(ver) => {
                            info.extensions.insert(name, ver);
                        }
                        None => {
                            tracing::debug!(db = %db_unique, ext = %name, version = %raw, "unparseable extension version");
                        }
                    }
                }
            }
        }

        if let Ok(messages) = manager
            .execute(
                db_unique,
                Some(PROBE_TIMEOUT),
                "select system_identifier::text as sys_id from pg_control_system()",
            )
            .await
        {
            // numeric narrowing kicks in on the identifier, map it back
            if let Some(value) = rows::first_cell(&messages) {
                info.system_identifier = match value {
                    MetricValue::Text(s) => s,
                    MetricValue::Int(i) => i.to_string(),
                    MetricValue::Float(f) => format!("{f:.0}"),
                    MetricValue::Null => String::new(),
                };
            }
        }

        info.exec_env = self.probe_exec_env(manager, db_unique).await;

        if let Ok(messages) = manager
            .execute(
                db_unique,
                Some(PROBE_TIMEOUT),
                "select (current_setting('block_size')::int8 * \
                 (select sum(relpages) from pg_catalog.pg_class where relpersistence != 't'))::int8 \
                 as approx_size_b",
            )
            .await
        {
            info.approx_db_size_b = rows::first_cell(&messages)
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
        }

        Ok(info)
    }

    async fn probe_exec_env(&self, manager: &ConnectionManager, db_unique: &str) -> ExecEnv {
        let sql = "select case \
                   when exists (select 1 from pg_settings where name = 'azure.extensions') then 'AZURE_FLEXIBLE' \
                   when exists (select 1 from pg_settings where name like 'azure.%') then 'AZURE_SINGLE' \
                   when exists (select 1 from pg_settings where name like 'cloudsql.%') then 'GOOGLE' \
                   else 'UNKNOWN' end as exec_env";
        match manager.execute(db_unique, Some(PROBE_TIMEOUT), sql).await {
            Ok(messages) => match rows::first_cell(&messages) {
                Some(MetricValue::Text(s)) => match s.as_str() {
                    "AZURE_FLEXIBLE" => ExecEnv::AzureFlexible,
                    "AZURE_SINGLE" => ExecEnv::AzureSingle,
                    "GOOGLE" => ExecEnv::Google,
                    _ => ExecEnv::Unknown,
                },
                _ => ExecEnv::Unknown,
            },
            Err(_) => ExecEnv::Unknown,
        }
    }

    async fn probe_pool_version(
        &self,
        manager: &ConnectionManager,
        db_unique: &str,
        show_sql: &str,
    ) -> Result<VersionInfo> {
        let messages = manager.execute(db_unique, None, show_sql).await?;
        let mut info = VersionInfo::default();
        info.version_str = match rows::first_cell(&messages) {
            Some(MetricValue::Text(s)) => s,
            Some(MetricValue::Float(f)) => f.to_string(),
            Some(MetricValue::Int(i)) => i.to_string(),
            _ => return Err(anyhow!("empty {show_sql} result")),
        };
        info.version = major_minor_re()
            .find(&info.version_str)
            .and_then(|m| Decimal::from_str(m.as_str()).ok())
            .ok_or_else(|| anyhow!("unparseable pool version: {}", info.version_str))?;
        Ok(info)
    }

    /// Approximate size of the endpoint's database in megabytes, cached
    /// for [`SIZE_CACHING_INTERVAL`]. Returns 0 when unknown.
    pub async fn db_size_mb(&self, manager: &ConnectionManager, db_unique: &str) -> i64 {
        {
            let sizes = self.size_cache.read().unwrap_or_else(|p| p.into_inner());
            if let Some((size_mb, checked)) = sizes.get(db_unique) {
                let age = Utc::now() - *checked;
                if age.to_std().unwrap_or_default() < SIZE_CACHING_INTERVAL {
                    return *size_mb;
                }
            }
        }
        let size_mb = match manager
            .execute(
                db_unique,
                Some(PROBE_TIMEOUT),
                "select (pg_database_size(current_database()) / 1048576)::int8 as size_mb",
            )
            .await
        {
            Ok(messages) => rows::first_cell(&messages)
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            Err(e) => {
                tracing::debug!(db = %db_unique, error = %e, "size probe failed");
                return 0;
            }
        };
        self.size_cache
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(db_unique.to_string(), (size_mb, Utc::now()));
        size_mb
    }

    pub fn set_unreachable(&self, db_unique: &str) {
        self.unreachable
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(db_unique.to_string(), Utc::now());
    }

    pub fn clear_unreachable(&self, db_unique: &str) {
        self.unreachable
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(db_unique);
    }

    pub fn unreachable_count(&self) -> usize {
        self.unreachable
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    pub fn set_undersized(&self, db_unique: &str, state: bool) {
        self.undersized
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(db_unique.to_string(), state);
    }

    pub fn is_undersized(&self, db_unique: &str) -> bool {
        self.undersized
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(db_unique)
            .copied()
            .unwrap_or(false)
    }

    pub fn set_recovery_ignored(&self, db_unique: &str, state: bool) {
        self.recovery_ignored
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(db_unique.to_string(), state);
    }

    pub fn is_recovery_ignored(&self, db_unique: &str) -> bool {
        self.recovery_ignored
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(db_unique)
            .copied()
            .unwrap_or(false)
    }

    /// Dormant endpoints keep warm connections but no running fetchers.
    pub fn is_dormant(&self, db_unique: &str) -> bool {
        self.is_undersized(db_unique) || self.is_recovery_ignored(db_unique)
    }

    /// Forget every piece of per-endpoint state, on config removal.
    pub fn remove(&self, db_unique: &str) {
        self.versions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(db_unique);
        self.probe_locks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(db_unique);
        self.unreachable
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(db_unique);
        self.undersized
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(db_unique);
        self.recovery_ignored
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(db_unique);
        self.size_cache
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(db_unique);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_prefix_extraction() {
        assert_eq!(version_prefix("14.11 (Ubuntu 14.11-1)"), Some(Decimal::from_str("14.11").unwrap()));
        assert_eq!(version_prefix("9.6.24"), Some(Decimal::from_str("9.6").unwrap()));
        assert_eq!(version_prefix("nope"), None);
    }

    #[test]
    fn pool_version_regex() {
        let re = major_minor_re();
        assert_eq!(re.find("PgBouncer 1.12.0").unwrap().as_str(), "1.12");
        assert_eq!(re.find("4.1.2 (karasukiboshi)").unwrap().as_str(), "4.1");
    }

    #[test]
    fn gates_are_independent() {
        let cache = DescriptorCache::new();
        cache.set_undersized("db1", true);
        assert!(cache.is_undersized("db1"));
        assert!(!cache.is_recovery_ignored("db1"));
        assert!(cache.is_dormant("db1"));

        cache.set_undersized("db1", false);
        cache.set_recovery_ignored("db1", true);
        assert!(!cache.is_undersized("db1"));
        assert!(cache.is_dormant("db1"));

        cache.set_recovery_ignored("db1", false);
        assert!(!cache.is_dormant("db1"));
    }

    #[test]
    fn unreachable_tracking() {
        let cache = DescriptorCache::new();
        assert_eq!(cache.unreachable_count(), 0);
        cache.set_unreachable("db1");
        cache.set_unreachable("db2");
        assert_eq!(cache.unreachable_count(), 2);
        cache.clear_unreachable("db1");
        assert_eq!(cache.unreachable_count(), 1);
        cache.remove("db2");
        assert_eq!(cache.unreachable_count(), 0);
    }
}
