use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::str::FromStr;

/// Which sink family the gatherer writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datastore {
    Postgres,
    Graphite,
    Json,
    Prometheus,
}

impl FromStr for Datastore {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "postgres" => Ok(Datastore::Postgres),
            "graphite" => Ok(Datastore::Graphite),
            "json" => Ok(Datastore::Json),
            "prometheus" => Ok(Datastore::Prometheus),
            _ => Err(format!("unknown datastore: {s}")),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub gatherer: GathererConfig,
}

#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    /// Monitored endpoint YAML, a single file or a folder tree.
    #[serde(default = "default_config_path")]
    pub config_path: String,
    #[serde(default = "default_servers_refresh_loop_seconds")]
    pub servers_refresh_loop_seconds: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            config_path: default_config_path(),
            servers_refresh_loop_seconds: default_servers_refresh_loop_seconds(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    /// Root of the metric definition tree.
    pub folder: String,
    #[serde(default = "default_datastore")]
    pub datastore: String,
    /// Metrics store connection strings, up to two for HA fan-out.
    #[serde(default)]
    pub pg_store_conn_strs: Vec<String>,
    #[serde(default = "default_pg_schema_type")]
    pub pg_schema_type: String,
    #[serde(default = "default_pg_retention_days")]
    pub pg_retention_days: u32,
    #[serde(default)]
    pub graphite_host: String,
    #[serde(default = "default_graphite_port")]
    pub graphite_port: u16,
    #[serde(default)]
    pub json_storage_file: String,
    /// Background fetchers populating the pull snapshot cache. When
    /// false the scrape handler fetches on demand and no fetchers run.
    #[serde(default = "default_true")]
    pub prometheus_async_mode: bool,
}

#[derive(Debug, Deserialize)]
pub struct GathererConfig {
    #[serde(default = "default_batching_delay_ms")]
    pub batching_delay_ms: u64,
    /// Comma-separated group filter; empty monitors every group.
    #[serde(default)]
    pub group: String,
    /// Endpoints below this size are not monitored (0 disables).
    #[serde(default)]
    pub min_db_size_mb: i64,
    #[serde(default = "default_instance_cache_max_seconds")]
    pub instance_cache_max_seconds: u64,
    #[serde(default = "default_monitored_dbs_sync_interval_seconds")]
    pub monitored_dbs_sync_interval_seconds: u64,
    /// While this path exists the monitored set is treated as empty.
    #[serde(default)]
    pub emergency_pause_triggerfile: String,
    /// 0 disables the internal stats endpoint.
    #[serde(default = "default_stats_port")]
    pub stats_port: u16,
    #[serde(default)]
    pub aes_gcm_keyphrase: String,
    #[serde(default)]
    pub aes_gcm_keyphrase_file: String,
    #[serde(default)]
    pub add_real_dbname: bool,
    #[serde(default = "default_real_dbname_field")]
    pub real_dbname_field: String,
    #[serde(default)]
    pub add_system_identifier: bool,
    #[serde(default = "default_system_identifier_field")]
    pub system_identifier_field: String,
    /// Never rely on helper functions; metrics calling them use the
    /// superuser variant or are skipped.
    #[serde(default)]
    pub no_helper_functions: bool,
    #[serde(default = "default_max_parallel_connections_per_db")]
    pub max_parallel_connections_per_db: usize,
}

impl Default for GathererConfig {
    fn default() -> Self {
        // serde fills every field from its default fn; an empty TOML
        // table and a missing one must behave the same
        toml::from_str("").expect("empty gatherer config is valid")
    }
}

fn default_config_path() -> String {
    "config/instances.yaml".to_string()
}

fn default_servers_refresh_loop_seconds() -> u64 {
    120
}

fn default_datastore() -> String {
    "postgres".to_string()
}

fn default_pg_schema_type() -> String {
    "metric-time".to_string()
}

fn default_pg_retention_days() -> u32 {
    14
}

fn default_graphite_port() -> u16 {
    2003
}

fn default_batching_delay_ms() -> u64 {
    250
}

fn default_instance_cache_max_seconds() -> u64 {
    30
}

fn default_monitored_dbs_sync_interval_seconds() -> u64 {
    600
}

fn default_stats_port() -> u16 {
    8081
}

fn default_real_dbname_field() -> String {
    "real_dbname".to_string()
}

fn default_system_identifier_field() -> String {
    "sys_id".to_string()
}

fn default_max_parallel_connections_per_db() -> usize {
    2
}

fn default_true() -> bool {
    true
}

impl DaemonConfig {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("could not read config file {path}"))?;
        let config: Self = toml::from_str(&content).context("could not parse config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn datastore(&self) -> Result<Datastore> {
        self.metrics
            .datastore
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
    }

    fn validate(&self) -> Result<()> {
        let datastore = self.datastore()?;
        match datastore {
            Datastore::Postgres if self.metrics.pg_store_conn_strs.is_empty() => {
                bail!("datastore=postgres requires metrics.pg_store_conn_strs")
            }
            Datastore::Postgres if self.metrics.pg_store_conn_strs.len() > 2 => {
                bail!("at most two metrics store connection strings are supported")
            }
            Datastore::Graphite if self.metrics.graphite_host.is_empty() => {
                bail!("datastore=graphite requires metrics.graphite_host")
            }
            Datastore::Json if self.metrics.json_storage_file.is_empty() => {
                bail!("datastore=json requires metrics.json_storage_file")
            }
            _ => {}
        }
        self.metrics
            .pg_schema_type
            .parse::<pgsentry_sink::postgres::PartitionScheme>()
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(())
    }

    /// The decryption keyphrase, inline config winning over the file.
    pub fn aes_keyphrase(&self) -> Option<String> {
        if !self.gatherer.aes_gcm_keyphrase.is_empty() {
            return Some(self.gatherer.aes_gcm_keyphrase.clone());
        }
        if !self.gatherer.aes_gcm_keyphrase_file.is_empty() {
            match std::fs::read_to_string(&self.gatherer.aes_gcm_keyphrase_file) {
                Ok(content) => return Some(content.trim().to_string()),
                Err(e) => {
                    tracing::error!(
                        path = %self.gatherer.aes_gcm_keyphrase_file,
                        error = %e,
                        "could not read keyphrase file"
                    );
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
[metrics]
folder = "/etc/pgsentry/metrics"
datastore = "json"
json_storage_file = "/tmp/out.ndjson"
"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.connection.servers_refresh_loop_seconds, 120);
        assert_eq!(config.gatherer.batching_delay_ms, 250);
        assert_eq!(config.gatherer.max_parallel_connections_per_db, 2);
        assert_eq!(config.datastore().unwrap(), Datastore::Json);
    }

    #[test]
    fn postgres_requires_conn_strings() {
        let config: DaemonConfig = toml::from_str(
            r#"
[metrics]
folder = "/m"
datastore = "postgres"
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());

        let config: DaemonConfig = toml::from_str(
            r#"
[metrics]
folder = "/m"
datastore = "postgres"
pg_store_conn_strs = ["host=a", "host=b", "host=c"]
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn graphite_requires_host() {
        let config: DaemonConfig = toml::from_str(
            r#"
[metrics]
folder = "/m"
datastore = "graphite"
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
