use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Column expected in every fetched row, epoch in nanoseconds.
pub const EPOCH_COLUMN_NAME: &str = "epoch_ns";
/// Columns with this prefix are indexed as tag dimensions, not values.
pub const TAG_PREFIX: &str = "tag_";

/// The kind of a monitored endpoint. Decides how the endpoint is
/// probed, whether it expands into child databases on discovery, and
/// whether fetched rows need pool-style normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DbKind {
    #[default]
    #[serde(rename = "postgres")]
    Postgres,
    #[serde(rename = "postgres-continuous-discovery")]
    PostgresContinuous,
    #[serde(rename = "pgbouncer")]
    Pgbouncer,
    #[serde(rename = "patroni")]
    Patroni,
    #[serde(rename = "patroni-continuous-discovery")]
    PatroniContinuous,
    #[serde(rename = "patroni-namespace-discovery")]
    PatroniNamespaceDiscovery,
    #[serde(rename = "pgpool")]
    Pgpool,
}

impl DbKind {
    /// Endpoints that speak full PostgreSQL and support the version /
    /// recovery / extension probes.
    pub fn is_postgres_family(&self) -> bool {
        matches!(
            self,
            DbKind::Postgres
                | DbKind::PostgresContinuous
                | DbKind::Patroni
                | DbKind::PatroniContinuous
                | DbKind::PatroniNamespaceDiscovery
        )
    }

    /// Endpoints whose config entry is expanded into one child entry
    /// per database found on the instance.
    pub fn expands_children(&self) -> bool {
        matches!(
            self,
            DbKind::PostgresContinuous
                | DbKind::Patroni
                | DbKind::PatroniContinuous
                | DbKind::PatroniNamespaceDiscovery
        )
    }

    /// Continuous-discovery children share one physical instance, which
    /// is what makes instance-level metric caching valid for them.
    pub fn shares_instance(&self) -> bool {
        matches!(self, DbKind::PostgresContinuous | DbKind::PatroniContinuous)
    }

    /// Pool frontends whose result rows need filtering and counter
    /// coercion before they can be stored.
    pub fn normalizes_rows(&self) -> bool {
        matches!(self, DbKind::Pgbouncer | DbKind::Pgpool)
    }
}

impl std::fmt::Display for DbKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DbKind::Postgres => "postgres",
            DbKind::PostgresContinuous => "postgres-continuous-discovery",
            DbKind::Pgbouncer => "pgbouncer",
            DbKind::Patroni => "patroni",
            DbKind::PatroniContinuous => "patroni-continuous-discovery",
            DbKind::PatroniNamespaceDiscovery => "patroni-namespace-discovery",
            DbKind::Pgpool => "pgpool",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for DbKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "postgres" => Ok(DbKind::Postgres),
            "postgres-continuous-discovery" => Ok(DbKind::PostgresContinuous),
            "pgbouncer" => Ok(DbKind::Pgbouncer),
            "patroni" => Ok(DbKind::Patroni),
            "patroni-continuous-discovery" => Ok(DbKind::PatroniContinuous),
            "patroni-namespace-discovery" => Ok(DbKind::PatroniNamespaceDiscovery),
            "pgpool" => Ok(DbKind::Pgpool),
            _ => Err(format!("unknown db kind: {s}")),
        }
    }
}

/// A single cell value. Fetched cells arrive as text over the simple
/// query protocol and are narrowed to the tightest of these shapes;
/// each sink converts onward as it needs.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Text(String),
    Null,
}

impl MetricValue {
    /// Narrow a text cell: integer first, then float, else text.
    pub fn from_cell(cell: Option<&str>) -> Self {
        match cell {
            None => MetricValue::Null,
            Some(s) => {
                if let Ok(i) = s.parse::<i64>() {
                    MetricValue::Int(i)
                } else if let Ok(f) = s.parse::<f64>() {
                    MetricValue::Float(f)
                } else {
                    MetricValue::Text(s.to_string())
                }
            }
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetricValue::Int(i) => Some(*i),
            MetricValue::Float(f) => Some(*f as i64),
            MetricValue::Text(s) => s.parse().ok(),
            MetricValue::Null => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Int(i) => Some(*i as f64),
            MetricValue::Float(f) => Some(*f),
            MetricValue::Text(s) => s.parse().ok(),
            MetricValue::Null => None,
        }
    }

    /// NULLs and empty strings are equivalent for sink purposes.
    pub fn is_empty(&self) -> bool {
        match self {
            MetricValue::Null => true,
            MetricValue::Text(s) => s.is_empty(),
            _ => false,
        }
    }
}

impl Serialize for MetricValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MetricValue::Int(i) => serializer.serialize_i64(*i),
            MetricValue::Float(f) => serializer.serialize_f64(*f),
            MetricValue::Text(s) => serializer.serialize_str(s),
            MetricValue::Null => serializer.serialize_none(),
        }
    }
}

/// One fetched row: column order is preserved as delivered.
pub type MetricRow = IndexMap<String, MetricValue>;
/// One fetched result set.
pub type MetricData = Vec<MetricRow>;

/// The `epoch_ns` value of a row, if present and integral.
pub fn row_epoch_ns(row: &MetricRow) -> Option<i64> {
    row.get(EPOCH_COLUMN_NAME).and_then(|v| v.as_i64())
}

/// Per-host override of metric gathering windows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerMetricDisabledTimes {
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub disabled_times: Vec<String>,
    #[serde(default)]
    pub disabled_days: String,
}

/// Host-level configuration attached to a monitored endpoint. The DCS
/// and log-shipping fields are passed through to external subsystems.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfigAttrs {
    #[serde(default)]
    pub dcs_type: String,
    #[serde(default)]
    pub dcs_endpoints: Vec<String>,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub ca_file: String,
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
    #[serde(default)]
    pub logs_glob_path: String,
    #[serde(default)]
    pub logs_match_regex: String,
    #[serde(default)]
    pub per_metric_disabled_intervals: Vec<PerMetricDisabledTimes>,
}

/// One monitored endpoint as read from configuration. For
/// continuous-discovery kinds the entry is a template: discovery
/// produces one clone per child database with `unique_name` rewritten
/// and `unique_name_orig` preserving the parent identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoredDatabase {
    pub unique_name: String,
    #[serde(default)]
    pub unique_name_orig: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub dbname: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub password_type: String,
    #[serde(default)]
    pub libpq_conn_str: String,
    #[serde(default)]
    pub sslmode: String,
    #[serde(default, rename = "sslrootcert")]
    pub ssl_root_ca_path: String,
    #[serde(default, rename = "sslcert")]
    pub ssl_client_cert_path: String,
    #[serde(default, rename = "sslkey")]
    pub ssl_client_key_path: String,
    /// Metric name -> gathering interval in seconds.
    #[serde(default, rename = "custom_metrics")]
    pub metrics: HashMap<String, f64>,
    /// Interval map used instead of `metrics` while in recovery.
    #[serde(default, rename = "custom_metrics_standby")]
    pub metrics_standby: HashMap<String, f64>,
    #[serde(default)]
    pub stmt_timeout: i64,
    #[serde(default, rename = "dbtype")]
    pub kind: DbKind,
    #[serde(default)]
    pub dbname_include_pattern: String,
    #[serde(default)]
    pub dbname_exclude_pattern: String,
    #[serde(default)]
    pub preset_metrics: String,
    #[serde(default)]
    pub preset_metrics_standby: String,
    #[serde(default)]
    pub is_superuser: bool,
    #[serde(default)]
    pub is_enabled: bool,
    #[serde(default)]
    pub custom_tags: HashMap<String, String>,
    #[serde(default)]
    pub host_config: HostConfigAttrs,
    #[serde(default)]
    pub only_if_master: bool,
}

impl MonitoredDatabase {
    /// Keyword/value connection string for this endpoint. An explicit
    /// `libpq_conn_str` wins over the individual fields.
    pub fn connect_string(&self, application_name: &str, connect_timeout_s: u64) -> String {
        if !self.libpq_conn_str.is_empty() {
            return self.libpq_conn_str.clone();
        }
        let mut parts = vec![
            format!("host={}", self.host),
            format!("port={}", self.port),
            format!("dbname={}", self.dbname),
            format!("user={}", self.user),
            format!("application_name={application_name}"),
            format!("connect_timeout={connect_timeout_s}"),
        ];
        if !self.password.is_empty() {
            parts.push(format!("password={}", self.password));
        }
        if !self.sslmode.is_empty() {
            parts.push(format!("sslmode={}", self.sslmode));
        }
        parts.join(" ")
    }
}

/// Prometheus output hints attached to a metric definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricColumnAttrs {
    #[serde(default)]
    pub prometheus_gauge_columns: Vec<String>,
    #[serde(default)]
    pub prometheus_ignored_columns: Vec<String>,
    #[serde(default)]
    pub prometheus_all_gauge_columns: bool,
}

/// A minimum extension version required by an override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionInfo {
    pub ext_name: String,
    pub ext_min_version: Decimal,
}

/// Swap a metric's SQL for another metric's when the listed extensions
/// are all installed at or above their minimum versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionOverride {
    pub target_metric: String,
    pub expected_extension_versions: Vec<ExtensionInfo>,
}

/// Behavioral attributes of a metric definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricAttrs {
    #[serde(default)]
    pub is_instance_level: bool,
    /// Store results under this name instead of the metric's own.
    #[serde(default)]
    pub metric_storage_name: String,
    #[serde(default)]
    pub extension_version_based_overrides: Vec<ExtensionOverride>,
    /// Only usable as an override target, never gathered directly.
    #[serde(default)]
    pub is_private: bool,
    /// Cron style day list, 0 = Sunday, ranges allowed: "0,2-4".
    #[serde(default)]
    pub disabled_days: String,
    /// "HH:MM-HH:MM \[TZ\]" spans during which gathering is suspended.
    #[serde(default)]
    pub disabled_times: Vec<String>,
    /// Overrides the per-endpoint statement timeout.
    #[serde(default)]
    pub statement_timeout_seconds: i64,
}

/// One version-keyed variant of a metric definition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricVersionDef {
    pub sql: String,
    pub sql_su: String,
    pub master_only: bool,
    pub standby_only: bool,
    pub column_attrs: MetricColumnAttrs,
    pub metric_attrs: MetricAttrs,
    pub calls_helper_functions: bool,
}

/// Execution environment of a monitored server, for the few hard-coded
/// behavior switches managed flavors need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecEnv {
    #[default]
    Unknown,
    AzureSingle,
    AzureFlexible,
    Google,
}

impl std::fmt::Display for ExecEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecEnv::Unknown => "UNKNOWN",
            ExecEnv::AzureSingle => "AZURE_SINGLE",
            ExecEnv::AzureFlexible => "AZURE_FLEXIBLE",
            ExecEnv::Google => "GOOGLE",
        };
        write!(f, "{s}")
    }
}

/// Cached facts about a monitored server, refreshed at most every five
/// minutes per endpoint.
#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub last_checked_on: DateTime<Utc>,
    pub is_in_recovery: bool,
    pub version: Decimal,
    pub version_str: String,
    pub real_dbname: String,
    pub system_identifier: String,
    pub is_superuser: bool,
    pub extensions: HashMap<String, Decimal>,
    pub exec_env: ExecEnv,
    pub approx_db_size_b: i64,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            last_checked_on: DateTime::<Utc>::MIN_UTC,
            is_in_recovery: false,
            version: Decimal::ZERO,
            version_str: String::new(),
            real_dbname: String::new(),
            system_identifier: String::new(),
            is_superuser: false,
            extensions: HashMap::new(),
            exec_env: ExecEnv::Unknown,
            approx_db_size_b: 0,
        }
    }
}

/// Inputs of one fetch executed by a fetcher task.
#[derive(Debug, Clone)]
pub struct FetchMessage {
    pub db_unique: String,
    pub db_unique_orig: String,
    pub metric_name: String,
    pub kind: DbKind,
    pub interval: Duration,
    pub stmt_timeout_override: i64,
}

/// Output of one fetch, destined for a sink.
#[derive(Debug, Clone, Default)]
pub struct StoreMessage {
    pub db_unique: String,
    pub kind: DbKind,
    pub metric_name: String,
    pub custom_tags: HashMap<String, String>,
    pub data: MetricData,
    pub definition: MetricVersionDef,
    pub real_dbname: String,
    pub system_identifier: String,
}

impl StoreMessage {
    pub fn datapoints(&self) -> usize {
        self.data.len()
    }
}

/// Supervisor-to-fetcher control messages.
#[derive(Debug, Clone)]
pub enum ControlMessage {
    /// Adopt a new interval map and restart the ticker.
    Start(HashMap<String, f64>),
    /// Exit the fetcher task.
    Stop,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_kind_roundtrips_through_strings() {
        for kind in [
            DbKind::Postgres,
            DbKind::PostgresContinuous,
            DbKind::Pgbouncer,
            DbKind::Patroni,
            DbKind::PatroniContinuous,
            DbKind::PatroniNamespaceDiscovery,
            DbKind::Pgpool,
        ] {
            let parsed: DbKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("mysql".parse::<DbKind>().is_err());
    }

    #[test]
    fn cell_narrowing_prefers_integers() {
        assert_eq!(MetricValue::from_cell(Some("42")), MetricValue::Int(42));
        assert_eq!(MetricValue::from_cell(Some("4.5")), MetricValue::Float(4.5));
        assert_eq!(
            MetricValue::from_cell(Some("idle")),
            MetricValue::Text("idle".into())
        );
        assert_eq!(MetricValue::from_cell(None), MetricValue::Null);
    }

    #[test]
    fn row_epoch_reads_the_epoch_column() {
        let mut row = MetricRow::new();
        assert_eq!(row_epoch_ns(&row), None);
        row.insert(EPOCH_COLUMN_NAME.into(), MetricValue::Int(1_700_000_000));
        assert_eq!(row_epoch_ns(&row), Some(1_700_000_000));
    }

    #[test]
    fn monitored_db_yaml_defaults() {
        let yaml = r#"
unique_name: prod1
host: 10.0.0.1
port: "5432"
dbname: app
user: pgsentry
is_enabled: true
custom_metrics:
  db_stats: 60
"#;
        let md: MonitoredDatabase = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(md.kind, DbKind::Postgres);
        assert_eq!(md.metrics.get("db_stats"), Some(&60.0));
        assert!(md.metrics_standby.is_empty());
        assert!(!md.only_if_master);
    }

    #[test]
    fn connect_string_prefers_libpq_form() {
        let md = MonitoredDatabase {
            unique_name: "x".into(),
            libpq_conn_str: "host=/tmp dbname=adhoc".into(),
            ..Default::default()
        };
        assert_eq!(md.connect_string("pgsentry", 5), "host=/tmp dbname=adhoc");

        let md = MonitoredDatabase {
            unique_name: "y".into(),
            host: "db1".into(),
            port: "5432".into(),
            dbname: "app".into(),
            user: "mon".into(),
            password: "s3cret".into(),
            sslmode: "require".into(),
            ..Default::default()
        };
        let cs = md.connect_string("pgsentry", 5);
        assert!(cs.contains("host=db1"));
        assert!(cs.contains("password=s3cret"));
        assert!(cs.contains("sslmode=require"));
        assert!(cs.contains("application_name=pgsentry"));
    }
}
