//! PostgreSQL metrics store.
//!
//! One table per metric, `(time, dbname, data jsonb, tag_data jsonb)`,
//! partitioned per the configured scheme. Partition existence is
//! cached; a write error containing "does not exist" clears the caches
//! so externally dropped partitions get recreated on the next attempt.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, TimeZone, Utc};
use pgsentry_common::types::{
    row_epoch_ns, MetricRow, StoreMessage, EPOCH_COLUMN_NAME, TAG_PREFIX,
};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::watch;
use tokio_postgres::types::Json;
use tokio_postgres::{Client, NoTls};

/// How metric tables are laid out in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionScheme {
    /// Plain tables, cleanup by row deletion.
    Metric,
    /// Range partitions by day.
    MetricTime,
    /// List partitions by dbname, range sub-partitions by day.
    MetricDbnameTime,
    /// User-managed layout: inserts only, no DDL, no retention.
    Custom,
}

impl FromStr for PartitionScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "metric" => Ok(PartitionScheme::Metric),
            "metric-time" => Ok(PartitionScheme::MetricTime),
            "metric-dbname-time" => Ok(PartitionScheme::MetricDbnameTime),
            "custom" => Ok(PartitionScheme::Custom),
            _ => Err(format!("unknown partition scheme: {s}")),
        }
    }
}

fn sanitize_ident(name: &str) -> String {
    name.replace('"', "")
}

fn partition_suffix(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// One row mapped to store columns: time, payload, tags.
pub fn row_payload(message: &StoreMessage, row: &MetricRow) -> Option<(DateTime<Utc>, Value, Option<Value>)> {
    let epoch_ns = row_epoch_ns(row)?;
    let time = Utc.timestamp_nanos(epoch_ns);

    let mut data = Map::new();
    let mut tags = Map::new();
    for (column, value) in row {
        if column == EPOCH_COLUMN_NAME {
            continue;
        }
        let json = serde_json::to_value(value).unwrap_or(Value::Null);
        if let Some(tag) = column.strip_prefix(TAG_PREFIX) {
            tags.insert(tag.to_string(), json);
        } else {
            data.insert(column.clone(), json);
        }
    }
    for (key, value) in &message.custom_tags {
        tags.insert(key.clone(), Value::String(value.clone()));
    }

    let tag_data = if tags.is_empty() {
        None
    } else {
        Some(Value::Object(tags))
    };
    Some((time, Value::Object(data), tag_data))
}

pub struct PostgresSink {
    name: String,
    conn_str: String,
    scheme: PartitionScheme,
    client: Option<Client>,
    ensured_tables: HashSet<String>,
    bounds_metric: HashMap<String, HashSet<NaiveDate>>,
    bounds_metric_dbname: HashMap<String, HashMap<String, HashSet<NaiveDate>>>,
}

impl PostgresSink {
    pub fn new(name: impl Into<String>, conn_str: impl Into<String>, scheme: PartitionScheme) -> Self {
        Self {
            name: name.into(),
            conn_str: conn_str.into(),
            scheme,
            client: None,
            ensured_tables: HashSet::new(),
            bounds_metric: HashMap::new(),
            bounds_metric_dbname: HashMap::new(),
        }
    }

    async fn client(&mut self) -> Result<&Client> {
        let need_connect = self.client.as_ref().map_or(true, |c| c.is_closed());
        if need_connect {
            let (client, connection) = tokio_postgres::connect(&self.conn_str, NoTls).await?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::debug!(error = %e, "metrics store connection closed");
                }
            });
            self.client = Some(client);
        }
        Ok(self.client.as_ref().expect("client just ensured"))
    }

    /// Forget everything we think exists server-side. Called when an
    /// error suggests a user cleaned data up externally.
    fn reset_partition_caches(&mut self) {
        tracing::warn!(
            sink = %self.name,
            "re-initializing metric partition cache due to possible external data cleanup"
        );
        self.ensured_tables.clear();
        self.bounds_metric.clear();
        self.bounds_metric_dbname.clear();
    }

    async fn ensure_table(&mut self, metric: &str) -> Result<()> {
        if self.ensured_tables.contains(metric) {
            return Ok(());
        }
        let scheme = self.scheme;
        let ident = sanitize_ident(metric);
        let partition_clause = match scheme {
            PartitionScheme::Metric | PartitionScheme::Custom => "",
            PartitionScheme::MetricTime => " partition by range (time)",
            PartitionScheme::MetricDbnameTime => " partition by list (dbname)",
        };
        if scheme != PartitionScheme::Custom {
            let mut ddl = format!(
                "create table if not exists public.\"{ident}\" \
                 (time timestamptz not null, dbname text, data jsonb not null, tag_data jsonb){partition_clause}"
            );
            if scheme == PartitionScheme::Metric {
                ddl.push_str(&format!(
                    "; create index if not exists \"idx_{ident}_dbname_time\" \
                     on public.\"{ident}\" (dbname, time)"
                ));
            }
            self.client().await?.batch_execute(&ddl).await?;
        }
        self.ensured_tables.insert(metric.to_string());
        Ok(())
    }

    async fn ensure_time_partition(&mut self, metric: &str, date: NaiveDate) -> Result<()> {
        if self
            .bounds_metric
            .get(metric)
            .is_some_and(|days| days.contains(&date))
        {
            return Ok(());
        }
        let ident = sanitize_ident(metric);
        let next = date + Days::new(1);
        let ddl = format!(
            "create table if not exists public.\"{ident}_{suffix}\" \
             partition of public.\"{ident}\" for values from ('{date}') to ('{next}')",
            suffix = partition_suffix(date),
        );
        self.client().await?.batch_execute(&ddl).await?;
        self.bounds_metric
            .entry(metric.to_string())
            .or_default()
            .insert(date);
        tracing::debug!(sink = %self.name, metric, %date, "created time partition");
        Ok(())
    }

    async fn ensure_dbname_time_partition(
        &mut self,
        metric: &str,
        dbname: &str,
        date: NaiveDate,
    ) -> Result<()> {
        let known = self
            .bounds_metric_dbname
            .get(metric)
            .and_then(|per_db| per_db.get(dbname))
            .is_some_and(|days| days.contains(&date));
        if known {
            return Ok(());
        }
        let ident = sanitize_ident(metric);
        let db_ident = sanitize_ident(dbname);
        let literal = dbname.replace('\'', "''");
        let next = date + Days::new(1);
        let ddl = format!(
            "create table if not exists public.\"{ident}_{db_ident}\" \
             partition of public.\"{ident}\" for values in ('{literal}') partition by range (time); \
             create table if not exists public.\"{ident}_{db_ident}_{suffix}\" \
             partition of public.\"{ident}_{db_ident}\" for values from ('{date}') to ('{next}')",
            suffix = partition_suffix(date),
        );
        self.client().await?.batch_execute(&ddl).await?;
        self.bounds_metric_dbname
            .entry(metric.to_string())
            .or_default()
            .entry(dbname.to_string())
            .or_default()
            .insert(date);
        Ok(())
    }

    async fn write_inner(&mut self, batch: &[StoreMessage]) -> Result<()> {
        // map rows first so DDL only runs for data that will land
        let mut rows = Vec::new();
        for message in batch {
            for row in &message.data {
                match row_payload(message, row) {
                    Some((time, data, tags)) => rows.push((
                        message.metric_name.clone(),
                        message.db_unique.clone(),
                        time,
                        data,
                        tags,
                    )),
                    None => {
                        tracing::debug!(
                            db = %message.db_unique,
                            metric = %message.metric_name,
                            "skipping row without epoch_ns"
                        );
                    }
                }
            }
        }
        if rows.is_empty() {
            return Ok(());
        }

        for (metric, dbname, time, _, _) in &rows {
            self.ensure_table(metric).await?;
            match self.scheme {
                PartitionScheme::MetricTime => {
                    self.ensure_time_partition(metric, time.date_naive()).await?;
                }
                PartitionScheme::MetricDbnameTime => {
                    self.ensure_dbname_time_partition(metric, dbname, time.date_naive())
                        .await?;
                }
                PartitionScheme::Metric | PartitionScheme::Custom => {}
            }
        }

        let client = self.client().await?;
        let mut statements: HashMap<String, tokio_postgres::Statement> = HashMap::new();
        for (metric, dbname, time, data, tags) in &rows {
            let statement = match statements.get(metric) {
                Some(s) => s.clone(),
                None => {
                    let ident = sanitize_ident(metric);
                    let prepared = client
                        .prepare(&format!(
                            "insert into public.\"{ident}\" (time, dbname, data, tag_data) \
                             values ($1, $2, $3, $4)"
                        ))
                        .await?;
                    statements.insert(metric.clone(), prepared.clone());
                    prepared
                }
            };
            let tags_param = tags.as_ref().map(Json);
            client
                .execute(&statement, &[time, dbname, &Json(data), &tags_param])
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl crate::MetricsSink for PostgresSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&mut self, batch: &[StoreMessage]) -> Result<()> {
        match self.write_inner(batch).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.to_string().contains("does not exist") {
                    self.reset_partition_caches();
                }
                if self.client.as_ref().is_some_and(|c| c.is_closed()) {
                    self.client = None;
                }
                Err(e)
            }
        }
    }
}

fn date_suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_(\d{8})$").expect("valid regex"))
}

/// Drop (or, for the plain scheme, delete out of) partitions older
/// than the retention window. Runs forever on a daily cadence; the
/// custom scheme is left entirely alone.
pub async fn run_retention(
    conn_str: String,
    scheme: PartitionScheme,
    retention_days: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    if scheme == PartitionScheme::Custom || retention_days == 0 {
        return;
    }
    loop {
        if let Err(e) = retention_pass(&conn_str, scheme, retention_days).await {
            tracing::error!(error = %e, "metrics retention pass failed");
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(12 * 3600)) => {}
            _ = shutdown.changed() => return,
        }
    }
}

async fn retention_pass(
    conn_str: &str,
    scheme: PartitionScheme,
    retention_days: u32,
) -> Result<()> {
    let (client, connection) = tokio_postgres::connect(conn_str, NoTls).await?;
    let driver = tokio::spawn(async move {
        let _ = connection.await;
    });
    let cutoff = Utc::now().date_naive() - Days::new(retention_days as u64);

    let result = async {
        let rows = client
            .query(
                "select tablename from pg_catalog.pg_tables where schemaname = 'public'",
                &[],
            )
            .await?;
        let mut removed = 0u32;
        for row in rows {
            let table: String = row.get(0);
            match scheme {
                PartitionScheme::MetricTime | PartitionScheme::MetricDbnameTime => {
                    let Some(captures) = date_suffix_re().captures(&table) else {
                        continue;
                    };
                    let Ok(date) = NaiveDate::parse_from_str(&captures[1], "%Y%m%d") else {
                        continue;
                    };
                    if date < cutoff {
                        let ident = sanitize_ident(&table);
                        client
                            .batch_execute(&format!("drop table if exists public.\"{ident}\""))
                            .await?;
                        tracing::info!(partition = %table, "removed expired partition");
                        removed += 1;
                    }
                }
                PartitionScheme::Metric => {
                    if date_suffix_re().is_match(&table) {
                        continue;
                    }
                    let ident = sanitize_ident(&table);
                    let delete_sql = format!("delete from public.\"{ident}\" where time < $1");
                    let cutoff_ts =
                        Utc.from_utc_datetime(&cutoff.and_hms_opt(0, 0, 0).expect("valid time"));
                    let deleted = client
                        .execute(delete_sql.as_str(), &[&cutoff_ts])
                        .await
                        .unwrap_or(0);
                    if deleted > 0 {
                        tracing::info!(table = %table, rows = deleted, "deleted expired metric rows");
                    }
                }
                PartitionScheme::Custom => {}
            }
        }
        if removed > 0 {
            tracing::info!(removed, retention_days, "metrics retention finished");
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    drop(client);
    driver.abort();
    result.map_err(|e| anyhow!(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgsentry_common::types::MetricValue;

    #[test]
    fn scheme_parsing() {
        assert_eq!(
            "metric-time".parse::<PartitionScheme>().unwrap(),
            PartitionScheme::MetricTime
        );
        assert_eq!(
            "custom".parse::<PartitionScheme>().unwrap(),
            PartitionScheme::Custom
        );
        assert!("weekly".parse::<PartitionScheme>().is_err());
    }

    #[test]
    fn rows_split_into_data_and_tags() {
        let mut row = MetricRow::new();
        row.insert(EPOCH_COLUMN_NAME.into(), MetricValue::Int(1_700_000_000_000_000_000));
        row.insert("numbackends".into(), MetricValue::Int(5));
        row.insert("tag_datname".into(), MetricValue::Text("app".into()));
        let message = StoreMessage {
            db_unique: "db1".into(),
            metric_name: "db_stats".into(),
            custom_tags: HashMap::from([("env".to_string(), "prod".to_string())]),
            ..Default::default()
        };

        let (time, data, tags) = row_payload(&message, &row).unwrap();
        assert_eq!(time.timestamp(), 1_700_000_000);
        assert_eq!(data["numbackends"], 5);
        assert!(data.get(EPOCH_COLUMN_NAME).is_none());
        let tags = tags.unwrap();
        assert_eq!(tags["datname"], "app");
        assert_eq!(tags["env"], "prod");
    }

    #[test]
    fn rows_without_epoch_are_skipped() {
        let mut row = MetricRow::new();
        row.insert("numbackends".into(), MetricValue::Int(5));
        let message = StoreMessage::default();
        assert!(row_payload(&message, &row).is_none());
    }

    #[test]
    fn partition_suffix_is_sortable() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 8).unwrap();
        assert_eq!(partition_suffix(date), "20240108");
        assert!(date_suffix_re().is_match("db_stats_20240108"));
        assert!(!date_suffix_re().is_match("db_stats"));
    }
}
