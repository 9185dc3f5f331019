//! File-tree metric definition source.
//!
//! Layout: `<root>/<metric_name>/<version>/metric[_master|_standby|_su].sql`
//! with optional `metric_attrs.yaml` / `column_attrs.yaml` beside the
//! version folders and a top-level `preset-configs.yaml`. The reserved
//! `00_helpers` folder holds helper function DDL pulled in by the
//! installer, not by this loader.

use crate::MetricDefs;
use anyhow::{Context, Result};
use pgsentry_common::types::{MetricAttrs, MetricColumnAttrs, MetricVersionDef};
use regex::Regex;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

pub const HELPERS_DIR: &str = "00_helpers";
pub const PRESET_CONFIG_FILE: &str = "preset-configs.yaml";

fn metric_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9_.]+$").expect("valid regex"))
}

fn version_dir_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[\d.]+$").expect("valid regex"))
}

/// Helper-calling SQL is expected to follow get_smth() naming.
fn helper_call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?si)^\s*(select|with).*\s+get_\w+\(\)[\s,$]+").expect("valid regex")
    })
}

pub fn calls_helper_functions(sql: &str) -> bool {
    helper_call_re().is_match(sql)
}

/// Result of one folder scan: the definition map plus the derived
/// storage-name remap table.
#[derive(Debug, Default)]
pub struct LoadedMetrics {
    pub defs: MetricDefs,
    pub storage_name_remaps: HashMap<String, String>,
}

fn parse_yaml_if_exists<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> T {
    if !path.exists() {
        return T::default();
    }
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_yaml::from_str(&content) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "unmarshaling error");
                T::default()
            }
        },
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "error reading file");
            T::default()
        }
    }
}

/// Scan a metric definition tree into the in-memory map.
pub fn read_metrics_from_folder(folder: &Path) -> Result<LoadedMetrics> {
    let mut loaded = LoadedMetrics::default();

    tracing::info!(path = %folder.display(), "searching for metric definitions");
    let metric_dirs = std::fs::read_dir(folder)
        .with_context(|| format!("could not read metrics path {}", folder.display()))?;

    for entry in metric_dirs {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let metric_name = entry.file_name().to_string_lossy().to_string();
        if metric_name == HELPERS_DIR {
            continue;
        }
        if !metric_name_re().is_match(&metric_name) {
            tracing::warn!(metric = %metric_name, "ignoring metric, name not fitting pattern");
            continue;
        }

        let metric_dir = entry.path();
        let metric_attrs: MetricAttrs = parse_yaml_if_exists(&metric_dir.join("metric_attrs.yaml"));
        if !metric_attrs.metric_storage_name.is_empty() {
            loaded.storage_name_remaps.insert(
                metric_name.clone(),
                metric_attrs.metric_storage_name.clone(),
            );
        }
        let column_attrs: MetricColumnAttrs =
            parse_yaml_if_exists(&metric_dir.join("column_attrs.yaml"));

        for ver_entry in std::fs::read_dir(&metric_dir)? {
            let ver_entry = ver_entry?;
            let ver_name = ver_entry.file_name().to_string_lossy().to_string();
            if ver_name.ends_with(".md")
                || ver_name == "metric_attrs.yaml"
                || ver_name == "column_attrs.yaml"
            {
                continue;
            }
            if !ver_entry.file_type()?.is_dir() {
                continue;
            }
            if !version_dir_re().is_match(&ver_name) {
                tracing::warn!(
                    metric = %metric_name,
                    entry = %ver_name,
                    "version folder names should consist of only numerics/dots"
                );
                continue;
            }
            let version = match Decimal::from_str(&ver_name) {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(entry = %ver_name, error = %e, "could not parse version folder");
                    continue;
                }
            };

            let mut def = read_version_dir(&ver_entry.path(), &metric_name, &ver_name)?;
            if def.sql.is_empty() && def.sql_su.is_empty() {
                continue;
            }
            def.metric_attrs = metric_attrs.clone();
            def.column_attrs = column_attrs.clone();
            def.calls_helper_functions = calls_helper_functions(&def.sql);

            loaded
                .defs
                .entry(metric_name.clone())
                .or_insert_with(BTreeMap::new)
                .insert(version, def);
        }
    }

    Ok(loaded)
}

fn read_version_dir(dir: &Path, metric: &str, version: &str) -> Result<MetricVersionDef> {
    let mut def = MetricVersionDef::default();
    let mut seen = HashMap::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().to_string();
        if !(file_name.starts_with("metric") && file_name.ends_with(".sql")) {
            continue;
        }
        let sql = match std::fs::read_to_string(entry.path()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(path = %entry.path().display(), error = %e, "failed to read metric definition");
                continue;
            }
        };
        if seen.insert(file_name.clone(), true).is_some() {
            tracing::warn!(
                metric,
                version,
                file = %file_name,
                "multiple definitions found, using the last one"
            );
        }

        if file_name.contains("_master") {
            def.master_only = true;
        }
        if file_name.contains("_standby") {
            def.standby_only = true;
        }
        if file_name.contains("_su") {
            def.sql_su = sql;
        } else {
            def.sql = sql;
        }
    }

    Ok(def)
}

#[derive(Debug, Deserialize)]
struct PresetConfig {
    #[serde(rename = "Name", alias = "name")]
    name: String,
    #[serde(rename = "Description", alias = "description", default)]
    #[allow(dead_code)]
    description: String,
    #[serde(rename = "Metrics", alias = "metrics")]
    metrics: HashMap<String, f64>,
}

/// Read `preset-configs.yaml`: preset name -> {metric: interval seconds}.
pub fn read_preset_configs(folder: &Path) -> Result<HashMap<String, HashMap<String, f64>>> {
    let path = folder.join(PRESET_CONFIG_FILE);
    tracing::info!(path = %path.display(), "reading preset metric config");
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read preset metric config at {}", path.display()))?;
    let presets: Vec<PresetConfig> =
        serde_yaml::from_str(&content).context("unmarshaling error reading preset config")?;

    tracing::info!(count = presets.len(), "preset metric definitions found");
    Ok(presets
        .into_iter()
        .map(|pc| (pc.name, pc.metrics))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn loads_versioned_variants_with_roles() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write(&root.join("db_stats/9.6/metric.sql"), "select 96;");
        write(&root.join("db_stats/11/metric.sql"), "select 11;");
        write(&root.join("db_stats/11/metric_su.sql"), "select 11 as su;");
        write(&root.join("wal/13/metric_master.sql"), "select wal;");
        // helpers and badly named folders are skipped
        write(&root.join("00_helpers/9.0/metric.sql"), "create function;");
        write(&root.join("Bad-Name/11/metric.sql"), "select 1;");

        let loaded = read_metrics_from_folder(root).unwrap();
        assert_eq!(loaded.defs.len(), 2);

        let db_stats = &loaded.defs["db_stats"];
        assert_eq!(db_stats.len(), 2);
        let v11 = &db_stats[&Decimal::from(11)];
        assert_eq!(v11.sql, "select 11;");
        assert_eq!(v11.sql_su, "select 11 as su;");
        assert!(!v11.master_only);

        let wal = &loaded.defs["wal"][&Decimal::from(13)];
        assert!(wal.master_only);
        assert_eq!(wal.sql, "select wal;");
    }

    #[test]
    fn metric_attrs_feed_the_remap_table() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write(&root.join("db_size_approx/11/metric.sql"), "select 1;");
        write(
            &root.join("db_size_approx/metric_attrs.yaml"),
            "metric_storage_name: db_size\nis_instance_level: true\n",
        );

        let loaded = read_metrics_from_folder(root).unwrap();
        assert_eq!(
            loaded.storage_name_remaps.get("db_size_approx"),
            Some(&"db_size".to_string())
        );
        let def = &loaded.defs["db_size_approx"][&Decimal::from(11)];
        assert!(def.metric_attrs.is_instance_level);
        assert_eq!(def.metric_attrs.metric_storage_name, "db_size");
    }

    #[test]
    fn helper_function_detection() {
        assert!(calls_helper_functions("select * from get_load_average() "));
        assert!(calls_helper_functions(
            "with q as (select 1)\nselect get_wal_size() , now()"
        ));
        assert!(!calls_helper_functions("select * from pg_stat_database"));
    }

    #[test]
    fn preset_configs_parse() {
        let tmp = TempDir::new().unwrap();
        write(
            &tmp.path().join(PRESET_CONFIG_FILE),
            r#"
- name: minimal
  description: just the basics
  metrics:
    db_stats: 60
    wal: 120
- name: exhaustive
  metrics:
    db_stats: 30
"#,
        );
        let presets = read_preset_configs(tmp.path()).unwrap();
        assert_eq!(presets["minimal"]["wal"], 120.0);
        assert_eq!(presets["exhaustive"]["db_stats"], 30.0);
    }
}
