//! Monitored endpoint discovery.
//!
//! Reads the endpoint YAML (file or folder), applies defaults and
//! `$ENV` expansion, resolves preset metric configs, decrypts envelope
//! passwords, filters by group, and expands discovery-kind entries
//! into one child endpoint per database on the instance.

use anyhow::{Context, Result};
use pgsentry_collector::{manager::ConnectionManager, rows};
use pgsentry_common::crypto;
use pgsentry_common::types::{DbKind, MetricValue, MonitoredDatabase};
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;

const ENCRYPTED_PASSWORD_TYPE: &str = "aes-gcm-256";

fn expand_env(value: &mut String) -> bool {
    if let Some(name) = value.strip_prefix('$') {
        if let Ok(expanded) = std::env::var(name) {
            *value = expanded;
            return true;
        }
    }
    false
}

fn expand_env_fields(md: &mut MonitoredDatabase) -> usize {
    let mut changed = 0;
    for field in [
        &mut md.unique_name,
        &mut md.dbname,
        &mut md.user,
        &mut md.password,
        &mut md.password_type,
        &mut md.sslmode,
        &mut md.dbname_include_pattern,
        &mut md.dbname_exclude_pattern,
        &mut md.preset_metrics,
        &mut md.preset_metrics_standby,
    ] {
        if expand_env(field) {
            changed += 1;
        }
    }
    changed
}

fn config_file_to_dbs(path: &Path) -> Result<Vec<MonitoredDatabase>> {
    tracing::debug!(path = %path.display(), "reading monitoring config");
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("error reading file {}", path.display()))?;
    let entries: Vec<MonitoredDatabase> =
        serde_yaml::from_str(&content).context("unmarshaling error")?;

    let mut dbs = Vec::new();
    for mut md in entries {
        if !md.is_enabled {
            continue;
        }
        if md.port.is_empty() {
            md.port = "5432".to_string();
        }
        if md.group.is_empty() {
            md.group = "default".to_string();
        }
        if md.stmt_timeout == 0 {
            md.stmt_timeout = 5;
        }
        md.unique_name_orig = md.unique_name.clone();
        let changed = expand_env_fields(&mut md);
        if changed > 0 {
            tracing::debug!(db = %md.unique_name, fields = changed, "config attributes expanded from env");
        }
        dbs.push(md);
    }
    if dbs.is_empty() {
        tracing::warn!(path = %path.display(), "could not find any valid monitoring configs in file");
    }
    Ok(dbs)
}

/// Read the monitored endpoint config from a YAML file or a folder
/// tree of `.yaml`/`.yml` files.
pub fn read_monitoring_config(path: &Path) -> Result<Vec<MonitoredDatabase>> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("could not stat path {}", path.display()))?;
    if meta.is_file() {
        return config_file_to_dbs(path);
    }

    tracing::info!(path = %path.display(), "reading monitoring config folder");
    let mut dbs = Vec::new();
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let entry_path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(entry_path);
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_lowercase();
            if name.ends_with(".yaml") || name.ends_with(".yml") {
                dbs.extend(config_file_to_dbs(&entry_path)?);
            }
        }
    }
    Ok(dbs)
}

/// Keep only endpoints whose group appears in the comma-separated
/// filter. Returns the kept list and the removed count.
pub fn filter_by_group(
    dbs: Vec<MonitoredDatabase>,
    group_filter: &str,
) -> (Vec<MonitoredDatabase>, usize) {
    if group_filter.is_empty() {
        return (dbs, 0);
    }
    let groups: Vec<&str> = group_filter.split(',').map(str::trim).collect();
    let total = dbs.len();
    let kept: Vec<MonitoredDatabase> = dbs
        .into_iter()
        .filter(|md| groups.contains(&md.group.as_str()))
        .collect();
    let removed = total - kept.len();
    (kept, removed)
}

/// Fill empty interval maps from the referenced preset configs.
/// Entries naming an unknown preset are dropped.
pub fn apply_presets(
    dbs: Vec<MonitoredDatabase>,
    presets: &HashMap<String, HashMap<String, f64>>,
) -> Vec<MonitoredDatabase> {
    let mut out = Vec::new();
    for mut md in dbs {
        if md.metrics.is_empty() && !md.preset_metrics.is_empty() {
            match presets.get(&md.preset_metrics) {
                Some(preset) => md.metrics = preset.clone(),
                None => {
                    tracing::error!(
                        db = %md.unique_name,
                        preset = %md.preset_metrics,
                        "failed to resolve preset config"
                    );
                    continue;
                }
            }
        }
        if md.metrics_standby.is_empty() && !md.preset_metrics_standby.is_empty() {
            if let Some(preset) = presets.get(&md.preset_metrics_standby) {
                md.metrics_standby = preset.clone();
            }
        }
        out.push(md);
    }
    out
}

/// Decrypt envelope passwords in place. Entries that cannot be
/// decrypted keep the stored form and a warning is logged once here.
pub fn decrypt_passwords(dbs: &mut [MonitoredDatabase], keyphrase: Option<&str>) {
    for md in dbs.iter_mut() {
        if md.password_type != ENCRYPTED_PASSWORD_TYPE {
            continue;
        }
        let Some(keyphrase) = keyphrase else {
            tracing::warn!(
                db = %md.unique_name,
                "encrypted password found but no decryption keyphrase configured"
            );
            continue;
        };
        match crypto::decrypt_password(keyphrase, &md.password) {
            Ok(plain) => md.password = plain,
            Err(e) => {
                tracing::error!(db = %md.unique_name, error = %e, "could not decrypt password");
            }
        }
    }
}

async fn list_databases(parent: &MonitoredDatabase) -> Result<Vec<String>> {
    let mut probe_entry = parent.clone();
    if probe_entry.dbname.is_empty() {
        probe_entry.dbname = "template1".to_string();
    }
    let conn_str =
        probe_entry.connect_string(pgsentry_collector::manager::APPLICATION_NAME, 5);
    let messages = ConnectionManager::execute_adhoc(
        &conn_str,
        "select datname from pg_catalog.pg_database \
         where not datistemplate and datallowconn order by datname",
    )
    .await?;
    Ok(rows::messages_to_data(&messages)
        .into_iter()
        .filter_map(|row| match row.get("datname") {
            Some(MetricValue::Text(s)) => Some(s.clone()),
            _ => None,
        })
        .collect())
}

fn compile_filter(pattern: &str) -> Option<Regex> {
    if pattern.is_empty() {
        return None;
    }
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::error!(pattern = %pattern, error = %e, "invalid dbname filter pattern");
            None
        }
    }
}

/// Expand discovery-kind entries into per-database children; plain
/// entries pass through. A parent that cannot be resolved is skipped
/// for this iteration.
pub async fn expand_discovery_entries(dbs: Vec<MonitoredDatabase>) -> Vec<MonitoredDatabase> {
    let mut out = Vec::new();
    for md in dbs {
        if !md.kind.expands_children() && !md.dbname.is_empty() {
            out.push(md);
            continue;
        }
        if md.kind == DbKind::Postgres && md.dbname.is_empty() {
            tracing::warn!(db = %md.unique_name, "ignoring host, dbname attribute required");
            continue;
        }

        let found = match list_databases(&md).await {
            Ok(names) => names,
            Err(e) => {
                tracing::error!(db = %md.unique_name, error = %e, "failed to resolve databases");
                continue;
            }
        };
        let include = compile_filter(&md.dbname_include_pattern);
        let exclude = compile_filter(&md.dbname_exclude_pattern);

        let mut resolved = Vec::new();
        for dbname in found {
            if include.as_ref().is_some_and(|re| !re.is_match(&dbname)) {
                continue;
            }
            if exclude.as_ref().is_some_and(|re| re.is_match(&dbname)) {
                continue;
            }
            let mut child = md.clone();
            child.unique_name = format!("{}_{}", md.unique_name, dbname);
            child.unique_name_orig = md.unique_name.clone();
            child.dbname = dbname.clone();
            resolved.push(dbname);
            out.push(child);
        }
        tracing::debug!(
            db = %md.unique_name,
            resolved = resolved.len(),
            dbs = %resolved.join(", "),
            "resolved databases for discovery prefix"
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TWO_ENTRIES: &str = r#"
- unique_name: prod1
  host: db1
  dbname: app
  user: mon
  is_enabled: true
  custom_metrics:
    db_stats: 60
- unique_name: stage1
  host: db2
  dbname: app
  user: mon
  group: staging
  is_enabled: true
  preset_metrics: minimal
- unique_name: disabled1
  host: db3
  dbname: app
  user: mon
  is_enabled: false
"#;

    #[test]
    fn file_parsing_applies_defaults_and_skips_disabled() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("instances.yaml");
        std::fs::write(&path, TWO_ENTRIES).unwrap();

        let dbs = read_monitoring_config(&path).unwrap();
        assert_eq!(dbs.len(), 2);
        assert_eq!(dbs[0].port, "5432");
        assert_eq!(dbs[0].group, "default");
        assert_eq!(dbs[0].stmt_timeout, 5);
        assert_eq!(dbs[0].unique_name_orig, "prod1");
        assert_eq!(dbs[1].group, "staging");
    }

    #[test]
    fn folder_trees_are_walked() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("a.yaml"), TWO_ENTRIES).unwrap();
        std::fs::write(
            tmp.path().join("sub/b.yml"),
            "- unique_name: extra1\n  host: h\n  dbname: d\n  user: u\n  is_enabled: true\n",
        )
        .unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        let dbs = read_monitoring_config(tmp.path()).unwrap();
        assert_eq!(dbs.len(), 3);
    }

    #[test]
    fn group_filtering() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("instances.yaml");
        std::fs::write(&path, TWO_ENTRIES).unwrap();
        let dbs = read_monitoring_config(&path).unwrap();

        let (kept, removed) = filter_by_group(dbs.clone(), "staging");
        assert_eq!(kept.len(), 1);
        assert_eq!(removed, 1);
        assert_eq!(kept[0].unique_name, "stage1");

        let (kept, removed) = filter_by_group(dbs, "");
        assert_eq!(kept.len(), 2);
        assert_eq!(removed, 0);
    }

    #[test]
    fn presets_fill_empty_interval_maps() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("instances.yaml");
        std::fs::write(&path, TWO_ENTRIES).unwrap();
        let dbs = read_monitoring_config(&path).unwrap();

        let presets = HashMap::from([(
            "minimal".to_string(),
            HashMap::from([("db_stats".to_string(), 120.0)]),
        )]);
        let resolved = apply_presets(dbs, &presets);
        assert_eq!(resolved.len(), 2);
        let stage = resolved.iter().find(|m| m.unique_name == "stage1").unwrap();
        assert_eq!(stage.metrics.get("db_stats"), Some(&120.0));

        // unknown preset drops the entry
        let resolved = apply_presets(
            vec![MonitoredDatabase {
                unique_name: "x".into(),
                preset_metrics: "nope".into(),
                is_enabled: true,
                ..Default::default()
            }],
            &presets,
        );
        assert!(resolved.is_empty());
    }

    #[test]
    fn env_expansion_applies_to_dollar_fields() {
        std::env::set_var("PGSENTRY_TEST_USER", "expanded_user");
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("instances.yaml");
        std::fs::write(
            &path,
            "- unique_name: e1\n  host: h\n  dbname: d\n  user: $PGSENTRY_TEST_USER\n  is_enabled: true\n",
        )
        .unwrap();
        let dbs = read_monitoring_config(&path).unwrap();
        assert_eq!(dbs[0].user, "expanded_user");
    }

    #[test]
    fn encrypted_passwords_roundtrip_through_discovery() {
        let envelope = crypto::encrypt_password("key", "secret").unwrap();
        let mut dbs = vec![MonitoredDatabase {
            unique_name: "enc1".into(),
            password: envelope,
            password_type: ENCRYPTED_PASSWORD_TYPE.into(),
            ..Default::default()
        }];
        decrypt_passwords(&mut dbs, Some("key"));
        assert_eq!(dbs[0].password, "secret");
    }
}
