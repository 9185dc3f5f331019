//! Version- and extension-aware variant selection.

use crate::error::MetricLookupError;
use crate::MetricDefs;
use pgsentry_common::types::{ExtensionOverride, MetricVersionDef, VersionInfo};

/// Select the variant for `metric` on a server described by `vinfo`:
/// the greatest version key not above the server version. Upwards
/// compatibility of definitions is assumed.
///
/// If the selected variant declares extension-based overrides, the
/// first override whose extension requirements are all satisfied
/// replaces the SQL fields (and only those) with the target metric's.
pub fn resolve(
    defs: &MetricDefs,
    metric: &str,
    vinfo: &VersionInfo,
) -> Result<MetricVersionDef, MetricLookupError> {
    let versions = match defs.get(metric) {
        Some(m) if !m.is_empty() => m,
        _ => {
            return Err(MetricLookupError::NotFound {
                metric: metric.to_string(),
            })
        }
    };

    let selected = versions.range(..=vinfo.version).next_back();
    let def = match selected {
        Some((_, def)) => def.clone(),
        None => {
            let min_version = *versions.keys().next().expect("version map is non-empty");
            if vinfo.version < min_version {
                return Err(MetricLookupError::TooOld {
                    metric: metric.to_string(),
                    server_version: vinfo.version_str.clone(),
                    min_version,
                });
            }
            return Err(MetricLookupError::NotFound {
                metric: metric.to_string(),
            });
        }
    };

    if def.metric_attrs.extension_version_based_overrides.is_empty()
        || vinfo.extensions.is_empty()
    {
        return Ok(def);
    }
    Ok(apply_extension_overrides(defs, metric, def, vinfo))
}

fn override_matches(ovr: &ExtensionOverride, vinfo: &VersionInfo) -> bool {
    ovr.expected_extension_versions.iter().all(|req| {
        vinfo
            .extensions
            .get(&req.ext_name)
            .is_some_and(|installed| *installed >= req.ext_min_version)
    })
}

fn apply_extension_overrides(
    defs: &MetricDefs,
    metric: &str,
    mut def: MetricVersionDef,
    vinfo: &VersionInfo,
) -> MetricVersionDef {
    let overrides = def.metric_attrs.extension_version_based_overrides.clone();
    for ovr in &overrides {
        if !override_matches(ovr, vinfo) {
            continue;
        }
        match resolve(defs, &ovr.target_metric, vinfo) {
            Ok(target) => {
                tracing::debug!(
                    metric,
                    target = %ovr.target_metric,
                    "applying extension version based override"
                );
                if !target.sql.is_empty() {
                    def.sql = target.sql;
                }
                if !target.sql_su.is_empty() {
                    def.sql_su = target.sql_su;
                }
                break;
            }
            Err(e) => {
                tracing::warn!(
                    metric,
                    target = %ovr.target_metric,
                    error = %e,
                    "extension based override target not resolvable"
                );
            }
        }
    }
    def
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgsentry_common::types::{ExtensionInfo, MetricAttrs};
    use rust_decimal::Decimal;
    use std::collections::BTreeMap;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn vinfo(version: &str) -> VersionInfo {
        VersionInfo {
            version: dec(version),
            version_str: version.to_string(),
            ..Default::default()
        }
    }

    fn def_with_sql(sql: &str) -> MetricVersionDef {
        MetricVersionDef {
            sql: sql.to_string(),
            ..Default::default()
        }
    }

    fn defs_for(metric: &str, versions: &[(&str, &str)]) -> MetricDefs {
        let mut defs = MetricDefs::new();
        let mut inner = BTreeMap::new();
        for (ver, sql) in versions {
            inner.insert(dec(ver), def_with_sql(sql));
        }
        defs.insert(metric.to_string(), inner);
        defs
    }

    #[test]
    fn picks_greatest_version_not_above_server() {
        let defs = defs_for("x", &[("9.6", "sql96"), ("11", "sql11"), ("13", "sql13")]);
        let def = resolve(&defs, "x", &vinfo("12.4")).unwrap();
        assert_eq!(def.sql, "sql11");

        let def = resolve(&defs, "x", &vinfo("13")).unwrap();
        assert_eq!(def.sql, "sql13");
    }

    #[test]
    fn server_older_than_all_variants_is_too_old() {
        let defs = defs_for("x", &[("9.6", "sql96"), ("11", "sql11"), ("13", "sql13")]);
        let err = resolve(&defs, "x", &vinfo("9.4")).unwrap_err();
        assert!(err.is_too_old());
        match err {
            MetricLookupError::TooOld { min_version, .. } => {
                assert_eq!(min_version, dec("9.6"));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn unknown_metric_is_not_found() {
        let defs = defs_for("x", &[("9.6", "sql96")]);
        let err = resolve(&defs, "y", &vinfo("14")).unwrap_err();
        assert_eq!(
            err,
            MetricLookupError::NotFound {
                metric: "y".to_string()
            }
        );
    }

    #[test]
    fn extension_override_replaces_only_sql_fields() {
        let mut defs = defs_for("x_pss18", &[("13", "override sql")]);
        let mut base = def_with_sql("base sql");
        base.sql_su = "base su sql".to_string();
        base.master_only = true;
        base.metric_attrs = MetricAttrs {
            extension_version_based_overrides: vec![ExtensionOverride {
                target_metric: "x_pss18".to_string(),
                expected_extension_versions: vec![ExtensionInfo {
                    ext_name: "pg_stat_statements".to_string(),
                    ext_min_version: dec("1.8"),
                }],
            }],
            ..Default::default()
        };
        defs.insert("x".to_string(), BTreeMap::from([(dec("13"), base)]));

        let mut v = vinfo("14");
        v.extensions
            .insert("pg_stat_statements".to_string(), dec("1.9"));

        let def = resolve(&defs, "x", &v).unwrap();
        assert_eq!(def.sql, "override sql");
        // target has no superuser SQL, so the base one survives
        assert_eq!(def.sql_su, "base su sql");
        assert!(def.master_only);
        assert!(!def.metric_attrs.extension_version_based_overrides.is_empty());
    }

    #[test]
    fn extension_override_requires_minimum_version() {
        let mut defs = defs_for("x_pss18", &[("13", "override sql")]);
        let mut base = def_with_sql("base sql");
        base.metric_attrs.extension_version_based_overrides = vec![ExtensionOverride {
            target_metric: "x_pss18".to_string(),
            expected_extension_versions: vec![ExtensionInfo {
                ext_name: "pg_stat_statements".to_string(),
                ext_min_version: dec("1.8"),
            }],
        }];
        defs.insert("x".to_string(), BTreeMap::from([(dec("13"), base)]));

        let mut v = vinfo("14");
        v.extensions
            .insert("pg_stat_statements".to_string(), dec("1.7"));

        let def = resolve(&defs, "x", &v).unwrap();
        assert_eq!(def.sql, "base sql");
    }
}
