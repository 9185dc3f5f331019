//! Row normalization for pool frontends (pgbouncer, pgpool).

use chrono::Utc;
use pgsentry_common::types::{MetricData, MetricValue, EPOCH_COLUMN_NAME};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::OnceLock;

/// pgbouncer switched its counters from int64 to numeric in 1.12.
pub fn bouncer_numeric_counters_start_version() -> Decimal {
    static V: OnceLock<Decimal> = OnceLock::new();
    *V.get_or_init(|| Decimal::from_str("1.12").expect("valid decimal"))
}

/// Filter and rename pgbouncer SHOW STATS / SHOW POOLS rows:
/// keep only the configured pool (all pools when none is configured),
/// always drop the internal `pgbouncer` pool, rename `database` to
/// `tag_database`, and coerce counters to integers for bouncer >= 1.12.
pub fn normalize_pgbouncer_rows(
    data: MetricData,
    database_to_keep: &str,
    bouncer_version: Decimal,
) -> MetricData {
    let mut filtered = MetricData::new();

    for mut row in data {
        let database = match row.shift_remove("database") {
            Some(MetricValue::Text(s)) => s,
            Some(other) => {
                // SHOW output is textual, anything else is unexpected
                other.as_i64().map(|i| i.to_string()).unwrap_or_default()
            }
            None => {
                tracing::warn!("expected 'database' key not found in pool stats, not storing data");
                continue;
            }
        };
        if (!database_to_keep.is_empty() && database != database_to_keep)
            || database == "pgbouncer"
        {
            tracing::debug!(pool = %database, "skipping pool entry, not the configured dbname");
            continue;
        }

        if bouncer_version >= bouncer_numeric_counters_start_version() {
            for (key, value) in row.iter_mut() {
                if key.starts_with("tag_") {
                    continue;
                }
                let coerced = match value {
                    MetricValue::Float(f) => Some(MetricValue::Int(*f as i64)),
                    MetricValue::Text(s) => Decimal::from_str(s)
                        .ok()
                        .map(|d| MetricValue::Int(d.trunc().to_i64().unwrap_or(0))),
                    _ => None,
                };
                if let Some(coerced) = coerced {
                    *value = coerced;
                }
            }
        }

        row.insert("tag_database".to_string(), MetricValue::Text(database));
        filtered.push(row);
    }

    filtered
}

/// pgpool SHOW output: stamp rows that lack the epoch column.
pub fn normalize_pgpool_rows(mut data: MetricData) -> MetricData {
    let now_ns = Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default();
    for row in data.iter_mut() {
        if !row.contains_key(EPOCH_COLUMN_NAME) {
            row.insert(EPOCH_COLUMN_NAME.to_string(), MetricValue::Int(now_ns));
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgsentry_common::types::MetricRow;

    fn bouncer_row(pool: &str, calls: &str) -> MetricRow {
        let mut row = MetricRow::new();
        row.insert("database".into(), MetricValue::Text(pool.into()));
        // simple-query narrowing already turned plain digits into ints;
        // a wide numeric survives as text
        row.insert("total_xact_count".into(), MetricValue::Text(calls.into()));
        row
    }

    #[test]
    fn internal_pool_and_foreign_pools_are_dropped() {
        let data = vec![
            bouncer_row("app", "10"),
            bouncer_row("pgbouncer", "3"),
            bouncer_row("other", "5"),
        ];
        let out = normalize_pgbouncer_rows(data, "app", Decimal::from_str("1.11").unwrap());
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].get("tag_database"),
            Some(&MetricValue::Text("app".into()))
        );
        assert!(!out[0].contains_key("database"));
    }

    #[test]
    fn empty_filter_keeps_all_but_internal() {
        let data = vec![bouncer_row("app", "1"), bouncer_row("pgbouncer", "2")];
        let out = normalize_pgbouncer_rows(data, "", Decimal::from_str("1.11").unwrap());
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn numeric_counters_become_integers_from_1_12() {
        let data = vec![bouncer_row("app", "18446744073709551")];
        let out = normalize_pgbouncer_rows(data, "app", Decimal::from_str("1.12").unwrap());
        assert_eq!(
            out[0].get("total_xact_count"),
            Some(&MetricValue::Int(18_446_744_073_709_551))
        );

        // pre-1.12 counters are left alone
        let data = vec![bouncer_row("app", "123abc")];
        let out = normalize_pgbouncer_rows(data, "app", Decimal::from_str("1.11").unwrap());
        assert_eq!(
            out[0].get("total_xact_count"),
            Some(&MetricValue::Text("123abc".into()))
        );
    }

    #[test]
    fn missing_database_column_drops_the_row() {
        let mut row = MetricRow::new();
        row.insert("calls".into(), MetricValue::Int(1));
        let out = normalize_pgbouncer_rows(vec![row], "", Decimal::from_str("1.12").unwrap());
        assert!(out.is_empty());
    }

    #[test]
    fn pgpool_rows_get_stamped() {
        let mut row = MetricRow::new();
        row.insert("node_id".into(), MetricValue::Int(0));
        let out = normalize_pgpool_rows(vec![row]);
        assert!(out[0].contains_key(EPOCH_COLUMN_NAME));
    }
}
