//! The core fetch procedure: resolve, gate, execute, post-process.

use crate::changes::{self, ChangeState};
use crate::core::Core;
use anyhow::{anyhow, Result};
use chrono::Utc;
use pgsentry_collector::pools;
use pgsentry_common::stats;
use pgsentry_common::types::{
    DbKind, FetchMessage, MetricData, MetricRow, MetricValue, MetricVersionDef, StoreMessage,
    VersionInfo, EPOCH_COLUMN_NAME, TAG_PREFIX,
};
use regex::Regex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::mpsc;

pub const RECO_PREFIX: &str = "reco_";
pub const RECO_METRIC_NAME: &str = "recommendations";
pub const METRIC_CHANGE_EVENTS: &str = "change_events";
pub const METRIC_INSTANCE_UP: &str = "instance_up";
pub const METRIC_DB_SIZE: &str = "db_size";
pub const METRIC_TABLE_STATS: &str = "table_stats";
pub const METRIC_OBJECT_CHANGES: &str = "object_changes";

/// db_size / table_stats swap to the _approx variant above this size
/// on managed single-server instances with slow filesystem access.
const APPROX_SWAP_SIZE_B: i64 = 1_000_000_000_000;

fn pgbouncer_metric_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^pgbouncer_(stats|pools)$").expect("valid regex"))
}

/// Superuser fallback is an explicit second attempt, nothing more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Normal,
    Superuser,
}

fn now_epoch_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

fn major_version_float(version: Decimal) -> f64 {
    let v = version.to_f64().unwrap_or(0.0);
    if v >= 10.0 {
        v.floor()
    } else {
        v
    }
}

/// Execute one fetch message end to end. `Ok(None)` means "nothing to
/// store this tick" (gated, empty-SQL, or change events already pushed
/// through the store channel).
pub async fn fetch_metrics(
    core: &Core,
    msg: &FetchMessage,
    host_state: &mut ChangeState,
    store_tx: &mpsc::Sender<Vec<StoreMessage>>,
) -> Result<Option<Vec<StoreMessage>>> {
    let mut metric_name = msg.metric_name.clone();

    let vme = core
        .descriptors
        .version_info(&core.connections, &msg.db_unique, msg.kind, false)
        .await
        .map_err(|e| anyhow!("failed to fetch server version for {}: {e}", msg.db_unique))?;

    // slow-filesystem managed instances get the approximate variants
    if (metric_name == METRIC_DB_SIZE || metric_name == METRIC_TABLE_STATS)
        && vme.exec_env == pgsentry_common::types::ExecEnv::AzureSingle
        && vme.approx_db_size_b > APPROX_SWAP_SIZE_B
    {
        let substitute = format!("{metric_name}_approx");
        if let Ok(approx_def) = core.registry.resolve(&substitute, &vme) {
            if approx_def.metric_attrs.metric_storage_name == metric_name {
                tracing::info!(
                    db = %msg.db_unique,
                    metric = %metric_name,
                    substitute = %substitute,
                    "transparently swapping metric due to hard-coded rules"
                );
                metric_name = substitute;
            }
        }
    }

    // bouncer metric definitions are keyed at version 0 by convention
    let resolution_vme = if msg.kind == DbKind::Pgbouncer {
        let mut v = vme.clone();
        v.version = Decimal::ZERO;
        v
    } else {
        vme.clone()
    };

    let mvp = match core.registry.resolve(&metric_name, &resolution_vme) {
        Ok(def) => def,
        Err(_) if metric_name == RECO_METRIC_NAME => {
            // recommendations are a family of reco_* metrics, the
            // umbrella name itself has no definition
            MetricVersionDef::default()
        }
        Err(e) => {
            let complaint_key = format!("{metric_name}|{}", resolution_vme.version);
            if core.should_complain_lookup(&complaint_key) {
                tracing::info!(
                    metric = %metric_name,
                    version = %vme.version_str,
                    error = %e,
                    "failed to get SQL for metric"
                );
            }
            if e.is_too_old() {
                return Ok(None);
            }
            return Err(e.into());
        }
    };

    let cache_window = Duration::from_secs(core.config.gatherer.instance_cache_max_seconds);
    let cacheable = msg.kind.shares_instance()
        && mvp.metric_attrs.is_instance_level
        && !cache_window.is_zero()
        && msg.interval > cache_window;
    if cacheable {
        if let Some(cached) =
            core.instance_cache
                .get_if_fresh(&msg.db_unique_orig, &metric_name, cache_window)
        {
            tracing::debug!(
                db = %msg.db_unique,
                metric = %metric_name,
                source = %msg.db_unique_orig,
                "reading metric data from the instance cache"
            );
            stats::record_cache_hit_points(cached.len());
            return Ok(Some(vec![build_store_message(
                core, msg, &metric_name, &mvp, &vme, cached,
            )]));
        }
    }

    if (mvp.master_only && vme.is_in_recovery) || (mvp.standby_only && !vme.is_in_recovery) {
        tracing::debug!(
            db = %msg.db_unique,
            metric = %metric_name,
            in_recovery = vme.is_in_recovery,
            "skipping fetch, server not in wanted state"
        );
        return Ok(None);
    }

    let mut data: MetricData;
    if metric_name == METRIC_CHANGE_EVENTS {
        changes::check_for_object_changes(core, msg, &vme, host_state, store_tx).await;
        return Ok(None);
    } else if metric_name == RECO_METRIC_NAME {
        data = get_recommendations(core, msg, &vme).await;
    } else if msg.kind == DbKind::Pgpool {
        let messages = core
            .connections
            .execute(&msg.db_unique, None, &mvp.sql)
            .await?;
        data = pools::normalize_pgpool_rows(pgsentry_collector::rows::messages_to_data(&messages));
    } else {
        data = match execute_with_fallback(core, msg, &metric_name, &mvp, &vme).await? {
            Some(data) => data,
            None => return Ok(None),
        };

        if msg.kind.normalizes_rows() && pgbouncer_metric_re().is_match(&metric_name) {
            let md = core
                .monitored_db(&msg.db_unique)
                .ok_or_else(|| anyhow!("monitored DB {} not found", msg.db_unique))?;
            data = pools::normalize_pgbouncer_rows(data, &md.dbname, vme.version);
        }

        core.descriptors.clear_unreachable(&msg.db_unique);
    }

    if cacheable {
        core.instance_cache
            .put(&msg.db_unique_orig, &metric_name, &data);
    }

    if (core.config.gatherer.add_real_dbname || core.config.gatherer.add_system_identifier)
        && msg.kind == DbKind::Postgres
    {
        enrich_identity_tags(core, &mut data, &vme);
    }

    stats::record_fetched_points(data.len());
    Ok(Some(vec![build_store_message(
        core, msg, &metric_name, &mvp, &vme, data,
    )]))
}

/// Run the metric SQL with an explicit normal/superuser attempt pair.
/// `Ok(None)` means an empty (dummy) SQL definition.
async fn execute_with_fallback(
    core: &Core,
    msg: &FetchMessage,
    metric_name: &str,
    mvp: &MetricVersionDef,
    vme: &VersionInfo,
) -> Result<Option<MetricData>> {
    let has_su = !mvp.sql_su.is_empty();
    let attempts: Vec<Attempt> = if core.config.gatherer.no_helper_functions
        && mvp.calls_helper_functions
        && has_su
    {
        tracing::debug!(
            db = %msg.db_unique,
            metric = %metric_name,
            "using superuser SQL, helper functions disabled"
        );
        vec![Attempt::Superuser]
    } else if vme.is_superuser && has_su {
        vec![Attempt::Superuser]
    } else if has_su {
        vec![Attempt::Normal, Attempt::Superuser]
    } else {
        vec![Attempt::Normal]
    };

    let stmt_timeout = effective_statement_timeout(core, msg);
    let mut first_err: Option<anyhow::Error> = None;

    for (index, attempt) in attempts.iter().enumerate() {
        let sql = match attempt {
            Attempt::Normal => &mvp.sql,
            Attempt::Superuser => &mvp.sql_su,
        };
        if sql.is_empty() {
            tracing::debug!(
                db = %msg.db_unique,
                metric = %metric_name,
                "ignoring fetch message, empty/dummy SQL"
            );
            return Ok(None);
        }

        match core
            .connections
            .execute(&msg.db_unique, stmt_timeout, sql)
            .await
        {
            Ok(messages) => {
                let data = pgsentry_collector::rows::messages_to_data(&messages);
                tracing::debug!(
                    db = %msg.db_unique,
                    metric = %metric_name,
                    rows = data.len(),
                    "fetched metric rows"
                );
                return Ok(Some(data));
            }
            Err(e) => {
                let message = e.to_string();
                if message.contains("recovery is in progress") && vme.is_in_recovery {
                    // expected on standbys for primary-only functions
                    tracing::debug!(db = %msg.db_unique, metric = %metric_name, error = %message, "failed to fetch metrics");
                    return Err(e);
                }
                if metric_name == METRIC_INSTANCE_UP {
                    tracing::debug!(
                        db = %msg.db_unique,
                        error = %message,
                        "instance_up fetch failed, marking instance as down"
                    );
                    let mut row = MetricRow::new();
                    row.insert(EPOCH_COLUMN_NAME.to_string(), MetricValue::Int(now_epoch_ns()));
                    row.insert("is_up".to_string(), MetricValue::Int(0));
                    return Ok(Some(vec![row]));
                }
                if message.contains("connection refused") {
                    core.descriptors.set_unreachable(&msg.db_unique);
                }

                let is_last = index + 1 == attempts.len();
                if !is_last {
                    tracing::info!(
                        db = %msg.db_unique,
                        metric = %metric_name,
                        "normal fetch failed, retrying with superuser SQL"
                    );
                    first_err = Some(e);
                    continue;
                }
                tracing::info!(db = %msg.db_unique, metric = %metric_name, error = %message, "failed to fetch metrics");
                return Err(first_err.unwrap_or(e));
            }
        }
    }
    unreachable!("attempt list is never empty")
}

fn effective_statement_timeout(core: &Core, msg: &FetchMessage) -> Option<Duration> {
    if !msg.kind.is_postgres_family() {
        return None;
    }
    let timeout_s = if msg.stmt_timeout_override > 0 {
        msg.stmt_timeout_override
    } else {
        core.monitored_db(&msg.db_unique)
            .map(|md| md.stmt_timeout)
            .unwrap_or(5)
    };
    Some(Duration::from_secs(timeout_s.max(0) as u64))
}

fn enrich_identity_tags(core: &Core, data: &mut MetricData, vme: &VersionInfo) {
    let gatherer = &core.config.gatherer;
    for row in data.iter_mut() {
        if gatherer.add_real_dbname && !vme.real_dbname.is_empty() {
            let key = format!("{TAG_PREFIX}{}", gatherer.real_dbname_field);
            let absent = row.get(&key).map_or(true, MetricValue::is_empty);
            if absent {
                row.insert(key, MetricValue::Text(vme.real_dbname.clone()));
            }
        }
        if gatherer.add_system_identifier && !vme.system_identifier.is_empty() {
            let key = format!("{TAG_PREFIX}{}", gatherer.system_identifier_field);
            let absent = row.get(&key).map_or(true, MetricValue::is_empty);
            if absent {
                row.insert(key, MetricValue::Text(vme.system_identifier.clone()));
            }
        }
    }
}

fn build_store_message(
    core: &Core,
    msg: &FetchMessage,
    metric_name: &str,
    mvp: &MetricVersionDef,
    vme: &VersionInfo,
    data: MetricData,
) -> StoreMessage {
    let custom_tags = core
        .monitored_db(&msg.db_unique)
        .map(|md| md.custom_tags)
        .unwrap_or_default();
    // reroute to the storage name when the definition asks for it
    let stored_name = if mvp.metric_attrs.metric_storage_name.is_empty() {
        metric_name.to_string()
    } else {
        tracing::debug!(
            db = %msg.db_unique,
            metric = %metric_name,
            storage_name = %mvp.metric_attrs.metric_storage_name,
            "rerouting metric data based on metric attributes"
        );
        mvp.metric_attrs.metric_storage_name.clone()
    };
    StoreMessage {
        db_unique: msg.db_unique.clone(),
        kind: msg.kind,
        metric_name: stored_name,
        custom_tags,
        data,
        definition: mvp.clone(),
        real_dbname: vme.real_dbname.clone(),
        system_identifier: vme.system_identifier.clone(),
    }
}

/// Run every non-private reco_* metric and merge the results, tagged
/// with the major server version. Always returns at least a
/// placeholder row so dashboards have something to select.
pub async fn get_recommendations(core: &Core, msg: &FetchMessage, vme: &VersionInfo) -> MetricData {
    let start_epoch_ns = now_epoch_ns();
    let major_ver = major_version_float(vme.version);
    let mut out = MetricData::new();

    let reco_metrics = core.registry.metric_names_with_prefix(RECO_PREFIX);
    tracing::debug!(
        db = %msg.db_unique,
        count = reco_metrics.len(),
        "processing recommendation metrics"
    );
    for reco in reco_metrics {
        let def = match core.registry.resolve(&reco, vme) {
            Ok(def) if !def.metric_attrs.is_private => def,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(metric = %reco, version = %vme.version_str, error = %e, "could not get SQL definition");
                continue;
            }
        };
        let stmt_timeout = effective_statement_timeout(core, msg);
        match core
            .connections
            .execute(&msg.db_unique, stmt_timeout, &def.sql)
            .await
        {
            Ok(messages) => {
                for mut row in pgsentry_collector::rows::messages_to_data(&messages) {
                    row.insert(EPOCH_COLUMN_NAME.to_string(), MetricValue::Int(start_epoch_ns));
                    row.insert("major_ver".to_string(), MetricValue::Float(major_ver));
                    out.push(row);
                }
            }
            Err(e) => {
                // missing exotic extensions are expected here
                if e.to_string().contains("does not exist") {
                    tracing::info!(db = %msg.db_unique, metric = %reco, error = %e, "could not execute recommendations SQL");
                } else {
                    tracing::error!(db = %msg.db_unique, metric = %reco, error = %e, "could not execute recommendations SQL");
                }
            }
        }
    }

    if out.is_empty() {
        let mut dummy = MetricRow::new();
        dummy.insert("tag_reco_topic".to_string(), MetricValue::Text("dummy".into()));
        dummy.insert("tag_object_name".to_string(), MetricValue::Text("-".into()));
        dummy.insert(
            "recommendation".to_string(),
            MetricValue::Text("no recommendations".into()),
        );
        dummy.insert(EPOCH_COLUMN_NAME.to_string(), MetricValue::Int(start_epoch_ns));
        dummy.insert("major_ver".to_string(), MetricValue::Float(major_ver));
        out.push(dummy);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn major_version_flooring() {
        assert_eq!(major_version_float(Decimal::from_str("14.11").unwrap()), 14.0);
        assert_eq!(major_version_float(Decimal::from_str("9.6").unwrap()), 9.6);
    }

    #[test]
    fn pgbouncer_metric_names() {
        assert!(pgbouncer_metric_re().is_match("pgbouncer_stats"));
        assert!(pgbouncer_metric_re().is_match("pgbouncer_pools"));
        assert!(!pgbouncer_metric_re().is_match("pgbouncer_clients"));
    }

}
