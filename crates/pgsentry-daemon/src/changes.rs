//! DDL / configuration / privilege change detection.
//!
//! The `change_events` pseudo-metric runs a family of hash-collecting
//! queries resolved from the ordinary registry (`sproc_hashes`,
//! `table_hashes`, `index_hashes`, `configuration_hashes`,
//! `privilege_changes`), diffs each result against state carried by
//! the fetcher, and emits per-kind event rows plus one aggregate
//! `object_changes` summary row when anything moved. The first pass
//! over an object class only seeds the state.

use crate::core::Core;
use crate::fetch::METRIC_OBJECT_CHANGES;
use chrono::Utc;
use pgsentry_common::types::{
    FetchMessage, MetricData, MetricRow, MetricValue, StoreMessage, VersionInfo, EPOCH_COLUMN_NAME,
};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// object class -> object identity -> last seen value hash.
pub type ChangeState = HashMap<String, HashMap<String, String>>;

#[derive(Debug, Default, Clone, Copy)]
pub struct ChangeCounts {
    pub created: usize,
    pub altered: usize,
    pub dropped: usize,
}

impl ChangeCounts {
    fn total(&self) -> usize {
        self.created + self.altered + self.dropped
    }

    fn merge(&mut self, other: ChangeCounts) {
        self.created += other.created;
        self.altered += other.altered;
        self.dropped += other.dropped;
    }
}

struct Detector {
    /// Registry metric holding the hash query.
    source_metric: &'static str,
    /// Metric name the event rows are stored under.
    event_metric: &'static str,
    /// Columns identifying one object.
    id_columns: &'static [&'static str],
    /// Column carrying the comparable value.
    value_column: &'static str,
}

const DETECTORS: &[Detector] = &[
    Detector {
        source_metric: "sproc_hashes",
        event_metric: "sproc_changes",
        id_columns: &["tag_sproc", "tag_oid"],
        value_column: "md5",
    },
    Detector {
        source_metric: "table_hashes",
        event_metric: "table_changes",
        id_columns: &["tag_table"],
        value_column: "md5",
    },
    Detector {
        source_metric: "index_hashes",
        event_metric: "index_changes",
        id_columns: &["tag_index"],
        value_column: "md5",
    },
    Detector {
        source_metric: "configuration_hashes",
        event_metric: "configuration_changes",
        id_columns: &["tag_setting"],
        value_column: "value",
    },
    Detector {
        source_metric: "privilege_changes",
        event_metric: "privilege_changes",
        id_columns: &["object_type", "tag_role", "tag_object"],
        value_column: "",
    },
];

fn cell_as_string(value: &MetricValue) -> String {
    match value {
        MetricValue::Text(s) => s.clone(),
        MetricValue::Int(i) => i.to_string(),
        MetricValue::Float(f) => f.to_string(),
        MetricValue::Null => String::new(),
    }
}

fn object_identity(row: &MetricRow, id_columns: &[&str]) -> Option<String> {
    let mut parts = Vec::with_capacity(id_columns.len());
    for column in id_columns {
        parts.push(cell_as_string(row.get(*column)?));
    }
    Some(parts.join(":"))
}

/// Diff freshly fetched rows against the carried state for one object
/// class. Returns the counts and one event row per change; on the
/// seeding pass both are empty.
fn diff_against_state(
    state: &mut HashMap<String, String>,
    data: &MetricData,
    detector: &Detector,
    epoch_ns: i64,
) -> (ChangeCounts, MetricData) {
    let mut counts = ChangeCounts::default();
    let mut events = MetricData::new();
    let first_run = state.is_empty();

    let mut current: HashMap<String, (String, &MetricRow)> = HashMap::new();
    for row in data {
        let Some(identity) = object_identity(row, detector.id_columns) else {
            continue;
        };
        let value = if detector.value_column.is_empty() {
            "present".to_string()
        } else {
            row.get(detector.value_column)
                .map(cell_as_string)
                .unwrap_or_default()
        };
        current.insert(identity, (value, row));
    }

    if first_run {
        for (identity, (value, _)) in current {
            state.insert(identity, value);
        }
        return (counts, events);
    }

    for (identity, (value, row)) in &current {
        let event = match state.get(identity) {
            None => Some("create"),
            Some(previous) if previous != value => Some("alter"),
            Some(_) => None,
        };
        if let Some(event) = event {
            if event == "create" {
                counts.created += 1;
            } else {
                counts.altered += 1;
            }
            let mut event_row = MetricRow::new();
            event_row.insert(EPOCH_COLUMN_NAME.to_string(), MetricValue::Int(epoch_ns));
            for column in detector.id_columns {
                if let Some(cell) = row.get(*column) {
                    event_row.insert((*column).to_string(), cell.clone());
                }
            }
            event_row.insert("event".to_string(), MetricValue::Text(event.to_string()));
            events.push(event_row);
        }
    }

    let dropped: Vec<String> = state
        .keys()
        .filter(|identity| !current.contains_key(*identity))
        .cloned()
        .collect();
    for identity in dropped {
        counts.dropped += 1;
        state.remove(&identity);
        let mut event_row = MetricRow::new();
        event_row.insert(EPOCH_COLUMN_NAME.to_string(), MetricValue::Int(epoch_ns));
        event_row.insert("tag_object".to_string(), MetricValue::Text(identity));
        event_row.insert("event".to_string(), MetricValue::Text("drop".to_string()));
        events.push(event_row);
    }

    for (identity, (value, _)) in current {
        state.insert(identity, value);
    }
    (counts, events)
}

/// Run all change detectors for one endpoint and push the resulting
/// store messages. Detector failures (metric not defined for this
/// server, query errors) skip that detector for the tick.
pub async fn check_for_object_changes(
    core: &Core,
    msg: &FetchMessage,
    vme: &VersionInfo,
    state: &mut ChangeState,
    store_tx: &mpsc::Sender<Vec<StoreMessage>>,
) {
    let epoch_ns = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let custom_tags = core
        .monitored_db(&msg.db_unique)
        .map(|md| md.custom_tags)
        .unwrap_or_default();
    let mut total = ChangeCounts::default();
    let mut messages = Vec::new();

    for detector in DETECTORS {
        let def = match core.registry.resolve(detector.source_metric, vme) {
            Ok(def) if !def.sql.is_empty() => def,
            _ => continue,
        };
        let data = match core
            .connections
            .execute(
                &msg.db_unique,
                Some(std::time::Duration::from_secs(
                    def.metric_attrs.statement_timeout_seconds.max(5) as u64,
                )),
                &def.sql,
            )
            .await
        {
            Ok(result) => pgsentry_collector::rows::messages_to_data(&result),
            Err(e) => {
                tracing::debug!(
                    db = %msg.db_unique,
                    detector = detector.source_metric,
                    error = %e,
                    "change detection query failed"
                );
                continue;
            }
        };

        let class_state = state.entry(detector.source_metric.to_string()).or_default();
        let (counts, events) = diff_against_state(class_state, &data, detector, epoch_ns);
        total.merge(counts);
        if !events.is_empty() {
            messages.push(StoreMessage {
                db_unique: msg.db_unique.clone(),
                kind: msg.kind,
                metric_name: detector.event_metric.to_string(),
                custom_tags: custom_tags.clone(),
                data: events,
                ..Default::default()
            });
        }
    }

    if total.total() > 0 {
        let summary = format!(
            "detected {} object changes: created {}, altered {}, dropped {}",
            total.total(),
            total.created,
            total.altered,
            total.dropped
        );
        tracing::warn!(db = %msg.db_unique, %summary, "object changes detected");
        let mut row = MetricRow::new();
        row.insert(EPOCH_COLUMN_NAME.to_string(), MetricValue::Int(epoch_ns));
        row.insert("details".to_string(), MetricValue::Text(summary));
        messages.push(StoreMessage {
            db_unique: msg.db_unique.clone(),
            kind: msg.kind,
            metric_name: METRIC_OBJECT_CHANGES.to_string(),
            custom_tags,
            data: vec![row],
            ..Default::default()
        });
    }

    if !messages.is_empty() {
        pgsentry_common::stats::record_fetched_points(
            messages.iter().map(|m| m.datapoints()).sum(),
        );
        let _ = store_tx.send(messages).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sproc_row(name: &str, oid: i64, md5: &str) -> MetricRow {
        let mut row = MetricRow::new();
        row.insert("tag_sproc".into(), MetricValue::Text(name.into()));
        row.insert("tag_oid".into(), MetricValue::Int(oid));
        row.insert("md5".into(), MetricValue::Text(md5.into()));
        row
    }

    fn sproc_detector() -> &'static Detector {
        &DETECTORS[0]
    }

    #[test]
    fn first_run_only_seeds_state() {
        let mut state = HashMap::new();
        let data = vec![sproc_row("f1", 1, "aaa"), sproc_row("f2", 2, "bbb")];
        let (counts, events) = diff_against_state(&mut state, &data, sproc_detector(), 1);
        assert_eq!(counts.total(), 0);
        assert!(events.is_empty());
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn create_alter_drop_are_detected() {
        let mut state = HashMap::new();
        let initial = vec![sproc_row("f1", 1, "aaa"), sproc_row("f2", 2, "bbb")];
        diff_against_state(&mut state, &initial, sproc_detector(), 1);

        // f1 altered, f2 dropped, f3 created
        let next = vec![sproc_row("f1", 1, "zzz"), sproc_row("f3", 3, "ccc")];
        let (counts, events) = diff_against_state(&mut state, &next, sproc_detector(), 2);
        assert_eq!(counts.created, 1);
        assert_eq!(counts.altered, 1);
        assert_eq!(counts.dropped, 1);
        assert_eq!(events.len(), 3);

        // state converged: the same snapshot again is quiet
        let (counts, events) = diff_against_state(&mut state, &next, sproc_detector(), 3);
        assert_eq!(counts.total(), 0);
        assert!(events.is_empty());
    }

    #[test]
    fn presence_only_detector_tracks_membership() {
        let detector = &DETECTORS[4];
        let mut row = MetricRow::new();
        row.insert("object_type".into(), MetricValue::Text("table".into()));
        row.insert("tag_role".into(), MetricValue::Text("app".into()));
        row.insert("tag_object".into(), MetricValue::Text("t1".into()));

        let mut state = HashMap::new();
        diff_against_state(&mut state, &vec![row.clone()], detector, 1);
        // grant revoked: the row disappears
        let (counts, events) = diff_against_state(&mut state, &MetricData::new(), detector, 2);
        assert_eq!(counts.dropped, 1);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].get("event"),
            Some(&MetricValue::Text("drop".into()))
        );
    }
}
