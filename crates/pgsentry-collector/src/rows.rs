//! Simple-query results to the dynamic row model.

use pgsentry_common::types::{MetricData, MetricRow, MetricValue};
use tokio_postgres::SimpleQueryMessage;

/// Collect all data rows out of a simple-query exchange, narrowing
/// every text cell to int, float, or text. Command tags and row
/// descriptions are skipped, so a leading `SET` contributes nothing.
pub fn messages_to_data(messages: &[SimpleQueryMessage]) -> MetricData {
    let mut data = MetricData::new();
    for message in messages {
        if let SimpleQueryMessage::Row(row) = message {
            let mut out = MetricRow::new();
            for (idx, column) in row.columns().iter().enumerate() {
                out.insert(column.name().to_string(), MetricValue::from_cell(row.get(idx)));
            }
            data.push(out);
        }
    }
    data
}

/// First cell of the first row, for single-value probe queries.
pub fn first_cell(messages: &[SimpleQueryMessage]) -> Option<MetricValue> {
    for message in messages {
        if let SimpleQueryMessage::Row(row) = message {
            return Some(MetricValue::from_cell(row.get(0)));
        }
    }
    None
}
