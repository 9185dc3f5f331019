//! Graphite plaintext-protocol sink.
//!
//! Path layout: `pgwatch3.<metric>.<dbname>.<column>` — kept
//! wire-compatible with the dashboards built against the original
//! collector. Tag columns are not representable in the plaintext
//! protocol and are skipped, as are NULL/empty and non-numeric values.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use pgsentry_common::types::{
    row_epoch_ns, MetricValue, StoreMessage, EPOCH_COLUMN_NAME, TAG_PREFIX,
};
use std::fmt::Write as _;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

pub const GRAPHITE_METRICS_PREFIX: &str = "pgwatch3";

pub struct GraphiteSink {
    name: String,
    host: String,
    port: u16,
    stream: Option<TcpStream>,
}

impl GraphiteSink {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            stream: None,
        }
    }

    async fn stream(&mut self) -> Result<&mut TcpStream> {
        if self.stream.is_none() {
            tracing::debug!(host = %self.host, port = self.port, "connecting to graphite");
            let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
            self.stream = Some(stream);
        }
        Ok(self.stream.as_mut().expect("stream just ensured"))
    }
}

/// Render one batch into plaintext protocol lines.
pub fn render_lines(batch: &[StoreMessage]) -> String {
    let mut out = String::new();
    for message in batch {
        let base = format!(
            "{GRAPHITE_METRICS_PREFIX}.{}.{}.",
            message.metric_name, message.db_unique
        );
        for row in &message.data {
            let epoch_s = match row_epoch_ns(row) {
                Some(ns) => ns / 1_000_000_000,
                None => {
                    tracing::warn!(
                        metric = %message.metric_name,
                        "no epoch_ns found, server time will be used"
                    );
                    Utc::now().timestamp()
                }
            };
            for (column, value) in row {
                if column == EPOCH_COLUMN_NAME
                    || column.starts_with(TAG_PREFIX)
                    || value.is_empty()
                {
                    continue;
                }
                match value {
                    MetricValue::Int(i) => {
                        let _ = writeln!(out, "{base}{column} {i} {epoch_s}");
                    }
                    MetricValue::Float(f) => {
                        let _ = writeln!(out, "{base}{column} {f} {epoch_s}");
                    }
                    MetricValue::Text(_) | MetricValue::Null => {
                        tracing::info!(
                            metric = %message.metric_name,
                            column = %column,
                            "invalid (non-numeric) column type ignored"
                        );
                    }
                }
            }
        }
    }
    out
}

#[async_trait]
impl crate::MetricsSink for GraphiteSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&mut self, batch: &[StoreMessage]) -> Result<()> {
        let payload = render_lines(batch);
        if payload.is_empty() {
            return Ok(());
        }
        let result = async {
            let stream = self.stream().await?;
            stream.write_all(payload.as_bytes()).await?;
            stream.flush().await?;
            Ok(())
        }
        .await;
        if result.is_err() {
            // reconnect on the next attempt
            self.stream = None;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgsentry_common::types::MetricRow;

    #[test]
    fn lines_skip_tags_nulls_and_text() {
        let mut row = MetricRow::new();
        row.insert(EPOCH_COLUMN_NAME.into(), MetricValue::Int(2_000_000_000_000_000_000));
        row.insert("numbackends".into(), MetricValue::Int(7));
        row.insert("cache_hit_ratio".into(), MetricValue::Float(0.93));
        row.insert("tag_datname".into(), MetricValue::Text("app".into()));
        row.insert("state".into(), MetricValue::Text("idle".into()));
        row.insert("empty".into(), MetricValue::Null);

        let batch = vec![StoreMessage {
            db_unique: "prod1".into(),
            metric_name: "db_stats".into(),
            data: vec![row],
            ..Default::default()
        }];
        let lines = render_lines(&batch);
        assert!(lines.contains("pgwatch3.db_stats.prod1.numbackends 7 2000000000\n"));
        assert!(lines.contains("pgwatch3.db_stats.prod1.cache_hit_ratio 0.93 2000000000\n"));
        assert!(!lines.contains("tag_datname"));
        assert!(!lines.contains("idle"));
        assert!(!lines.contains("empty"));
    }

    #[test]
    fn missing_epoch_uses_server_time() {
        let mut row = MetricRow::new();
        row.insert("value".into(), MetricValue::Int(1));
        let batch = vec![StoreMessage {
            db_unique: "db".into(),
            metric_name: "m".into(),
            data: vec![row],
            ..Default::default()
        }];
        let lines = render_lines(&batch);
        let timestamp: i64 = lines
            .trim()
            .rsplit(' ')
            .next()
            .unwrap()
            .parse()
            .unwrap();
        assert!((timestamp - Utc::now().timestamp()).abs() < 5);
    }
}
