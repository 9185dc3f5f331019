//! Newline-delimited JSON file sink.

use anyhow::{Context, Result};
use async_trait::async_trait;
use pgsentry_common::types::StoreMessage;
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;

pub struct JsonFileSink {
    name: String,
    path: PathBuf,
    add_real_dbname: bool,
    real_dbname_field: String,
    add_system_identifier: bool,
    system_identifier_field: String,
}

impl JsonFileSink {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            add_real_dbname: false,
            real_dbname_field: "real_dbname".to_string(),
            add_system_identifier: false,
            system_identifier_field: "sys_id".to_string(),
        }
    }

    pub fn with_real_dbname(mut self, enabled: bool, field: impl Into<String>) -> Self {
        self.add_real_dbname = enabled;
        self.real_dbname_field = field.into();
        self
    }

    pub fn with_system_identifier(mut self, enabled: bool, field: impl Into<String>) -> Self {
        self.add_system_identifier = enabled;
        self.system_identifier_field = field.into();
        self
    }

    fn render(&self, message: &StoreMessage) -> serde_json::Value {
        let mut record = json!({
            "metric": message.metric_name,
            "data": message.data,
            "dbname": message.db_unique,
            "custom_tags": message.custom_tags,
        });
        let object = record.as_object_mut().expect("record is an object");
        if self.add_real_dbname && !message.real_dbname.is_empty() {
            object.insert(
                self.real_dbname_field.clone(),
                json!(message.real_dbname),
            );
        }
        if self.add_system_identifier && !message.system_identifier.is_empty() {
            object.insert(
                self.system_identifier_field.clone(),
                json!(message.system_identifier),
            );
        }
        record
    }
}

#[async_trait]
impl crate::MetricsSink for JsonFileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&mut self, batch: &[StoreMessage]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .with_context(|| format!("could not open {}", self.path.display()))?;
        tracing::debug!(datasets = batch.len(), path = %self.path.display(), "writing metric sets to JSON file");
        for message in batch {
            let record = self.render(message);
            serde_json::to_writer(&mut file, &record)?;
            file.write_all(b"\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MetricsSink;
    use pgsentry_common::types::{MetricRow, MetricValue};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn message() -> StoreMessage {
        let mut row = MetricRow::new();
        row.insert("epoch_ns".into(), MetricValue::Int(42));
        row.insert("numbackends".into(), MetricValue::Int(3));
        StoreMessage {
            db_unique: "prod1".into(),
            metric_name: "db_stats".into(),
            custom_tags: HashMap::from([("env".to_string(), "prod".to_string())]),
            data: vec![row],
            real_dbname: "app".into(),
            system_identifier: "7224".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn appends_one_json_object_per_message() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("metrics.ndjson");
        let mut sink = JsonFileSink::new("json", &path);

        sink.write(&[message()]).await.unwrap();
        sink.write(&[message()]).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["metric"], "db_stats");
        assert_eq!(parsed["dbname"], "prod1");
        assert_eq!(parsed["custom_tags"]["env"], "prod");
        assert_eq!(parsed["data"][0]["numbackends"], 3);
        assert!(parsed.get("real_dbname").is_none());
    }

    #[tokio::test]
    async fn optional_identity_fields() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("metrics.ndjson");
        let mut sink = JsonFileSink::new("json", &path)
            .with_real_dbname(true, "real_dbname")
            .with_system_identifier(true, "sys_id");

        sink.write(&[message()]).await.unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(parsed["real_dbname"], "app");
        assert_eq!(parsed["sys_id"], "7224");
    }
}
