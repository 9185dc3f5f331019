//! Store message batching.
//!
//! Sits between the fetchers and the persister when a batching delay
//! is configured. Flushes on whichever comes first: the delay ticker
//! with a non-empty buffer, or the buffered datapoint count crossing
//! the cap. Never drops data; a full downstream channel is the
//! intended backpressure.

use pgsentry_common::types::StoreMessage;
use std::time::Duration;
use tokio::sync::mpsc;

/// Flush as soon as a batch holds more datapoints than this.
pub const MAX_BATCH_DATAPOINTS: usize = 1000;

pub async fn run_batcher(
    max_delay_ms: u64,
    mut input: mpsc::Receiver<Vec<StoreMessage>>,
    output: mpsc::Sender<Vec<StoreMessage>>,
) {
    let max_delay_ms = max_delay_ms.max(1);
    let mut ticker = tokio::time::interval(Duration::from_millis(max_delay_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut batch: Vec<StoreMessage> = Vec::new();
    let mut datapoints = 0usize;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    tracing::debug!(datasets = batch.len(), "flushing metric datasets due to batching timeout");
                    if output.send(std::mem::take(&mut batch)).await.is_err() {
                        return;
                    }
                    datapoints = 0;
                }
            }
            received = input.recv() => {
                let Some(messages) = received else {
                    // upstream gone, push out what is left
                    if !batch.is_empty() {
                        let _ = output.send(batch).await;
                    }
                    return;
                };
                for message in messages {
                    datapoints += message.datapoints();
                    batch.push(message);
                    if datapoints > MAX_BATCH_DATAPOINTS {
                        tracing::debug!(
                            datasets = batch.len(),
                            datapoints,
                            "flushing metric datasets due to datapoint cap"
                        );
                        if output.send(std::mem::take(&mut batch)).await.is_err() {
                            return;
                        }
                        datapoints = 0;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgsentry_common::types::{MetricRow, MetricValue};

    fn message_with_points(n: usize) -> StoreMessage {
        let mut data = Vec::new();
        for i in 0..n {
            let mut row = MetricRow::new();
            row.insert("epoch_ns".into(), MetricValue::Int(i as i64));
            data.push(row);
        }
        StoreMessage {
            db_unique: "db1".into(),
            metric_name: "db_stats".into(),
            data,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn datapoint_cap_flushes_without_waiting_for_the_ticker() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        // delay is one minute, only the cap can flush within the test
        tokio::spawn(run_batcher(60_000, in_rx, out_tx));

        in_tx.send(vec![message_with_points(600)]).await.unwrap();
        in_tx.send(vec![message_with_points(600)]).await.unwrap();

        let flushed = tokio::time::timeout(Duration::from_secs(2), out_rx.recv())
            .await
            .expect("cap flush should not wait for the ticker")
            .unwrap();
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed.iter().map(|m| m.datapoints()).sum::<usize>(), 1200);
    }

    #[tokio::test]
    async fn ticker_flushes_small_batches() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        tokio::spawn(run_batcher(50, in_rx, out_tx));

        in_tx.send(vec![message_with_points(3)]).await.unwrap();
        let flushed = tokio::time::timeout(Duration::from_secs(2), out_rx.recv())
            .await
            .expect("delay flush")
            .unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].datapoints(), 3);
    }

    #[tokio::test]
    async fn closing_input_drains_the_buffer() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let handle = tokio::spawn(run_batcher(60_000, in_rx, out_tx));

        in_tx.send(vec![message_with_points(2)]).await.unwrap();
        drop(in_tx);

        let flushed = tokio::time::timeout(Duration::from_secs(2), out_rx.recv())
            .await
            .expect("final drain")
            .unwrap();
        assert_eq!(flushed[0].datapoints(), 2);
        handle.await.unwrap();
    }
}
