//! Per-sink delivery with bounded retry.
//!
//! One task owns every configured sink (at most two, for HA fan-out).
//! Incoming batches go straight to the sink when its retry queue is
//! empty, else to the front of the queue. When the inbound channel is
//! idle, eligible queues are drained oldest-first, up to 100 bundles a
//! pass; a failed sink is retried at most every 10 seconds, and drop
//! warnings are suppressed to one per 10 seconds per sink.

use crate::retry::RetryQueue;
use crate::MetricsSink;
use pgsentry_common::stats;
use pgsentry_common::types::StoreMessage;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// Retry queue cap, in queued batches per sink.
pub const PERSIST_QUEUE_MAX: usize = 10_000;
const RETRY_COOLDOWN: Duration = Duration::from_secs(10);
const DROP_WARN_INTERVAL: Duration = Duration::from_secs(10);
const DRAIN_PASS_LIMIT: usize = 100;
const IDLE_POLL: Duration = Duration::from_millis(100);

struct SinkState {
    sink: Box<dyn MetricsSink>,
    queue: RetryQueue,
    last_try: Option<Instant>,
    in_error: bool,
    last_drop_warn: Option<Instant>,
}

impl SinkState {
    fn new(sink: Box<dyn MetricsSink>) -> Self {
        Self {
            sink,
            queue: RetryQueue::new(PERSIST_QUEUE_MAX),
            last_try: None,
            in_error: false,
            last_drop_warn: None,
        }
    }

    fn queue_with_accounting(&mut self, batch: Vec<StoreMessage>) {
        let dropped = self.queue.push(batch);
        if dropped.dropped_any() {
            stats::record_dropped_points(dropped.datapoints);
            let warn_due = self
                .last_drop_warn
                .map_or(true, |t| t.elapsed() >= DROP_WARN_INTERVAL);
            if warn_due {
                tracing::warn!(
                    sink = self.sink.name(),
                    datasets = dropped.datasets,
                    datapoints = dropped.datapoints,
                    queue_max = PERSIST_QUEUE_MAX,
                    "dropped oldest data sets, retry queue full"
                );
                self.last_drop_warn = Some(Instant::now());
            }
        }
    }

    async fn write_timed(&mut self, batch: &[StoreMessage]) -> bool {
        let started = Instant::now();
        match self.sink.write(batch).await {
            Ok(()) => {
                stats::record_successful_write(started.elapsed().as_micros() as u64);
                true
            }
            Err(e) => {
                stats::record_write_failure();
                tracing::error!(sink = self.sink.name(), error = %e, "failed to write into datastore");
                false
            }
        }
    }

    async fn handle_incoming(&mut self, batch: Vec<StoreMessage>) {
        if !self.queue.is_empty() {
            self.queue_with_accounting(batch);
            return;
        }
        self.last_try = Some(Instant::now());
        if !self.write_timed(&batch).await {
            self.in_error = true;
            self.queue_with_accounting(batch);
        }
    }

    fn drain_eligible(&self) -> bool {
        if self.queue.is_empty() {
            return false;
        }
        !self.in_error || self.last_try.map_or(true, |t| t.elapsed() >= RETRY_COOLDOWN)
    }

    /// Deliver up to [`DRAIN_PASS_LIMIT`] queued batches, oldest first.
    async fn drain_pass(&mut self) {
        let mut delivered = 0usize;
        self.last_try = Some(Instant::now());
        while let Some(batch) = self.queue.oldest() {
            let batch = batch.clone();
            if !self.write_timed(&batch).await {
                self.in_error = true;
                return;
            }
            self.queue.pop_oldest();
            delivered += 1;
            if delivered >= DRAIN_PASS_LIMIT {
                break;
            }
        }
        if delivered > 0 {
            tracing::debug!(sink = self.sink.name(), delivered, "retry queue drained");
        }
        self.in_error = false;
    }
}

pub async fn run_persister(
    sinks: Vec<Box<dyn MetricsSink>>,
    mut input: mpsc::Receiver<Vec<StoreMessage>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut states: Vec<SinkState> = sinks.into_iter().map(SinkState::new).collect();
    if states.is_empty() {
        tracing::error!("persister started without sinks");
        return;
    }

    loop {
        tokio::select! {
            received = input.recv() => {
                match received {
                    Some(batch) => {
                        for state in states.iter_mut() {
                            state.handle_incoming(batch.clone()).await;
                        }
                    }
                    None => break,
                }
            }
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(IDLE_POLL) => {
                for state in states.iter_mut() {
                    if state.drain_eligible() {
                        state.drain_pass().await;
                    }
                }
            }
        }
    }

    // best-effort final drain, one pass per sink
    for state in states.iter_mut() {
        if !state.queue.is_empty() {
            tracing::info!(
                sink = state.sink.name(),
                queued = state.queue.len(),
                "draining retry queue before exit"
            );
            state.drain_pass().await;
        }
    }
    tracing::info!("persister stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use pgsentry_common::types::{MetricRow, MetricValue};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FlakySink {
        healthy: Arc<AtomicBool>,
        delivered: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MetricsSink for FlakySink {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn write(&mut self, batch: &[StoreMessage]) -> Result<()> {
            if self.healthy.load(Ordering::SeqCst) {
                self.delivered.fetch_add(batch.len(), Ordering::SeqCst);
                Ok(())
            } else {
                Err(anyhow!("sink down"))
            }
        }
    }

    fn batch(label: &str) -> Vec<StoreMessage> {
        let mut row = MetricRow::new();
        row.insert("epoch_ns".into(), MetricValue::Int(1));
        vec![StoreMessage {
            db_unique: label.to_string(),
            metric_name: "m".into(),
            data: vec![row],
            ..Default::default()
        }]
    }

    #[tokio::test]
    async fn healthy_sink_gets_batches_directly() {
        let healthy = Arc::new(AtomicBool::new(true));
        let delivered = Arc::new(AtomicUsize::new(0));
        let sink = FlakySink {
            healthy: Arc::clone(&healthy),
            delivered: Arc::clone(&delivered),
        };
        let mut state = SinkState::new(Box::new(sink));

        state.handle_incoming(batch("a")).await;
        state.handle_incoming(batch("b")).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
        assert!(state.queue.is_empty());
        assert!(!state.in_error);
    }

    #[tokio::test]
    async fn failed_writes_queue_and_drain_after_recovery() {
        let healthy = Arc::new(AtomicBool::new(false));
        let delivered = Arc::new(AtomicUsize::new(0));
        let sink = FlakySink {
            healthy: Arc::clone(&healthy),
            delivered: Arc::clone(&delivered),
        };
        let mut state = SinkState::new(Box::new(sink));

        state.handle_incoming(batch("a")).await;
        assert!(state.in_error);
        assert_eq!(state.queue.len(), 1);

        // with a non-empty queue, later batches queue without a write
        state.handle_incoming(batch("b")).await;
        assert_eq!(state.queue.len(), 2);
        assert_eq!(delivered.load(Ordering::SeqCst), 0);

        // in-error sink within cooldown is not drain-eligible
        assert!(!state.drain_eligible());

        healthy.store(true, Ordering::SeqCst);
        state.last_try = Some(Instant::now() - RETRY_COOLDOWN);
        assert!(state.drain_eligible());
        state.drain_pass().await;
        assert!(state.queue.is_empty());
        assert!(!state.in_error);
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persister_task_fans_out_and_shuts_down() {
        let healthy = Arc::new(AtomicBool::new(true));
        let delivered_a = Arc::new(AtomicUsize::new(0));
        let delivered_b = Arc::new(AtomicUsize::new(0));
        let sinks: Vec<Box<dyn MetricsSink>> = vec![
            Box::new(FlakySink {
                healthy: Arc::clone(&healthy),
                delivered: Arc::clone(&delivered_a),
            }),
            Box::new(FlakySink {
                healthy: Arc::clone(&healthy),
                delivered: Arc::clone(&delivered_b),
            }),
        ];

        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_persister(sinks, rx, shutdown_rx));

        tx.send(batch("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(delivered_a.load(Ordering::SeqCst), 1);
        assert_eq!(delivered_b.load(Ordering::SeqCst), 1);
    }
}
