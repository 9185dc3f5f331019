//! Process-wide gatherer statistics.
//!
//! Plain single-word atomics, incremented from the fetch and persist
//! paths without any locking. Everything else in the daemon hangs off
//! an explicitly constructed core value; the counters stay global so a
//! deeply nested write path never has to thread a handle through.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::OnceLock;

pub static TOTAL_METRICS_FETCHED: AtomicU64 = AtomicU64::new(0);
pub static METRICS_REUSED_FROM_CACHE: AtomicU64 = AtomicU64::new(0);
pub static TOTAL_DATASETS_FETCHED: AtomicU64 = AtomicU64::new(0);
pub static METRICS_DROPPED: AtomicU64 = AtomicU64::new(0);
pub static METRIC_FETCH_FAILURES: AtomicU64 = AtomicU64::new(0);
pub static DATASTORE_WRITE_FAILURES: AtomicU64 = AtomicU64::new(0);
pub static DATASTORE_WRITE_SUCCESSES: AtomicU64 = AtomicU64::new(0);
pub static DATASTORE_WRITE_TIME_US: AtomicU64 = AtomicU64::new(0);
pub static LAST_SUCCESSFUL_WRITE_EPOCH: AtomicI64 = AtomicI64::new(0);
/// -1 until the first summarizer tick.
pub static POINTS_PER_MINUTE_LAST_5MIN: AtomicI64 = AtomicI64::new(-1);

static START_TIME: OnceLock<DateTime<Utc>> = OnceLock::new();

/// Record process start; idempotent, first call wins.
pub fn mark_started() {
    let _ = START_TIME.set(Utc::now());
}

pub fn uptime_seconds() -> i64 {
    let started = START_TIME.get().copied().unwrap_or_else(Utc::now);
    (Utc::now() - started).num_seconds().max(0)
}

pub fn record_fetched_points(n: usize) {
    TOTAL_METRICS_FETCHED.fetch_add(n as u64, Ordering::Relaxed);
}

pub fn record_cache_hit_points(n: usize) {
    METRICS_REUSED_FROM_CACHE.fetch_add(n as u64, Ordering::Relaxed);
}

pub fn record_dataset_fetched() {
    TOTAL_DATASETS_FETCHED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_dropped_points(n: usize) {
    METRICS_DROPPED.fetch_add(n as u64, Ordering::Relaxed);
}

pub fn record_fetch_failure() {
    METRIC_FETCH_FAILURES.fetch_add(1, Ordering::Relaxed);
}

pub fn record_write_failure() {
    DATASTORE_WRITE_FAILURES.fetch_add(1, Ordering::Relaxed);
}

pub fn record_successful_write(elapsed_us: u64) {
    DATASTORE_WRITE_SUCCESSES.fetch_add(1, Ordering::Relaxed);
    DATASTORE_WRITE_TIME_US.fetch_add(elapsed_us, Ordering::Relaxed);
    LAST_SUCCESSFUL_WRITE_EPOCH.store(Utc::now().timestamp(), Ordering::Relaxed);
}

/// A consistent-enough snapshot of all counters for the stats endpoint.
#[derive(Debug, Clone, Copy)]
pub struct CounterSnapshot {
    pub total_metrics_fetched: u64,
    pub metrics_reused_from_cache: u64,
    pub total_datasets_fetched: u64,
    pub metrics_dropped: u64,
    pub metric_fetch_failures: u64,
    pub datastore_write_failures: u64,
    pub datastore_write_successes: u64,
    pub datastore_write_time_us: u64,
    pub last_successful_write_epoch: i64,
    pub points_per_minute_last_5min: i64,
    pub uptime_seconds: i64,
}

pub fn snapshot() -> CounterSnapshot {
    CounterSnapshot {
        total_metrics_fetched: TOTAL_METRICS_FETCHED.load(Ordering::Relaxed),
        metrics_reused_from_cache: METRICS_REUSED_FROM_CACHE.load(Ordering::Relaxed),
        total_datasets_fetched: TOTAL_DATASETS_FETCHED.load(Ordering::Relaxed),
        metrics_dropped: METRICS_DROPPED.load(Ordering::Relaxed),
        metric_fetch_failures: METRIC_FETCH_FAILURES.load(Ordering::Relaxed),
        datastore_write_failures: DATASTORE_WRITE_FAILURES.load(Ordering::Relaxed),
        datastore_write_successes: DATASTORE_WRITE_SUCCESSES.load(Ordering::Relaxed),
        datastore_write_time_us: DATASTORE_WRITE_TIME_US.load(Ordering::Relaxed),
        last_successful_write_epoch: LAST_SUCCESSFUL_WRITE_EPOCH.load(Ordering::Relaxed),
        points_per_minute_last_5min: POINTS_PER_MINUTE_LAST_5MIN.load(Ordering::Relaxed),
        uptime_seconds: uptime_seconds(),
    }
}

impl CounterSnapshot {
    /// Average successful write latency in milliseconds, 0.0 before the
    /// first successful write.
    pub fn avg_successful_write_time_ms(&self) -> f64 {
        if self.datastore_write_successes == 0 {
            return 0.0;
        }
        self.datastore_write_time_us as f64 / self.datastore_write_successes as f64 / 1000.0
    }

    /// Points per minute, falling back to a whole-uptime average until
    /// the summarizer has produced its first 5-minute figure.
    pub fn effective_points_per_minute(&self) -> i64 {
        if self.points_per_minute_last_5min >= 0 {
            return self.points_per_minute_last_5min;
        }
        if self.uptime_seconds <= 0 {
            return 0;
        }
        (self.total_metrics_fetched * 60 / self.uptime_seconds as u64) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_latency_average() {
        let snap = CounterSnapshot {
            total_metrics_fetched: 0,
            metrics_reused_from_cache: 0,
            total_datasets_fetched: 0,
            metrics_dropped: 0,
            metric_fetch_failures: 0,
            datastore_write_failures: 0,
            datastore_write_successes: 4,
            datastore_write_time_us: 10_000,
            last_successful_write_epoch: 0,
            points_per_minute_last_5min: -1,
            uptime_seconds: 120,
        };
        assert!((snap.avg_successful_write_time_ms() - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn points_per_minute_falls_back_to_uptime_average() {
        let mut snap = CounterSnapshot {
            total_metrics_fetched: 600,
            metrics_reused_from_cache: 0,
            total_datasets_fetched: 0,
            metrics_dropped: 0,
            metric_fetch_failures: 0,
            datastore_write_failures: 0,
            datastore_write_successes: 0,
            datastore_write_time_us: 0,
            last_successful_write_epoch: 0,
            points_per_minute_last_5min: -1,
            uptime_seconds: 60,
        };
        assert_eq!(snap.effective_points_per_minute(), 600);
        snap.points_per_minute_last_5min = 42;
        assert_eq!(snap.effective_points_per_minute(), 42);
    }
}
