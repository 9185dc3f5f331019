//! Time-series sinks and the persistence pipeline.
//!
//! Fetchers push store messages into the batch channel; the batcher
//! coalesces them by size and time; the persister fans each batch out
//! to the configured sinks (up to two for HA), maintaining a bounded
//! retry queue per sink. Recent observations are preferred during an
//! outage: new batches go to the front of the queue and overflow drops
//! from the back.

pub mod batcher;
pub mod graphite;
pub mod jsonfile;
pub mod persister;
pub mod postgres;
pub mod retry;
pub mod snapshot;

use anyhow::Result;
use async_trait::async_trait;
use pgsentry_common::types::StoreMessage;

/// A destination for store messages. Implementations keep their own
/// connection state and clear their own caches on errors that imply
/// external interference (a dropped partition, a closed socket).
#[async_trait]
pub trait MetricsSink: Send {
    fn name(&self) -> &str;

    /// Deliver one batch. An error leaves the batch with the caller
    /// for retry; the sink must be usable again on the next call.
    async fn write(&mut self, batch: &[StoreMessage]) -> Result<()>;
}
