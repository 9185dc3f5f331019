//! Bounded per-sink retry queue.
//!
//! Temporal order is newest-at-front, oldest-at-back. When the item
//! cap is hit, the oldest bundle is dropped to make room, so during a
//! sink outage the freshest observations survive.

use pgsentry_common::types::StoreMessage;
use std::collections::VecDeque;

/// What one push evicted, if anything.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DropStats {
    pub datasets: usize,
    pub datapoints: usize,
}

impl DropStats {
    pub fn dropped_any(&self) -> bool {
        self.datasets > 0
    }
}

pub struct RetryQueue {
    items: VecDeque<Vec<StoreMessage>>,
    max_items: usize,
}

impl RetryQueue {
    pub fn new(max_items: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_items,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Queue a fresh batch at the front, evicting the oldest batch
    /// first when at capacity.
    pub fn push(&mut self, batch: Vec<StoreMessage>) -> DropStats {
        let mut stats = DropStats::default();
        if self.items.len() >= self.max_items {
            if let Some(dropped) = self.items.pop_back() {
                stats.datasets = dropped.len();
                stats.datapoints = dropped.iter().map(|m| m.datapoints()).sum();
            }
        }
        self.items.push_front(batch);
        stats
    }

    /// The oldest queued batch, for a delivery attempt.
    pub fn oldest(&self) -> Option<&Vec<StoreMessage>> {
        self.items.back()
    }

    /// Discard the oldest batch after successful delivery.
    pub fn pop_oldest(&mut self) -> Option<Vec<StoreMessage>> {
        self.items.pop_back()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgsentry_common::types::{MetricRow, MetricValue};

    fn batch(label: &str, points: usize) -> Vec<StoreMessage> {
        let mut data = Vec::new();
        for i in 0..points {
            let mut row = MetricRow::new();
            row.insert("epoch_ns".into(), MetricValue::Int(i as i64));
            data.push(row);
        }
        vec![StoreMessage {
            db_unique: label.to_string(),
            metric_name: "m".into(),
            data,
            ..Default::default()
        }]
    }

    #[test]
    fn overflow_drops_the_oldest_and_counts_points() {
        let mut queue = RetryQueue::new(3);
        assert_eq!(queue.push(batch("a", 1)), DropStats::default());
        assert_eq!(queue.push(batch("b", 2)), DropStats::default());
        assert_eq!(queue.push(batch("c", 1)), DropStats::default());

        // at capacity: pushing d evicts a (1 dataset, 1 point)
        let stats = queue.push(batch("d", 1));
        assert_eq!(
            stats,
            DropStats {
                datasets: 1,
                datapoints: 1
            }
        );
        assert_eq!(queue.len(), 3);

        // temporal order: newest at front means oldest delivered first
        assert_eq!(queue.oldest().unwrap()[0].db_unique, "b");
        queue.pop_oldest();
        assert_eq!(queue.oldest().unwrap()[0].db_unique, "c");
        queue.pop_oldest();
        assert_eq!(queue.oldest().unwrap()[0].db_unique, "d");
    }

    #[test]
    fn queue_never_exceeds_capacity() {
        let mut queue = RetryQueue::new(5);
        let mut dropped_points = 0;
        for i in 0..100 {
            dropped_points += queue.push(batch(&format!("b{i}"), 2)).datapoints;
        }
        assert_eq!(queue.len(), 5);
        assert_eq!(dropped_points, 95 * 2);
    }
}
