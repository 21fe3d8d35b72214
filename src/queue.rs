// Offline queue
// Bounded buffer of location updates pending delivery while the channel is down

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::constants::DEFAULT_QUEUE_CAPACITY;
use crate::location::LocationUpdate;

/// Queue shared between the reading path (enqueue) and the channel (flush)
pub type SharedQueue = Arc<tokio::sync::Mutex<OfflineQueue>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Most entries held at once
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// A queued update
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub update: LocationUpdate,
    pub enqueued_at: DateTime<Utc>,
}

/// FIFO of pending updates with newest-biased eviction.
///
/// Once an enqueue pushes the queue past `capacity`, only the newest half is
/// kept, and the queue stays limited to that half until it is drained.
#[derive(Debug)]
pub struct OfflineQueue {
    entries: VecDeque<QueueEntry>,
    capacity: usize,
    overflowed: bool,
    dropped: u64,
}

impl OfflineQueue {
    pub fn new(config: QueueConfig) -> Self {
        let capacity = config.capacity.max(1);
        OfflineQueue {
            entries: VecDeque::with_capacity(capacity + 1),
            capacity,
            overflowed: false,
            dropped: 0,
        }
    }

    pub fn shared(config: QueueConfig) -> SharedQueue {
        Arc::new(tokio::sync::Mutex::new(Self::new(config)))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries kept after an overflow
    pub fn retained_on_overflow(&self) -> usize {
        self.capacity.div_ceil(2)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total entries evicted since creation
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Append an update, evicting the oldest entries on overflow.
    pub fn push(&mut self, update: LocationUpdate) -> Uuid {
        let id = Uuid::new_v4();
        self.entries.push_back(QueueEntry {
            id,
            update,
            enqueued_at: Utc::now(),
        });
        self.enforce_bound();
        id
    }

    /// Remove and return every entry in FIFO order.
    pub fn drain(&mut self) -> Vec<QueueEntry> {
        self.overflowed = false;
        let entries: Vec<QueueEntry> = self.entries.drain(..).collect();
        if !entries.is_empty() {
            debug!(count = entries.len(), "offline queue drained");
        }
        entries
    }

    /// Oldest entry, left in place.
    pub fn front(&self) -> Option<&QueueEntry> {
        self.entries.front()
    }

    /// Remove the oldest entry once it has been delivered. Emptying the queue
    /// this way ends the overflow window just like `drain`.
    pub fn pop_front(&mut self) -> Option<QueueEntry> {
        let entry = self.entries.pop_front();
        if self.entries.is_empty() {
            self.overflowed = false;
        }
        entry
    }

    /// Put unsent entries back ahead of anything queued since they were drained.
    pub fn requeue_front(&mut self, entries: Vec<QueueEntry>) {
        for entry in entries.into_iter().rev() {
            self.entries.push_front(entry);
        }
        self.enforce_bound();
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    fn enforce_bound(&mut self) {
        let retain = self.retained_on_overflow();
        let over = self.entries.len() > self.capacity
            || (self.overflowed && self.entries.len() > retain);
        if !over {
            return;
        }

        if !self.overflowed {
            warn!(
                capacity = self.capacity,
                retain, "offline queue overflow, keeping newest entries"
            );
            self.overflowed = true;
        }

        let excess = self.entries.len() - retain;
        self.entries.drain(..excess);
        self.dropped += excess as u64;
    }
}

impl Default for OfflineQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::Coordinate;

    fn update(n: usize) -> LocationUpdate {
        let now = Utc::now();
        LocationUpdate {
            entity_id: "asset-1".to_string(),
            coordinate: Coordinate::new(n as f64, 0.0, 5.0, now),
            battery_level: None,
            network_type: None,
            timestamp: now,
        }
    }

    fn seq(entries: &[QueueEntry]) -> Vec<usize> {
        entries.iter().map(|e| e.update.coordinate.latitude as usize).collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut q = OfflineQueue::default();
        for n in 0..5 {
            q.push(update(n));
        }
        assert_eq!(q.len(), 5);
        assert_eq!(seq(&q.drain()), vec![0, 1, 2, 3, 4]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_overflow_keeps_most_recent_fifty() {
        let mut q = OfflineQueue::new(QueueConfig { capacity: 100 });
        for n in 0..120 {
            q.push(update(n));
            assert!(q.len() <= 100);
        }

        let drained = q.drain();
        assert_eq!(seq(&drained), (70..120).collect::<Vec<_>>());
        assert_eq!(q.dropped(), 70);
    }

    #[test]
    fn test_overflow_window_resets_after_drain() {
        let mut q = OfflineQueue::new(QueueConfig { capacity: 10 });
        for n in 0..11 {
            q.push(update(n));
        }
        assert_eq!(q.len(), 5);
        q.drain();

        for n in 0..10 {
            q.push(update(n));
        }
        assert_eq!(q.len(), 10);
    }

    #[test]
    fn test_pop_front_ends_overflow_window_when_empty() {
        let mut q = OfflineQueue::new(QueueConfig { capacity: 10 });
        for n in 0..11 {
            q.push(update(n));
        }
        assert_eq!(q.front().unwrap().update.coordinate.latitude, 6.0);

        while q.pop_front().is_some() {}
        for n in 0..10 {
            q.push(update(n));
        }
        assert_eq!(q.len(), 10);
    }

    #[test]
    fn test_requeue_front_preserves_order() {
        let mut q = OfflineQueue::default();
        for n in 0..3 {
            q.push(update(n));
        }
        let mut drained = q.drain();
        q.push(update(3));

        // First entry was sent; the rest go back in front
        drained.remove(0);
        q.requeue_front(drained);
        assert_eq!(seq(&q.drain()), vec![1, 2, 3]);
    }

    #[test]
    fn test_entries_have_unique_ids() {
        let mut q = OfflineQueue::default();
        let a = q.push(update(0));
        let b = q.push(update(1));
        assert_ne!(a, b);
        assert_eq!(q.iter().next().unwrap().id, a);
    }
}
