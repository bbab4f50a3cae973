//! Per-destination coalescing of small fixed-width elements.
//!
//! Producers append single units per destination; once a bucket holds at
//! least the flush threshold, its contents leave as one message. Elements are
//! usually logical tuples of `period` units (a vertex and its coverage, for
//! instance), so a non-forced flush only sends whole tuples and keeps the
//! tail for the next one.

use crate::error::{CommError, CommResult};
use crate::message::{Mailbox, Message};
use crate::types::{units_for_bytes, MessageTag, MessageUnit, Rank};

/// Buckets of pending units, one per destination rank.
#[derive(Debug)]
pub struct BufferedAggregator {
    buckets: Vec<Vec<MessageUnit>>,
    capacity: usize,
    threshold: usize,
    rank: Rank,
}

impl BufferedAggregator {
    /// Create buckets for `ranks` destinations holding up to `capacity` units
    /// each, with the threshold derived from `eager_limit_bytes` and capped at
    /// `capacity`.
    pub fn new(rank: Rank, ranks: usize, capacity: usize, eager_limit_bytes: usize) -> Self {
        Self {
            buckets: (0..ranks).map(|_| Vec::with_capacity(capacity)).collect(),
            capacity,
            threshold: units_for_bytes(eager_limit_bytes).min(capacity),
            rank,
        }
    }

    /// Override the flush threshold, in units.
    pub fn with_threshold(mut self, units: usize) -> Self {
        self.threshold = units;
        self
    }

    /// Units that trigger a non-forced flush.
    pub fn flush_threshold(&self) -> usize {
        self.threshold
    }

    /// Largest message a non-forced flush sends: the threshold rounded down
    /// to whole `period`-unit tuples.
    pub fn flush_size(&self, period: usize) -> usize {
        let period = period.max(1);
        self.threshold / period * period
    }

    /// Pending units for `destination`.
    pub fn size(&self, destination: Rank) -> usize {
        self.buckets.get(destination).map_or(0, Vec::len)
    }

    /// Unit at `position` of the bucket for `destination`.
    pub fn get_at(&self, destination: Rank, position: usize) -> Option<MessageUnit> {
        self.buckets.get(destination)?.get(position).copied()
    }

    /// Append one unit to the bucket for `destination`.
    pub fn add_at(&mut self, destination: Rank, value: MessageUnit) -> CommResult<()> {
        let ranks = self.buckets.len();
        let bucket = self
            .buckets
            .get_mut(destination)
            .ok_or(CommError::InvalidDestination {
                destination,
                size: ranks,
            })?;
        if bucket.len() >= self.capacity {
            return Err(CommError::BucketFull {
                destination,
                capacity: self.capacity,
            });
        }
        bucket.push(value);
        Ok(())
    }

    /// Empty the bucket for `destination`, keeping its storage.
    pub fn reset(&mut self, destination: Rank) {
        if let Some(bucket) = self.buckets.get_mut(destination) {
            bucket.clear();
        }
    }

    /// Move the bucket for `destination` into one message with `tag`.
    ///
    /// Without `force`, nothing happens until the bucket holds the threshold;
    /// then only whole `period`-unit tuples are sent. With `force`, any
    /// non-empty bucket is sent entirely. Returns whether a message was queued.
    pub fn flush(
        &mut self,
        destination: Rank,
        period: usize,
        tag: MessageTag,
        outbox: &mut Mailbox,
        force: bool,
    ) -> CommResult<bool> {
        let period = period.max(1);
        let amount = self.size(destination);
        if amount == 0 || (!force && amount < self.threshold.max(1)) {
            return Ok(false);
        }

        let sent = if force {
            amount
        } else {
            amount / period * period
        };
        if sent == 0 {
            return Ok(false);
        }

        let id = outbox.allocate(sent)?;
        let bucket = &mut self.buckets[destination];
        outbox.allocator_mut().units_mut(id)?[..sent].copy_from_slice(&bucket[..sent]);
        outbox.push(Message::new(id, sent, tag, self.rank, destination))?;
        bucket.drain(..sent);

        tracing::debug!(
            "aggregator: flushed {} units to rank {} (tag {}, {} kept)",
            sent,
            destination,
            tag,
            bucket.len()
        );
        Ok(true)
    }

    /// Force-flush every non-empty bucket. Returns whether anything was sent.
    pub fn flush_all(
        &mut self,
        period: usize,
        tag: MessageTag,
        outbox: &mut Mailbox,
    ) -> CommResult<bool> {
        let mut flushed = false;
        for destination in 0..self.buckets.len() {
            if self.flush(destination, period, tag, outbox, true)? {
                flushed = true;
            }
        }
        Ok(flushed)
    }

    /// Whether every bucket is empty, as expected at a barrier.
    pub fn is_drained(&self) -> bool {
        self.buckets.iter().all(Vec::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::RingAllocator;

    fn outbox() -> Mailbox {
        Mailbox::new(8, RingAllocator::new("outbox", 8, 64))
    }

    #[test]
    fn test_threshold_from_eager_limit() {
        let aggregator = BufferedAggregator::new(0, 2, 1024, 4096);
        assert_eq!(aggregator.flush_threshold(), 512);
        assert_eq!(aggregator.flush_size(3), 510);

        let small = BufferedAggregator::new(0, 2, 100, 4096);
        assert_eq!(small.flush_threshold(), 100);
    }

    #[test]
    fn test_below_threshold_does_not_flush() {
        let mut aggregator = BufferedAggregator::new(0, 2, 16, 4096).with_threshold(4);
        let mut outbox = outbox();
        for value in 0..3 {
            aggregator.add_at(1, value).expect("room");
        }
        assert!(!aggregator.flush(1, 1, 5, &mut outbox, false).expect("flush"));
        assert!(outbox.is_empty());
        assert_eq!(aggregator.size(1), 3);
    }

    #[test]
    fn test_threshold_flush_keeps_partial_tuple() {
        // threshold 10 units, tuples of 3 units
        let mut aggregator = BufferedAggregator::new(0, 2, 16, 4096).with_threshold(10);
        let mut outbox = outbox();
        let mut flushed = false;
        for value in 0..10 {
            aggregator.add_at(1, value).expect("room");
            flushed = aggregator.flush(1, 3, 5, &mut outbox, false).expect("flush");
        }
        // the tenth unit reaches the threshold; three whole tuples leave
        assert!(flushed);
        assert_eq!(outbox.len(), 1);
        let message = outbox.messages()[0];
        assert_eq!(message.count(), 9);
        assert_eq!(outbox.units(&message).expect("live"), &[0, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(aggregator.size(1), 1);
        assert_eq!(aggregator.get_at(1, 0), Some(9));
    }

    #[test]
    fn test_non_forced_flush_of_unaligned_bucket() {
        let mut aggregator = BufferedAggregator::new(0, 1, 16, 4096).with_threshold(4);
        let mut outbox = outbox();
        for value in 0..5 {
            aggregator.add_at(0, value).expect("room");
        }
        assert!(aggregator.flush(0, 2, 5, &mut outbox, false).expect("flush"));
        assert_eq!(outbox.messages()[0].count(), 4);
        assert_eq!(aggregator.size(0), 1);
    }

    #[test]
    fn test_forced_flush_sends_everything() {
        let mut aggregator = BufferedAggregator::new(3, 2, 16, 4096);
        let mut outbox = outbox();
        aggregator.add_at(0, 42).expect("room");
        assert!(aggregator.flush(0, 2, 9, &mut outbox, true).expect("flush"));
        let message = outbox.messages()[0];
        assert_eq!((message.count(), message.source(), message.tag()), (1, 3, 9));
        assert!(aggregator.is_drained());
    }

    #[test]
    fn test_flush_all_skips_empty_buckets() {
        let mut aggregator = BufferedAggregator::new(0, 3, 16, 4096);
        let mut outbox = outbox();
        assert!(!aggregator.flush_all(1, 1, &mut outbox).expect("flush"));
        aggregator.add_at(0, 1).expect("room");
        aggregator.add_at(2, 2).expect("room");
        assert!(aggregator.flush_all(1, 1, &mut outbox).expect("flush"));
        let destinations: Vec<_> = outbox.messages().iter().map(Message::destination).collect();
        assert_eq!(destinations, vec![0, 2]);
        assert!(aggregator.is_drained());
    }

    #[test]
    fn test_bucket_capacity_and_bounds() {
        let mut aggregator = BufferedAggregator::new(0, 1, 1, 4096);
        aggregator.add_at(0, 1).expect("room");
        assert!(matches!(
            aggregator.add_at(0, 2),
            Err(CommError::BucketFull { destination: 0, capacity: 1 })
        ));
        assert!(matches!(
            aggregator.add_at(4, 2),
            Err(CommError::InvalidDestination { destination: 4, size: 1 })
        ));
        aggregator.reset(0);
        assert_eq!(aggregator.size(0), 0);
    }
}
