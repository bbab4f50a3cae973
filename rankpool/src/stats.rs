//! Per-destination, per-tag traffic counters.

use std::collections::BTreeMap;
use std::io::Write;

use crate::tags::TagRegistry;
use crate::types::{MessageTag, Rank};

/// Cumulative count of messages sent, keyed by destination and tag.
///
/// Counters only grow; nothing resets them during the life of a rank.
#[derive(Debug, Default, Clone)]
pub struct TrafficStatistics {
    counts: BTreeMap<(Rank, MessageTag), u64>,
    sent: u64,
    received: u64,
}

impl TrafficStatistics {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one message sent to `destination` with `tag`.
    pub fn record_sent(&mut self, destination: Rank, tag: MessageTag) {
        *self.counts.entry((destination, tag)).or_insert(0) += 1;
        self.sent += 1;
    }

    /// Count one message read from the transport.
    pub fn record_received(&mut self) {
        self.received += 1;
    }

    /// Messages sent to `destination` with `tag`.
    pub fn count(&self, destination: Rank, tag: MessageTag) -> u64 {
        self.counts.get(&(destination, tag)).copied().unwrap_or(0)
    }

    /// Total messages sent.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Total messages received.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Non-zero counters ordered by destination, then tag.
    pub fn entries(&self) -> impl Iterator<Item = (Rank, MessageTag, u64)> + '_ {
        self.counts
            .iter()
            .map(|(&(destination, tag), &count)| (destination, tag, count))
    }

    /// Destinations this rank has sent at least one message to.
    pub fn active_peers(&self) -> Vec<Rank> {
        let mut peers: Vec<Rank> = self.counts.keys().map(|&(destination, _)| destination).collect();
        peers.dedup();
        peers
    }

    /// Write one `rank\tdestination\ttag\tcount` line per counter.
    ///
    /// Tags without a registered symbol are written as numbers.
    pub fn write_table<W: Write>(
        &self,
        out: &mut W,
        rank: Rank,
        tags: &TagRegistry,
    ) -> std::io::Result<()> {
        for (destination, tag, count) in self.entries() {
            match tags.symbol(tag) {
                Some(symbol) => writeln!(out, "{rank}\t{destination}\t{symbol}\t{count}")?,
                None => writeln!(out, "{rank}\t{destination}\t{tag}\t{count}")?,
            }
        }
        Ok(())
    }
}
