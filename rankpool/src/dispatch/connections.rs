//! Peers polled by round-robin reception.

use crate::types::Rank;

/// Strictly increasing list of ranks that includes the local rank exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConnections {
    peers: Vec<Rank>,
}

impl PeerConnections {
    /// Every rank of a `size`-rank computation.
    pub fn complete(size: usize) -> Self {
        Self {
            peers: (0..size).collect(),
        }
    }

    /// `peers` plus `rank`, sorted and without duplicates.
    ///
    /// The local rank is inserted at its sorted position when missing.
    pub fn with_self(rank: Rank, peers: &[Rank]) -> Self {
        let mut peers = peers.to_vec();
        peers.sort_unstable();
        peers.dedup();
        if let Err(position) = peers.binary_search(&rank) {
            peers.insert(position, rank);
        }
        Self { peers }
    }

    /// Rank at `index`, wrapping around the list.
    pub fn get(&self, index: usize) -> Option<Rank> {
        if self.peers.is_empty() {
            return None;
        }
        Some(self.peers[index % self.peers.len()])
    }

    /// Number of connections.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Connections in increasing order.
    pub fn as_slice(&self) -> &[Rank] {
        &self.peers
    }

    /// Whether `rank` is connected.
    pub fn contains(&self, rank: Rank) -> bool {
        self.peers.binary_search(&rank).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_inserted_in_order() {
        let connections = PeerConnections::with_self(4, &[1, 3, 7, 9]);
        assert_eq!(connections.as_slice(), &[1, 3, 4, 7, 9]);
    }

    #[test]
    fn test_self_not_duplicated() {
        let connections = PeerConnections::with_self(3, &[1, 3, 7]);
        assert_eq!(connections.as_slice(), &[1, 3, 7]);
    }

    #[test]
    fn test_self_at_edges() {
        assert_eq!(PeerConnections::with_self(0, &[2, 5]).as_slice(), &[0, 2, 5]);
        assert_eq!(PeerConnections::with_self(8, &[2, 5]).as_slice(), &[2, 5, 8]);
        assert_eq!(PeerConnections::with_self(2, &[]).as_slice(), &[2]);
    }

    #[test]
    fn test_get_wraps() {
        let connections = PeerConnections::complete(3);
        assert_eq!(connections.get(4), Some(1));
        assert!(connections.contains(2));
    }
}
