//! Rank topologies that bound how many peers each rank talks to.
//!
//! With a complete graph every rank sends directly to every other rank. A de
//! Bruijn overlay over `base^digits` ranks gives each rank only `base`
//! outgoing neighbours and reaches any destination in at most `digits` hops:
//! each hop shifts the current rank's base-`base` digits left and appends the
//! next digit of the destination.
//!
//! ```text
//!   base 2, 3 digits:   001 ─► 010 ─► 101        (route 1 → 5)
//! ```
//!
//! [`RoutingTopology::connections`] is what a rank hands to
//! `DispatchEngine::set_connections`. The engine then refuses to send past
//! its neighbours, so a message for a distant rank is addressed to
//! [`RoutingTopology::next_hop`] and relayed by the application.

use crate::error::{CommError, CommResult};
use crate::types::Rank;

/// Static overlay over the ranks of a computation.
pub trait RoutingTopology {
    /// Number of ranks.
    fn size(&self) -> usize;

    /// Ranks `rank` exchanges messages with directly, ascending, self excluded.
    fn connections(&self, rank: Rank) -> Vec<Rank>;

    /// Next rank on the way from `current` to `destination`.
    fn next_hop(&self, current: Rank, destination: Rank) -> Rank;

    /// Every rank visited after `source` up to and including `destination`.
    fn route(&self, source: Rank, destination: Rank) -> Vec<Rank> {
        let mut route = Vec::new();
        let mut current = source;
        while current != destination && route.len() < self.size() {
            current = self.next_hop(current, destination);
            route.push(current);
        }
        route
    }
}

/// Every rank connected to every other rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompleteGraph {
    size: usize,
}

impl CompleteGraph {
    /// Complete graph over `size` ranks.
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

impl RoutingTopology for CompleteGraph {
    fn size(&self) -> usize {
        self.size
    }

    fn connections(&self, rank: Rank) -> Vec<Rank> {
        (0..self.size).filter(|&peer| peer != rank).collect()
    }

    fn next_hop(&self, _current: Rank, destination: Rank) -> Rank {
        destination
    }
}

/// de Bruijn overlay over `base^digits` ranks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeBruijnGraph {
    base: usize,
    digits: usize,
    size: usize,
}

impl DeBruijnGraph {
    /// Overlay of degree `base` over `size` ranks.
    ///
    /// # Errors
    ///
    /// [`CommError::InvalidConfig`] unless `base >= 2` and `size` is a power
    /// of `base` greater than one.
    pub fn new(size: usize, base: usize) -> CommResult<Self> {
        if base < 2 {
            return Err(CommError::InvalidConfig(format!(
                "de Bruijn base must be at least 2, got {base}"
            )));
        }
        let mut digits = 0;
        let mut power = 1usize;
        while power < size {
            power = power.saturating_mul(base);
            digits += 1;
        }
        if power != size || digits == 0 {
            return Err(CommError::InvalidConfig(format!(
                "{size} ranks is not a power of {base}"
            )));
        }
        Ok(Self { base, digits, size })
    }

    /// Digits of a rank's label.
    pub fn digits(&self) -> usize {
        self.digits
    }

    /// Label of `rank`, most significant digit first.
    fn label(&self, rank: Rank) -> Vec<usize> {
        let mut label = vec![0; self.digits];
        let mut value = rank;
        for digit in label.iter_mut().rev() {
            *digit = value % self.base;
            value /= self.base;
        }
        label
    }

    fn rank_of(&self, label: &[usize]) -> Rank {
        label.iter().fold(0, |rank, digit| rank * self.base + digit)
    }

    /// Longest suffix of `a` that is a prefix of `b`.
    fn overlap(a: &[usize], b: &[usize]) -> usize {
        (0..=a.len())
            .rev()
            .find(|&k| a[a.len() - k..] == b[..k])
            .unwrap_or(0)
    }

    /// Ranks reachable from `rank` in one hop.
    pub fn successors(&self, rank: Rank) -> Vec<Rank> {
        let shifted = (rank * self.base) % self.size;
        (0..self.base).map(|digit| shifted + digit).collect()
    }
}

impl RoutingTopology for DeBruijnGraph {
    fn size(&self) -> usize {
        self.size
    }

    /// Successors and predecessors, so a rank polls everyone who may send to it.
    fn connections(&self, rank: Rank) -> Vec<Rank> {
        let successors = self.successors(rank);
        (0..self.size)
            .filter(|&peer| {
                peer != rank
                    && (successors.contains(&peer) || self.successors(peer).contains(&rank))
            })
            .collect()
    }

    fn next_hop(&self, current: Rank, destination: Rank) -> Rank {
        if current == destination {
            return destination;
        }
        let from = self.label(current);
        let to = self.label(destination);
        let overlap = Self::overlap(&from, &to);
        let mut next = from[1..].to_vec();
        next.push(to[overlap]);
        self.rank_of(&next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_graph_routes_directly() {
        let graph = CompleteGraph::new(4);
        assert_eq!(graph.connections(2), vec![0, 1, 3]);
        assert_eq!(graph.route(0, 3), vec![3]);
    }

    #[test]
    fn test_de_bruijn_requires_power() {
        assert!(DeBruijnGraph::new(6, 2).is_err());
        assert!(DeBruijnGraph::new(1, 2).is_err());
        assert!(DeBruijnGraph::new(8, 1).is_err());
        assert_eq!(DeBruijnGraph::new(27, 3).expect("graph").digits(), 3);
    }

    #[test]
    fn test_de_bruijn_route_shifts_digits() {
        let graph = DeBruijnGraph::new(8, 2).expect("graph");
        assert_eq!(graph.route(1, 5), vec![2, 5]);
        assert_eq!(graph.route(5, 5), Vec::<Rank>::new());
    }

    #[test]
    fn test_de_bruijn_routes_are_short_and_follow_edges() {
        let graph = DeBruijnGraph::new(16, 2).expect("graph");
        for source in 0..16 {
            for destination in 0..16 {
                let route = graph.route(source, destination);
                assert!(route.len() <= graph.digits());
                assert_eq!(route.last().copied().unwrap_or(source), destination);
                let mut current = source;
                for &hop in &route {
                    assert!(graph.successors(current).contains(&hop));
                    current = hop;
                }
            }
        }
    }

    #[test]
    fn test_de_bruijn_connections_are_bounded() {
        let graph = DeBruijnGraph::new(16, 2).expect("graph");
        for rank in 0..16 {
            let connections = graph.connections(rank);
            assert!(connections.len() <= 4);
            assert!(!connections.contains(&rank));
            assert!(connections.windows(2).all(|pair| pair[0] < pair[1]));
        }
    }
}
