//! Identity of the local rank within the computation.

use crate::error::{CommError, CommResult};
use crate::transport::Transport;
use crate::types::Rank;

/// Who this process is: built once at startup and borrowed by every
/// component that needs the rank or the world size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommContext {
    rank: Rank,
    size: usize,
    processor_name: String,
}

impl CommContext {
    /// Context for `rank` out of `size` ranks.
    pub fn new(rank: Rank, size: usize, processor_name: impl Into<String>) -> CommResult<Self> {
        if rank >= size {
            return Err(CommError::InvalidDestination {
                destination: rank,
                size,
            });
        }
        Ok(Self {
            rank,
            size,
            processor_name: processor_name.into(),
        })
    }

    /// Context matching a transport endpoint.
    pub fn from_transport<T: Transport + ?Sized>(transport: &T) -> CommResult<Self> {
        let rank = transport.rank();
        Self::new(rank, transport.size(), format!("local-{rank}"))
    }

    /// This rank.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Number of ranks.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Host name reported in logs.
    pub fn processor_name(&self) -> &str {
        &self.processor_name
    }

    /// Whether `rank` names a participant.
    pub fn contains(&self, rank: Rank) -> bool {
        rank < self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_must_be_in_range() {
        assert!(CommContext::new(3, 3, "node").is_err());
        let context = CommContext::new(2, 3, "node").expect("context");
        assert_eq!(context.rank(), 2);
        assert!(context.contains(0));
        assert!(!context.contains(3));
    }
}
