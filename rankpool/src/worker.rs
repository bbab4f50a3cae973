//! Logical tasks advanced one step per tick.
//!
//! A worker never blocks: when its query is still in flight, `step` returns
//! [`WorkerStatus::Pending`] and the runtime calls it again next tick.

use std::collections::{BTreeMap, HashMap};

use crate::communicator::VirtualCommunicator;
use crate::context::CommContext;
use crate::error::{CommError, CommResult};
use crate::types::{MessageTag, MessageUnit, Rank, WorkerId};

/// Outcome of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// More steps are needed.
    Pending,
    /// The worker finished and will not be stepped again.
    Done,
}

/// What a worker may touch during a step.
#[derive(Debug)]
pub struct WorkerContext<'a> {
    /// Identity of the local rank.
    pub context: &'a CommContext,
    /// Shared request/response channel.
    pub communicator: &'a mut VirtualCommunicator,
}

/// State machine driven by the rank's tick loop.
pub trait Worker {
    /// Identifier used for the worker's queries.
    fn id(&self) -> WorkerId;

    /// Advance as far as possible without waiting.
    fn step(&mut self, ctx: &mut WorkerContext<'_>) -> CommResult<WorkerStatus>;
}

/// Reply marker for a read without a mate.
pub const NO_MATE: MessageUnit = MessageUnit::MAX;

/// Units of a `GET_READ_MATE` reply: read length, mate rank, mate index,
/// library.
pub const MATE_REPLY_UNITS: usize = 4;

/// Strand a read aligns to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strand {
    /// Forward.
    Forward,
    /// Reverse complement.
    Reverse,
}

/// A read placed on the path the worker walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPlacement {
    /// Rank storing the read.
    pub rank: Rank,
    /// Index of the read on that rank.
    pub index: u64,
    /// Position of the read's vertex along the path.
    pub path_position: i64,
    /// Offset of the vertex inside the read.
    pub strand_position: i64,
    /// Orientation of the read.
    pub strand: Strand,
}

/// Counts of observed fragment lengths per library.
pub type LibraryDistances = BTreeMap<u64, BTreeMap<i64, u64>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Waiting,
}

/// Estimates paired-read fragment lengths along one path.
///
/// Reads are visited in path order. For each read the worker asks the rank
/// holding it for its mate; when the mate lies earlier on the same path in the
/// opposite orientation, the implied fragment length is tallied for the
/// mate's library.
#[derive(Debug)]
pub struct MateDistanceWorker {
    id: WorkerId,
    mate_tag: MessageTag,
    reads: Vec<ReadPlacement>,
    next: usize,
    phase: Phase,
    seen: HashMap<(Rank, u64), ReadPlacement>,
    distances: LibraryDistances,
    detected: u64,
}

impl MateDistanceWorker {
    /// Worker `id` walking `reads`, querying mates with `mate_tag`.
    pub fn new(id: WorkerId, mate_tag: MessageTag, reads: Vec<ReadPlacement>) -> Self {
        Self {
            id,
            mate_tag,
            reads,
            next: 0,
            phase: Phase::Idle,
            seen: HashMap::new(),
            distances: BTreeMap::new(),
            detected: 0,
        }
    }

    /// Fragment lengths observed so far.
    pub fn distances(&self) -> &LibraryDistances {
        &self.distances
    }

    /// Number of pairs that produced a distance.
    pub fn detected(&self) -> u64 {
        self.detected
    }

    fn record(&mut self, read: ReadPlacement, reply: &[MessageUnit]) -> CommResult<()> {
        let &[read_length, mate_rank, mate_index, library] = reply else {
            return Err(CommError::MalformedReply {
                tag: self.mate_tag,
                count: reply.len(),
            });
        };
        if mate_rank == NO_MATE {
            return Ok(());
        }

        if let Some(left) = self.seen.get(&(mate_rank as Rank, mate_index)) {
            if left.strand != read.strand {
                let distance = read.path_position - left.path_position
                    + read_length as i64
                    + left.strand_position
                    - read.strand_position;
                *self
                    .distances
                    .entry(library)
                    .or_default()
                    .entry(distance)
                    .or_insert(0) += 1;
                self.detected += 1;
            }
        }
        Ok(())
    }
}

impl Worker for MateDistanceWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn step(&mut self, ctx: &mut WorkerContext<'_>) -> CommResult<WorkerStatus> {
        let Some(&read) = self.reads.get(self.next) else {
            return Ok(WorkerStatus::Done);
        };

        match self.phase {
            Phase::Idle => {
                ctx.communicator
                    .push_message(self.id, read.rank, self.mate_tag, &[read.index])?;
                self.phase = Phase::Waiting;
            }
            Phase::Waiting => {
                if !ctx.communicator.is_message_processed(self.id) {
                    return Ok(WorkerStatus::Pending);
                }
                let reply = ctx.communicator.get_response_elements(self.id)?;
                self.record(read, &reply)?;
                self.seen.insert((read.rank, read.index), read);
                self.next += 1;
                self.phase = Phase::Idle;
            }
        }

        if self.next == self.reads.len() {
            tracing::debug!(
                "rank {}: worker {} done, {} distances",
                ctx.context.rank(),
                self.id,
                self.detected
            );
            return Ok(WorkerStatus::Done);
        }
        Ok(WorkerStatus::Pending)
    }
}
