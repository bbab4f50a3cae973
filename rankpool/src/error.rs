//! Error types for the dispatch layer.
//!
//! Every error here is reported to the caller. Resource exhaustion and
//! transport failures mean the static capacities or the substrate are broken
//! and the driving loop is expected to stop; protocol violations are
//! programming errors in a collaborator and leave all shared state untouched.

use thiserror::Error;

use crate::{MessageTag, Rank, WorkerId};

/// Errors raised by the transport substrate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Rank outside `0..size`.
    #[error("invalid rank {rank} (size {size})")]
    InvalidRank {
        /// Offending rank.
        rank: Rank,
        /// Number of ranks in the fabric.
        size: usize,
    },

    /// Request handle was never issued or has already been released.
    #[error("unknown request handle {0}")]
    UnknownRequest(u64),

    /// Incoming message does not fit the receive buffer.
    #[error("message truncated: {count} units into a {capacity}-unit buffer")]
    Truncated {
        /// Units carried by the message.
        count: usize,
        /// Units available in the receive buffer.
        capacity: usize,
    },

    /// `recv` issued without a matching probed message.
    #[error("no message from rank {source_rank} with tag {tag}")]
    NoMatchingMessage {
        /// Source rank that was expected to have a message.
        source_rank: Rank,
        /// Expected tag.
        tag: MessageTag,
    },

    /// A frame failed to decode.
    #[error("wire error: {0}")]
    Wire(#[from] crate::wire::WireError),
}

/// Errors of the message dispatch and virtual communication layer.
#[derive(Debug, Error)]
pub enum CommError {
    /// Every ring slot is in use or dirty.
    #[error("out of buffers in the {pool} ring ({slots} slots)")]
    OutOfBuffers {
        /// Label of the exhausted pool.
        pool: &'static str,
        /// Number of slots in the pool.
        slots: usize,
    },

    /// Requested allocation is larger than a ring slot.
    #[error("buffer of {requested} units exceeds slot capacity {capacity}")]
    BufferTooLarge {
        /// Units requested.
        requested: usize,
        /// Units per slot.
        capacity: usize,
    },

    /// Buffer handle refers to a slot that has since been recycled.
    #[error("stale buffer handle for slot {index}")]
    StaleBuffer {
        /// Slot index of the stale handle.
        index: usize,
    },

    /// Every dirty slot holds an in-flight send.
    #[error("all {slots} dirty buffer slots are in use")]
    AllBuffersDirty {
        /// Configured number of dirty slots.
        slots: usize,
    },

    /// Mailbox reached its configured message capacity.
    #[error("mailbox full: capacity {capacity}")]
    MailboxFull {
        /// Maximum number of messages.
        capacity: usize,
    },

    /// Aggregation bucket reached its configured capacity.
    #[error("aggregation bucket for rank {destination} is full ({capacity} units)")]
    BucketFull {
        /// Destination of the full bucket.
        destination: Rank,
        /// Bucket capacity in units.
        capacity: usize,
    },

    /// Destination rank outside `0..size`.
    #[error("invalid destination rank {destination} (size {size})")]
    InvalidDestination {
        /// Offending rank.
        destination: Rank,
        /// Number of ranks.
        size: usize,
    },

    /// Destination is not among the rank's connections and would never poll
    /// for the message.
    #[error("rank {destination} is not connected")]
    NotConnected {
        /// Offending rank.
        destination: Rank,
    },

    /// Worker already has an unanswered request.
    #[error("worker {0} already has a pending request")]
    WorkerAlreadyPending(WorkerId),

    /// Response read before it was fully received.
    #[error("response for worker {0} is not ready")]
    ResponseNotReady(WorkerId),

    /// Tag has no registered query type.
    #[error("tag {0} has no registered query type")]
    UnknownQueryTag(MessageTag),

    /// Query payload does not match the registered arity.
    #[error("query for tag {tag} carries {actual} units, expected {expected}")]
    QueryArityMismatch {
        /// Query tag.
        tag: MessageTag,
        /// Registered number of units.
        expected: usize,
        /// Units supplied.
        actual: usize,
    },

    /// Reply routed to a worker that has no outstanding request.
    #[error("reply for worker {worker} with no outstanding request")]
    UnexpectedResponse {
        /// Worker named in the reply.
        worker: WorkerId,
    },

    /// Reply message whose length is not a whole number of records.
    #[error("malformed reply with tag {tag}: {count} units")]
    MalformedReply {
        /// Reply tag.
        tag: MessageTag,
        /// Units carried.
        count: usize,
    },

    /// Tag symbol registered twice.
    #[error("tag symbol {0} already registered")]
    DuplicateTagSymbol(String),

    /// No more tags can be allocated.
    #[error("tag space exhausted")]
    TagSpaceExhausted,

    /// Ranks still had work after the allowed number of ticks.
    #[error("not quiescent after {ticks} ticks")]
    Stalled {
        /// Ticks run.
        ticks: u64,
    },

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transport substrate failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Statistics export failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration document could not be parsed.
    #[error("configuration parse error: {0}")]
    Config(#[from] serde_json::Error),
}

/// Result type for dispatch operations.
pub type CommResult<T> = Result<T, CommError>;
