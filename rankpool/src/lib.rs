//! # rankpool
//!
//! Non-blocking message dispatch for rank-parallel computations.
//!
//! Each rank is a single-threaded process that advances by ticks. Many
//! logical workers on a rank share one outbox and one inbox; the dispatch
//! engine moves the outbox onto the transport and pulls at most one message
//! per tick off it.
//!
//! ```text
//!   workers ──query──► VirtualCommunicator ──packed──► outbox ─┐
//!      ▲                                                       │ DispatchEngine
//!      └──answer──── VirtualCommunicator ◄──replies──── inbox ◄┘ (Transport)
//!                                                        │
//!                                            HandlerMap ─┘ (requests from peers)
//! ```
//!
//! This crate provides:
//! - **RingAllocator**: fixed pools of reusable payload buffers
//! - **BufferedAggregator**: per-destination coalescing of small payloads
//! - **DirtyBufferTracker**: buffers pinned by in-flight sends
//! - **DispatchEngine**: send/receive loop with three reception policies
//! - **VirtualCommunicator**: per-worker request/response over shared mailboxes
//! - **LocalFabric**: in-process transport for running several ranks at once

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Per-destination coalescing of small payloads.
pub mod aggregator;

/// Ring pools of payload buffers.
pub mod allocator;

/// Worker request/response multiplexing.
pub mod communicator;

/// Engine configuration.
pub mod config;

/// Local rank identity.
pub mod context;

/// Buffers owned by in-flight sends.
pub mod dirty;

/// Send/receive loop.
pub mod dispatch;

/// Error types.
pub mod error;

/// Tag → handler table.
pub mod handlers;

/// Messages and mailboxes.
pub mod message;

/// Rank overlays.
pub mod routing;

/// Per-rank tick loop.
pub mod runtime;

/// Traffic counters.
pub mod stats;

/// Tag allocation.
pub mod tags;

/// Point-to-point substrate.
pub mod transport;

/// Scalar types shared by every module.
pub mod types;

/// Frame codec with CRC32C checksums.
pub mod wire;

/// Logical tasks stepped by the runtime.
pub mod worker;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use aggregator::BufferedAggregator;
pub use allocator::{BufferId, RingAllocator};
pub use communicator::{QueryResponder, QueryType, VirtualCommunicator};
pub use config::{CommConfig, ReceptionPolicy};
pub use context::CommContext;
pub use dirty::{DirtyBufferTracker, DirtySlot};
pub use dispatch::{DispatchEngine, PeerConnections};
pub use error::{CommError, CommResult, TransportError};
pub use handlers::{HandlerMap, MessageHandler};
pub use message::{Mailbox, Message};
pub use routing::{CompleteGraph, DeBruijnGraph, RoutingTopology};
pub use runtime::{run_until_quiescent, RankRuntime, TickReport};
pub use stats::TrafficStatistics;
pub use tags::TagRegistry;
pub use transport::{LocalFabric, LocalTransport, ProbeStatus, RequestHandle, Transport};
pub use types::{MessageTag, MessageUnit, Rank, WorkerId, UNIT_BYTES};
pub use wire::{FrameHeader, WireError};
pub use worker::{
    LibraryDistances, MateDistanceWorker, ReadPlacement, Strand, Worker, WorkerContext,
    WorkerStatus, MATE_REPLY_UNITS, NO_MATE,
};
