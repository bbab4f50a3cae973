//! Point-to-point substrate the dispatch engine drives.
//!
//! The interface mirrors a rendezvous message-passing library: sends are
//! non-blocking and return a request handle that must be tested until the
//! transfer completes; receives are done by probing for an envelope and then
//! reading it, or through persistent receive requests that are re-armed after
//! each completion. Nothing here blocks.

mod local;

pub use local::{LocalFabric, LocalTransport};

use crate::error::TransportError;
use crate::types::{MessageTag, MessageUnit, Rank};

/// Handle to an outstanding transport operation.
///
/// Not `Clone`: a handle is consumed when the operation completes, is freed
/// or is cancelled.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct RequestHandle(u64);

impl RequestHandle {
    /// Wrap an implementation-defined request id.
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Implementation-defined request id.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Envelope of a message that is ready to be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeStatus {
    /// Sending rank.
    pub source: Rank,
    /// Message tag.
    pub tag: MessageTag,
    /// Payload units.
    pub count: usize,
}

/// Non-blocking point-to-point transport for one rank.
pub trait Transport {
    /// This rank.
    fn rank(&self) -> Rank;

    /// Number of ranks.
    fn size(&self) -> usize;

    /// Start sending `units` to `destination`.
    ///
    /// The caller must keep the payload buffer untouched until [`Transport::test`]
    /// reports completion, or release the handle with [`Transport::request_free`]
    /// if it has nothing to protect.
    fn isend(
        &mut self,
        destination: Rank,
        tag: MessageTag,
        units: &[MessageUnit],
    ) -> Result<RequestHandle, TransportError>;

    /// Whether the send behind `request` has completed.
    ///
    /// After `true` the handle is spent and must be dropped.
    fn test(&mut self, request: &RequestHandle) -> Result<bool, TransportError>;

    /// Detach a send request; the transfer still happens.
    fn request_free(&mut self, request: RequestHandle) -> Result<(), TransportError>;

    /// Look for a message from `source`, or from anyone when `None`.
    fn iprobe(&mut self, source: Option<Rank>) -> Result<Option<ProbeStatus>, TransportError>;

    /// Read the message announced by `status` into `out`. Returns the unit count.
    fn recv(
        &mut self,
        status: &ProbeStatus,
        out: &mut [MessageUnit],
    ) -> Result<usize, TransportError>;

    /// Create an inactive persistent receive for messages of up to
    /// `capacity` units from any source.
    fn recv_init(&mut self, capacity: usize) -> Result<RequestHandle, TransportError>;

    /// Arm a persistent receive.
    fn start(&mut self, request: &RequestHandle) -> Result<(), TransportError>;

    /// Test an armed persistent receive; on completion the payload is written
    /// to `out` and the request becomes inactive until started again.
    fn test_persistent(
        &mut self,
        request: &RequestHandle,
        out: &mut [MessageUnit],
    ) -> Result<Option<ProbeStatus>, TransportError>;

    /// Cancel and release a persistent receive.
    fn cancel(&mut self, request: RequestHandle) -> Result<(), TransportError>;
}
