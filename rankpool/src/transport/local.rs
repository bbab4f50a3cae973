//! In-process fabric connecting several ranks.
//!
//! Every rank gets a [`LocalTransport`] endpoint sharing one
//! `Rc<RefCell<FabricState>>`, so a whole multi-rank computation can be
//! driven from a single thread by ticking each rank in turn. Frames are
//! stored encoded, exactly as they would cross a wire.
//!
//! Sends whose payload fits under the eager limit complete immediately; larger
//! ones complete only once the destination has read them. An optional seeded
//! hold makes completions arrive late to exercise buffer reclamation.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::{ProbeStatus, RequestHandle, Transport};
use crate::error::TransportError;
use crate::types::{units_for_bytes, MessageTag, MessageUnit, Rank};
use crate::wire::{decode_frame_into, encode_frame, FrameHeader};

/// Frame waiting in a destination queue.
#[derive(Debug)]
struct Envelope {
    header: FrameHeader,
    frame: Vec<u8>,
    send_request: Option<u64>,
}

#[derive(Debug)]
enum RequestState {
    Send { delivered: bool, eager: bool },
    Persistent { owner: Rank, capacity: usize, active: bool },
}

/// Completion hold: a completed send is reported late with some probability.
#[derive(Debug)]
struct Hold {
    rng: ChaCha8Rng,
    probability: f64,
}

#[derive(Debug)]
struct FabricState {
    size: usize,
    eager_limit_units: usize,
    queues: Vec<VecDeque<Envelope>>,
    requests: HashMap<u64, RequestState>,
    next_request: u64,
    hold: Option<Hold>,
    delivered: u64,
}

impl FabricState {
    fn check_rank(&self, rank: Rank) -> Result<(), TransportError> {
        if rank >= self.size {
            return Err(TransportError::InvalidRank {
                rank,
                size: self.size,
            });
        }
        Ok(())
    }

    fn next_request_id(&mut self) -> u64 {
        let id = self.next_request;
        self.next_request += 1;
        id
    }

    fn mark_delivered(&mut self, envelope: &Envelope) {
        self.delivered += 1;
        if let Some(id) = envelope.send_request {
            if let Some(RequestState::Send { delivered, .. }) = self.requests.get_mut(&id) {
                *delivered = true;
            }
        }
    }

    fn held(&mut self) -> bool {
        match self.hold.as_mut() {
            Some(hold) => hold.rng.random_bool(hold.probability),
            None => false,
        }
    }
}

/// Shared state of an in-process fabric.
#[derive(Debug, Clone)]
pub struct LocalFabric {
    state: Rc<RefCell<FabricState>>,
}

impl LocalFabric {
    /// Fabric for `size` ranks with the given eager limit.
    pub fn new(size: usize, eager_limit_bytes: usize) -> Self {
        Self {
            state: Rc::new(RefCell::new(FabricState {
                size,
                eager_limit_units: units_for_bytes(eager_limit_bytes),
                queues: (0..size).map(|_| VecDeque::new()).collect(),
                requests: HashMap::new(),
                next_request: 1,
                hold: None,
                delivered: 0,
            })),
        }
    }

    /// Report completed sends late with `probability`, drawn from a seeded RNG.
    pub fn with_completion_hold(self, seed: u64, probability: f64) -> Self {
        self.state.borrow_mut().hold = Some(Hold {
            rng: ChaCha8Rng::seed_from_u64(seed),
            probability,
        });
        self
    }

    /// Endpoint for `rank`.
    pub fn endpoint(&self, rank: Rank) -> Result<LocalTransport, TransportError> {
        self.state.borrow().check_rank(rank)?;
        Ok(LocalTransport {
            rank,
            state: Rc::clone(&self.state),
        })
    }

    /// Endpoints for every rank, in rank order.
    pub fn endpoints(&self) -> Vec<LocalTransport> {
        let size = self.state.borrow().size;
        (0..size)
            .map(|rank| LocalTransport {
                rank,
                state: Rc::clone(&self.state),
            })
            .collect()
    }

    /// Frames sent but not yet read, across all ranks.
    pub fn in_flight(&self) -> usize {
        self.state.borrow().queues.iter().map(VecDeque::len).sum()
    }

    /// Frames waiting for `rank`.
    pub fn pending_for(&self, rank: Rank) -> usize {
        self.state.borrow().queues.get(rank).map_or(0, VecDeque::len)
    }

    /// Frames read so far.
    pub fn delivered(&self) -> u64 {
        self.state.borrow().delivered
    }

    /// Outstanding request handles of any kind.
    pub fn open_requests(&self) -> usize {
        self.state.borrow().requests.len()
    }
}

/// One rank's endpoint on a [`LocalFabric`].
#[derive(Debug, Clone)]
pub struct LocalTransport {
    rank: Rank,
    state: Rc<RefCell<FabricState>>,
}

impl Transport for LocalTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.state.borrow().size
    }

    fn isend(
        &mut self,
        destination: Rank,
        tag: MessageTag,
        units: &[MessageUnit],
    ) -> Result<RequestHandle, TransportError> {
        let mut state = self.state.borrow_mut();
        state.check_rank(destination)?;

        let header = FrameHeader {
            source: self.rank,
            destination,
            tag,
            count: units.len(),
        };
        let frame = encode_frame(&header, units)?;
        let id = state.next_request_id();
        let eager = units.len() <= state.eager_limit_units;
        state.requests.insert(
            id,
            RequestState::Send {
                delivered: false,
                eager,
            },
        );
        state.queues[destination].push_back(Envelope {
            header,
            frame,
            send_request: Some(id),
        });
        Ok(RequestHandle::from_raw(id))
    }

    fn test(&mut self, request: &RequestHandle) -> Result<bool, TransportError> {
        let mut state = self.state.borrow_mut();
        let complete = match state.requests.get(&request.raw()) {
            Some(RequestState::Send { delivered, eager }) => *eager || *delivered,
            _ => return Err(TransportError::UnknownRequest(request.raw())),
        };
        if !complete || state.held() {
            return Ok(false);
        }
        state.requests.remove(&request.raw());
        Ok(true)
    }

    fn request_free(&mut self, request: RequestHandle) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        match state.requests.remove(&request.raw()) {
            Some(RequestState::Send { .. }) => {
                for queue in &mut state.queues {
                    for envelope in queue.iter_mut() {
                        if envelope.send_request == Some(request.raw()) {
                            envelope.send_request = None;
                        }
                    }
                }
                Ok(())
            }
            Some(other) => {
                state.requests.insert(request.raw(), other);
                Err(TransportError::UnknownRequest(request.raw()))
            }
            None => Err(TransportError::UnknownRequest(request.raw())),
        }
    }

    fn iprobe(&mut self, source: Option<Rank>) -> Result<Option<ProbeStatus>, TransportError> {
        let state = self.state.borrow();
        if let Some(source) = source {
            state.check_rank(source)?;
        }
        let found = state.queues[self.rank]
            .iter()
            .find(|envelope| source.is_none_or(|rank| envelope.header.source == rank));
        Ok(found.map(|envelope| ProbeStatus {
            source: envelope.header.source,
            tag: envelope.header.tag,
            count: envelope.header.count,
        }))
    }

    fn recv(
        &mut self,
        status: &ProbeStatus,
        out: &mut [MessageUnit],
    ) -> Result<usize, TransportError> {
        let mut state = self.state.borrow_mut();
        let position = state.queues[self.rank]
            .iter()
            .position(|envelope| {
                envelope.header.source == status.source && envelope.header.tag == status.tag
            })
            .ok_or(TransportError::NoMatchingMessage {
                source_rank: status.source,
                tag: status.tag,
            })?;

        let count = state.queues[self.rank][position].header.count;
        if count > out.len() {
            return Err(TransportError::Truncated {
                count,
                capacity: out.len(),
            });
        }

        let Some(envelope) = state.queues[self.rank].remove(position) else {
            return Err(TransportError::NoMatchingMessage {
                source_rank: status.source,
                tag: status.tag,
            });
        };
        decode_frame_into(&envelope.frame, out)?;
        state.mark_delivered(&envelope);
        Ok(count)
    }

    fn recv_init(&mut self, capacity: usize) -> Result<RequestHandle, TransportError> {
        let mut state = self.state.borrow_mut();
        let id = state.next_request_id();
        state.requests.insert(
            id,
            RequestState::Persistent {
                owner: self.rank,
                capacity,
                active: false,
            },
        );
        Ok(RequestHandle::from_raw(id))
    }

    fn start(&mut self, request: &RequestHandle) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        match state.requests.get_mut(&request.raw()) {
            Some(RequestState::Persistent { owner, active, .. }) if *owner == self.rank => {
                *active = true;
                Ok(())
            }
            _ => Err(TransportError::UnknownRequest(request.raw())),
        }
    }

    fn test_persistent(
        &mut self,
        request: &RequestHandle,
        out: &mut [MessageUnit],
    ) -> Result<Option<ProbeStatus>, TransportError> {
        let mut state = self.state.borrow_mut();
        let capacity = match state.requests.get(&request.raw()) {
            Some(RequestState::Persistent {
                owner,
                capacity,
                active,
            }) if *owner == self.rank => {
                if !*active {
                    return Ok(None);
                }
                *capacity
            }
            _ => return Err(TransportError::UnknownRequest(request.raw())),
        };

        let Some(count) = state.queues[self.rank].front().map(|e| e.header.count) else {
            return Ok(None);
        };
        if count > capacity.min(out.len()) {
            return Err(TransportError::Truncated {
                count,
                capacity: capacity.min(out.len()),
            });
        }

        let Some(envelope) = state.queues[self.rank].pop_front() else {
            return Ok(None);
        };
        let header = decode_frame_into(&envelope.frame, out)?;
        state.mark_delivered(&envelope);
        if let Some(RequestState::Persistent { active, .. }) =
            state.requests.get_mut(&request.raw())
        {
            *active = false;
        }
        Ok(Some(ProbeStatus {
            source: header.source,
            tag: header.tag,
            count: header.count,
        }))
    }

    fn cancel(&mut self, request: RequestHandle) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        match state.requests.remove(&request.raw()) {
            Some(RequestState::Persistent { .. }) => Ok(()),
            Some(other) => {
                state.requests.insert(request.raw(), other);
                Err(TransportError::UnknownRequest(request.raw()))
            }
            None => Err(TransportError::UnknownRequest(request.raw())),
        }
    }
}
