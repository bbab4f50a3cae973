//! Transport core of a rank.
//!
//! Every tick the engine runs three phases in order:
//!
//! ```text
//!   ┌────────────┐    ┌──────────────┐    ┌────────────────┐
//!   │ DrainDirty │───►│ SendOutbound │───►│ ReceiveInbound │
//!   └────────────┘    └──────────────┘    └────────────────┘
//!    test K dirty      isend every        read at most one
//!    slots, salvage    outbox message,    message with the
//!    finished sends    pin its buffer     configured policy
//! ```
//!
//! The engine owns the dirty-buffer table, the peer connection list, the
//! reception state and the traffic statistics. Mailboxes and the transport
//! are borrowed per call.

mod connections;
mod reception;

pub use connections::PeerConnections;

use std::fs::OpenOptions;
use std::path::Path;

use crate::config::{CommConfig, ReceptionPolicy};
use crate::context::CommContext;
use crate::dirty::DirtyBufferTracker;
use crate::error::{CommError, CommResult};
use crate::message::{Mailbox, Message};
use crate::stats::TrafficStatistics;
use crate::tags::TagRegistry;
use crate::transport::Transport;
use crate::types::Rank;

use reception::Reception;

/// Non-blocking send/receive loop of one rank.
#[derive(Debug)]
pub struct DispatchEngine {
    rank: Rank,
    size: usize,
    config: CommConfig,
    dirty: DirtyBufferTracker,
    connections: PeerConnections,
    reception: Reception,
    statistics: TrafficStatistics,
}

impl DispatchEngine {
    /// Build the engine for the rank described by `context`.
    ///
    /// With [`ReceptionPolicy::PersistentRing`] this posts one persistent
    /// receive per rank on `transport`.
    pub fn new<T: Transport + ?Sized>(
        context: &CommContext,
        config: CommConfig,
        transport: &mut T,
    ) -> CommResult<Self> {
        config.validate()?;
        let reception = Reception::new(&config, transport)?;
        tracing::info!(
            "rank {} on {}: dispatch engine with {:?} reception, {} dirty slots",
            context.rank(),
            context.processor_name(),
            config.reception,
            config.max_dirty_buffers
        );
        Ok(Self {
            rank: context.rank(),
            size: context.size(),
            dirty: DirtyBufferTracker::new(config.max_dirty_buffers),
            connections: PeerConnections::complete(context.size()),
            reception,
            statistics: TrafficStatistics::new(),
            config,
        })
    }

    /// Run one full tick: drain dirty slots, send the outbox, receive.
    ///
    /// Returns the message read this tick, if any.
    pub fn tick<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        outbox: &mut Mailbox,
        inbox: &mut Mailbox,
    ) -> CommResult<Option<Message>> {
        self.drain_dirty_buffers(transport, outbox)?;
        self.send_messages(transport, outbox)?;
        self.receive_messages(transport, inbox)
    }

    /// Test every dirty slot once and salvage the buffers of finished sends.
    pub fn drain_dirty_buffers<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        outbox: &mut Mailbox,
    ) -> CommResult<usize> {
        self.dirty.check_all(transport, outbox.allocator_mut())
    }

    /// Send every queued outbox message in enqueue order, then clear the outbox.
    ///
    /// A payload buffer is pinned as dirty the first time it is sent; later
    /// sends of the same buffer and empty messages release their request
    /// handle at once. Returns the number of messages sent.
    ///
    /// # Errors
    ///
    /// [`CommError::NotConnected`] if a message is addressed to a rank outside
    /// the connection list; nothing is sent and the outbox is kept.
    pub fn send_messages<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        outbox: &mut Mailbox,
    ) -> CommResult<usize> {
        let (messages, allocator) = outbox.parts_mut();
        let sent = messages.len();

        if let Some(message) = messages
            .iter()
            .find(|message| !self.connections.contains(message.destination()))
        {
            tracing::warn!(
                "rank {}: tag {} addressed to unconnected rank {}",
                self.rank,
                message.tag(),
                message.destination()
            );
            return Err(CommError::NotConnected {
                destination: message.destination(),
            });
        }

        for message in messages.iter() {
            let pin = match message.payload() {
                Some(buffer) if !self.dirty.contains(buffer) => {
                    Some((buffer, self.dirty.allocate_dirty_slot()?))
                }
                _ => None,
            };

            let request = match message.payload() {
                Some(buffer) => transport.isend(
                    message.destination(),
                    message.tag(),
                    &allocator.units(buffer)?[..message.count()],
                )?,
                None => transport.isend(message.destination(), message.tag(), &[])?,
            };

            match pin {
                Some((buffer, slot)) => self.dirty.register(slot, buffer, request, allocator)?,
                None => transport.request_free(request)?,
            }

            self.statistics.record_sent(message.destination(), message.tag());
            tracing::debug!(
                "rank {}: sent tag {} ({} units) to rank {}",
                self.rank,
                message.tag(),
                message.count(),
                message.destination()
            );
        }

        messages.clear();
        Ok(sent)
    }

    /// Read at most one message into `inbox` with the configured policy.
    ///
    /// Finding nothing is the common case and returns `Ok(None)`.
    pub fn receive_messages<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        inbox: &mut Mailbox,
    ) -> CommResult<Option<Message>> {
        let received = self
            .reception
            .receive(transport, &self.connections, inbox)?;
        if let Some(message) = &received {
            self.statistics.record_received();
            tracing::debug!(
                "rank {}: received tag {} ({} units) from rank {}",
                self.rank,
                message.tag(),
                message.count(),
                message.source()
            );
        }
        Ok(received)
    }

    /// Replace the peer list.
    ///
    /// The local rank is inserted at its sorted position if `peers` omits it,
    /// and the cursor restarts at the first connection. From then on only
    /// these ranks are polled and only they may be sent to, so the list has to
    /// be symmetric across ranks.
    pub fn set_connections(&mut self, peers: &[Rank]) {
        self.connections = PeerConnections::with_self(self.rank, peers);
        self.reception.reset_cursor();
        tracing::info!(
            "rank {}: {} connections {:?}",
            self.rank,
            self.connections.len(),
            self.connections.as_slice()
        );
    }

    /// Current round-robin peer list.
    pub fn connections(&self) -> &PeerConnections {
        &self.connections
    }

    /// Traffic counters.
    pub fn statistics(&self) -> &TrafficStatistics {
        &self.statistics
    }

    /// In-flight send table.
    pub fn dirty_buffers(&self) -> &DirtyBufferTracker {
        &self.dirty
    }

    /// Reception policy chosen at construction.
    pub fn reception_policy(&self) -> ReceptionPolicy {
        self.reception.policy()
    }

    /// Persistent receives currently posted.
    pub fn persistent_receives(&self) -> usize {
        match &self.reception {
            Reception::PersistentRing(ring) => ring.len(),
            _ => 0,
        }
    }

    /// Configuration the engine was built with.
    pub fn config(&self) -> &CommConfig {
        &self.config
    }

    /// This rank.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Number of ranks.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Append the traffic table to `path` and log a summary.
    pub fn append_statistics(&self, path: &Path, tags: &TagRegistry) -> CommResult<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        self.statistics.write_table(&mut file, self.rank, tags)?;
        tracing::info!(
            "rank {}: sent {} messages, received {}, active peers {:?}",
            self.rank,
            self.statistics.sent(),
            self.statistics.received(),
            self.statistics.active_peers()
        );
        Ok(())
    }

    /// Release transport resources: persistent receives are cancelled.
    pub fn shutdown<T: Transport + ?Sized>(self, transport: &mut T) -> CommResult<()> {
        if !self.dirty.is_empty() {
            tracing::warn!(
                "rank {}: shutting down with {} sends in flight",
                self.rank,
                self.dirty.len()
            );
        }
        self.reception.shutdown(transport)
    }
}
